//! The work serializer: a single-threaded, FIFO, borrowed-thread executor
//! that all policy code runs on (spec §5).

use std::collections::VecDeque;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

struct QueuedCallback {
    callback: Callback,
    #[allow(dead_code)]
    location: &'static Location<'static>,
}

/// Schedules callbacks so that, for any one `WorkSerializer`, callbacks
/// run one at a time and in the order they were submitted — regardless of
/// which thread submits them.
///
/// A caller that invokes [`WorkSerializer::run`] "borrows" its thread: if
/// no other thread currently owns the serializer, the callback (and any
/// work queued while it runs, including further `run`/`schedule` calls
/// made re-entrantly) executes before `run` returns. Otherwise the
/// callback is queued for the thread that does own it.
pub struct WorkSerializer {
    queue: Mutex<VecDeque<QueuedCallback>>,
    owned: AtomicBool,
}

impl Default for WorkSerializer {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            owned: AtomicBool::new(false),
        }
    }
}

impl WorkSerializer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `callback` on the serializer, taking ownership of the calling
    /// thread to drain the queue if no other thread currently owns it.
    #[track_caller]
    pub fn run(&self, callback: impl FnOnce() + Send + 'static) {
        self.enqueue(callback);
        self.drain_if_unowned();
    }

    /// Queues `callback` to run later; never runs inline. Callers holding
    /// a lock that would deadlock if a callback ran inline should use
    /// this and call [`WorkSerializer::drain_queue`] once it is safe.
    #[track_caller]
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        self.enqueue(callback);
    }

    /// Forces the queue to drain on the calling thread.
    pub fn drain_queue(&self) {
        self.drain_if_unowned();
    }

    /// Number of callbacks currently queued (including one in flight, if
    /// any thread is draining). Exposed for tests/introspection only.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    #[track_caller]
    fn enqueue(&self, callback: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(QueuedCallback {
            callback: Box::new(callback),
            location: Location::caller(),
        });
    }

    fn drain_if_unowned(&self) {
        if self
            .owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread (or an enclosing `run` on this same thread)
            // already owns the serializer; it will drain our entry.
            return;
        }
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(item) => (item.callback)(),
                None => break,
            }
        }
        self.owned.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_executes_inline_when_unowned() {
        let ws = WorkSerializer::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ws.run(move || ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn callbacks_run_in_fifo_order() {
        let ws = WorkSerializer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        // Queue a first callback that, while running, submits two more —
        // these must run after it, in submission order.
        let o1 = order.clone();
        let ws2 = ws.clone();
        let o2 = order.clone();
        let o3 = order.clone();
        ws.run(move || {
            o1.lock().push(1);
            let ws3 = ws2.clone();
            ws2.schedule(move || o2.lock().push(2));
            ws3.schedule(move || o3.lock().push(3));
        });
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn schedule_does_not_run_until_drained() {
        let ws = WorkSerializer::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        ws.schedule(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        ws.drain_queue();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_run_calls_serialize() {
        let ws = WorkSerializer::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let ws = ws.clone();
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                ws.run(move || {
                    log.lock().push(i);
                    // Simulate doing a little work while "holding" the
                    // serializer so overlap would be visible if the
                    // implementation allowed concurrent execution.
                    std::thread::yield_now();
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.lock().len(), 8);
    }
}
