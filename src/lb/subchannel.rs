//! Subchannel interface and the decorator used by interior policies to
//! interpose on connectivity notifications (spec §3, §4.2).

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::lb::connectivity::ConnectivityState;
use crate::status::Status;

/// Observes connectivity state changes of a subchannel. There is only one
/// invocation of `on_state_change` at a time per watcher.
pub trait ConnectivityStateWatcher: Send + Sync {
    fn on_state_change(&self, state: ConnectivityState, status: Status);
}

/// Opaque watcher for out-of-band backend-metric data. The same report
/// object may be routed to multiple consumers (e.g. the WRR weight
/// updater and the outlier detector), so data watchers are shared, not
/// owned, by the registrant.
pub trait DataWatcher: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Represents an intent to maintain one connection to one address.
///
/// Identity of a subchannel is stable per address within a channel; it is
/// shared between the LB policy that created it and any in-flight call
/// that was picked to use it. A subchannel may be wrapped by any number of
/// decorators; wrappers delegate all operations to the inner subchannel
/// and interpose on watcher callbacks (see [`SubchannelWrapper`]).
pub trait Subchannel: Any + Send + Sync {
    fn socket_address(&self) -> SocketAddr;

    /// Lets interior policies that wrap subchannels (`xds_override_host`)
    /// downcast a pick's subchannel back to a concrete wrapper type.
    fn as_any(&self) -> &dyn Any;

    /// Starts watching connectivity state. The first callback is delivered
    /// ~immediately; there can be only one *logical* watcher per caller,
    /// but nothing prevents multiple distinct callers (e.g. several
    /// wrapper layers) from each registering their own.
    fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>);

    /// Cancels a previously registered watch. No-op if already cancelled
    /// or if the subchannel has been shut down.
    fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityStateWatcher>);

    /// Attempts to connect. No effect if already connected or connecting.
    fn request_connection(&self);

    /// Resets backoff state; if a connection attempt is due, it starts
    /// immediately instead of waiting out the remaining backoff delay.
    fn reset_backoff(&self);

    fn add_data_watcher(&self, key: &'static str, watcher: Arc<dyn DataWatcher>);
    fn cancel_data_watcher(&self, key: &'static str);
}

/// A watcher inserted between a wrapped subchannel and the real watcher
/// registered by whoever called [`SubchannelWrapper::watch_connectivity_state`].
/// Remembers the last observed `(state, status)` so ejection/unejection
/// can synthesize notifications without touching the inner subchannel.
struct WatcherWrapper {
    inner_watcher: Arc<dyn ConnectivityStateWatcher>,
    last: Mutex<(ConnectivityState, Status)>,
    ejected: Arc<AtomicBool>,
}

impl ConnectivityStateWatcher for WatcherWrapper {
    fn on_state_change(&self, state: ConnectivityState, status: Status) {
        *self.last.lock() = (state, status.clone());
        if self.ejected.load(Ordering::Acquire) {
            // Ejected: the real connectivity state is recorded above, but
            // watchers only see the synthetic TRANSIENT_FAILURE emitted by
            // `SubchannelWrapper::eject`.
            return;
        }
        self.inner_watcher.on_state_change(state, status);
    }
}

/// A decorator around a real [`Subchannel`] that lets an interior policy
/// (outlier detection) force it to report `TRANSIENT_FAILURE` to every
/// watcher, independent of the inner subchannel's real state.
pub struct SubchannelWrapper {
    inner: Arc<dyn Subchannel>,
    ejected: Arc<AtomicBool>,
    watchers: Mutex<Vec<Arc<WatcherWrapper>>>,
}

const EJECTED_REASON: &str = "subchannel ejected by outlier detection";

impl SubchannelWrapper {
    pub fn new(inner: Arc<dyn Subchannel>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ejected: Arc::new(AtomicBool::new(false)),
            watchers: Mutex::new(Vec::new()),
        })
    }

    pub fn inner(&self) -> &Arc<dyn Subchannel> {
        &self.inner
    }

    pub fn is_ejected(&self) -> bool {
        self.ejected.load(Ordering::Acquire)
    }

    /// Forces every watcher of this wrapper to see `TRANSIENT_FAILURE`
    /// without consulting the inner subchannel.
    pub fn eject(&self) {
        self.ejected.store(true, Ordering::Release);
        for w in self.watchers.lock().iter() {
            w.inner_watcher.on_state_change(
                ConnectivityState::TransientFailure,
                Status::unavailable(EJECTED_REASON),
            );
        }
    }

    /// Restores the last real `(state, status)` observed from the inner
    /// subchannel to every watcher.
    pub fn uneject(&self) {
        self.ejected.store(false, Ordering::Release);
        for w in self.watchers.lock().iter() {
            let (state, status) = w.last.lock().clone();
            w.inner_watcher.on_state_change(state, status);
        }
    }
}

impl Subchannel for SubchannelWrapper {
    fn socket_address(&self) -> SocketAddr {
        self.inner.socket_address()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        let wrapped = Arc::new(WatcherWrapper {
            inner_watcher: watcher,
            last: Mutex::new((ConnectivityState::Idle, Status::ok())),
            ejected: self.ejected.clone(),
        });
        // A wrapper created after ejection must enter the ejected state
        // immediately.
        if self.ejected.load(Ordering::Acquire) {
            wrapped.inner_watcher.on_state_change(
                ConnectivityState::TransientFailure,
                Status::unavailable(EJECTED_REASON),
            );
        }
        self.watchers.lock().push(wrapped.clone());
        self.inner.watch_connectivity_state(wrapped);
    }

    fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityStateWatcher>) {
        let mut watchers = self.watchers.lock();
        if let Some(pos) = watchers
            .iter()
            .position(|w| Arc::ptr_eq(&w.inner_watcher, watcher))
        {
            let wrapped = watchers.remove(pos);
            let as_dyn: Arc<dyn ConnectivityStateWatcher> = wrapped;
            self.inner.cancel_connectivity_state_watch(&as_dyn);
        }
    }

    fn request_connection(&self) {
        self.inner.request_connection();
    }

    fn reset_backoff(&self) {
        self.inner.reset_backoff();
    }

    fn add_data_watcher(&self, key: &'static str, watcher: Arc<dyn DataWatcher>) {
        self.inner.add_data_watcher(key, watcher);
    }

    fn cancel_data_watcher(&self, key: &'static str) {
        self.inner.cancel_data_watcher(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::testutil::FakeSubchannel;
    use std::sync::Mutex as StdMutex;

    struct RecordingWatcher {
        events: Arc<StdMutex<Vec<(ConnectivityState, Status)>>>,
    }
    impl ConnectivityStateWatcher for RecordingWatcher {
        fn on_state_change(&self, state: ConnectivityState, status: Status) {
            self.events.lock().unwrap().push((state, status));
        }
    }

    #[test]
    fn eject_emits_synthetic_transient_failure_without_touching_inner() {
        let fake = FakeSubchannel::new("127.0.0.1:1".parse().unwrap());
        let wrapper = SubchannelWrapper::new(fake.clone());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let watcher: Arc<dyn ConnectivityStateWatcher> = Arc::new(RecordingWatcher {
            events: events.clone(),
        });
        wrapper.watch_connectivity_state(watcher);
        fake.push_state(ConnectivityState::Ready, Status::ok());

        wrapper.eject();
        let last = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.0, ConnectivityState::TransientFailure);
        assert_eq!(fake.state(), ConnectivityState::Ready);
    }

    #[test]
    fn uneject_restores_last_real_state() {
        let fake = FakeSubchannel::new("127.0.0.1:1".parse().unwrap());
        let wrapper = SubchannelWrapper::new(fake.clone());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let watcher: Arc<dyn ConnectivityStateWatcher> = Arc::new(RecordingWatcher {
            events: events.clone(),
        });
        wrapper.watch_connectivity_state(watcher);
        fake.push_state(ConnectivityState::Ready, Status::ok());
        wrapper.eject();
        wrapper.uneject();

        let last = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.0, ConnectivityState::Ready);
    }

    #[test]
    fn wrapper_created_after_ejection_starts_ejected() {
        let fake = FakeSubchannel::new("127.0.0.1:1".parse().unwrap());
        let wrapper = SubchannelWrapper::new(fake.clone());
        wrapper.eject();

        let events = Arc::new(StdMutex::new(Vec::new()));
        let watcher: Arc<dyn ConnectivityStateWatcher> = Arc::new(RecordingWatcher {
            events: events.clone(),
        });
        wrapper.watch_connectivity_state(watcher);

        let last = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.0, ConnectivityState::TransientFailure);
    }
}
