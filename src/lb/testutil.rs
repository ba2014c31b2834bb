//! Test-only fakes for driving the LB policy tree without a real
//! transport, in the spirit of `crate::client::channel::tests`'s
//! `MockXdsManager`/`TestServer` fakes, but scoped to the LB core.

#![cfg(test)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::lb::connectivity::ConnectivityState;
use crate::lb::picker::Picker;
use crate::lb::policy::{ChannelControlHelper, ChannelStateUpdate};
use crate::lb::subchannel::{ConnectivityStateWatcher, DataWatcher, Subchannel};
use crate::status::Status;

/// A hand-driven subchannel: tests push connectivity transitions with
/// [`FakeSubchannel::push_state`] and assert on [`FakeSubchannel::connect_attempts`].
pub(crate) struct FakeSubchannel {
    addr: SocketAddr,
    state: Mutex<(ConnectivityState, Status)>,
    watchers: Mutex<Vec<Arc<dyn ConnectivityStateWatcher>>>,
    data_watchers: Mutex<HashMap<&'static str, Arc<dyn DataWatcher>>>,
    connect_attempts: AtomicUsize,
    backoff_resets: AtomicUsize,
    /// When set, `watch_connectivity_state` registers the watcher without
    /// replaying the current state; a test drives the initial replay later
    /// with [`FakeSubchannel::fire_initial`] to control reporting order.
    defer_initial: bool,
}

impl FakeSubchannel {
    pub(crate) fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            state: Mutex::new((ConnectivityState::Idle, Status::ok())),
            watchers: Mutex::new(Vec::new()),
            data_watchers: Mutex::new(HashMap::new()),
            connect_attempts: AtomicUsize::new(0),
            backoff_resets: AtomicUsize::new(0),
            defer_initial: false,
        })
    }

    pub(crate) fn new_deferred(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            state: Mutex::new((ConnectivityState::Idle, Status::ok())),
            watchers: Mutex::new(Vec::new()),
            data_watchers: Mutex::new(HashMap::new()),
            connect_attempts: AtomicUsize::new(0),
            backoff_resets: AtomicUsize::new(0),
            defer_initial: true,
        })
    }

    /// Replays the current state to every registered watcher, for a
    /// subchannel created with [`FakeSubchannel::new_deferred`].
    pub(crate) fn fire_initial(&self) {
        let (state, status) = self.state.lock().clone();
        for w in self.watchers.lock().iter() {
            w.on_state_change(state, status.clone());
        }
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.state.lock().0
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn backoff_resets(&self) -> usize {
        self.backoff_resets.load(Ordering::Relaxed)
    }

    pub(crate) fn push_state(&self, state: ConnectivityState, status: Status) {
        *self.state.lock() = (state, status.clone());
        for w in self.watchers.lock().iter() {
            w.on_state_change(state, status.clone());
        }
    }
}

impl Subchannel for FakeSubchannel {
    fn socket_address(&self) -> SocketAddr {
        self.addr
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        if !self.defer_initial {
            let (state, status) = self.state.lock().clone();
            watcher.on_state_change(state, status);
        }
        self.watchers.lock().push(watcher);
    }

    fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityStateWatcher>) {
        self.watchers.lock().retain(|w| !Arc::ptr_eq(w, watcher));
    }

    fn request_connection(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn reset_backoff(&self) {
        self.backoff_resets.fetch_add(1, Ordering::Relaxed);
    }

    fn add_data_watcher(&self, key: &'static str, watcher: Arc<dyn DataWatcher>) {
        self.data_watchers.lock().insert(key, watcher);
    }

    fn cancel_data_watcher(&self, key: &'static str) {
        self.data_watchers.lock().remove(key);
    }
}

/// Records every call a policy under test makes on its parent helper.
pub(crate) struct FakeHelper {
    pub(crate) created: Mutex<Vec<SocketAddr>>,
    pub(crate) updates: Mutex<Vec<ChannelStateUpdate>>,
    pub(crate) reresolutions: AtomicUsize,
    subchannels: Mutex<HashMap<SocketAddr, Arc<FakeSubchannel>>>,
    /// When set, newly created subchannels defer their initial state
    /// replay until a test fires it explicitly (see `FakeSubchannel::
    /// fire_initial`), to exercise ordering-sensitive gates.
    defer_new_subchannels: std::sync::atomic::AtomicBool,
}

impl FakeHelper {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            reresolutions: AtomicUsize::new(0),
            subchannels: Mutex::new(HashMap::new()),
            defer_new_subchannels: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub(crate) fn set_defer_new_subchannels(&self, defer: bool) {
        self.defer_new_subchannels.store(defer, Ordering::Relaxed);
    }

    pub(crate) fn last_update(&self) -> Option<ChannelStateUpdate> {
        self.updates.lock().last().cloned()
    }

    pub(crate) fn fake_at(&self, addr: SocketAddr) -> Option<Arc<FakeSubchannel>> {
        self.subchannels.lock().get(&addr).cloned()
    }
}

impl ChannelControlHelper for FakeHelper {
    fn create_subchannel(&self, addr: SocketAddr) -> Option<Arc<dyn Subchannel>> {
        self.created.lock().push(addr);
        let defer = self.defer_new_subchannels.load(Ordering::Relaxed);
        let sc = self
            .subchannels
            .lock()
            .entry(addr)
            .or_insert_with(|| {
                if defer {
                    FakeSubchannel::new_deferred(addr)
                } else {
                    FakeSubchannel::new(addr)
                }
            })
            .clone();
        Some(sc as Arc<dyn Subchannel>)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        self.updates.lock().push(ChannelStateUpdate {
            state,
            status,
            picker,
        });
    }

    fn request_reresolution(&self) {
        self.reresolutions.fetch_add(1, Ordering::Relaxed);
    }
}
