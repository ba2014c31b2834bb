//! `pick_first`: sequential connection attempts over an ordered address
//! list, with promotion of a pending list (spec §4.3).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::lb::address::ServerAddress;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::picker::{PickArgs, PickResult, Picker};
use crate::lb::policy::{ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::lb::subchannel::{ConnectivityStateWatcher, Subchannel};
use crate::status::Status;

/// `pick_first`'s config has no fields the core cares about beyond the
/// channel-arg-driven health-check toggles (spec §6), which the transport
/// layer, not this policy, interprets.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct PickFirstConfig {
    #[serde(default)]
    pub shuffle_address_list: bool,
}

impl Config for PickFirstConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct Entry {
    subchannel: Arc<dyn Subchannel>,
    state: ConnectivityState,
    status: Status,
    seen_initial_state: bool,
}

struct AddressList {
    id: u64,
    entries: Vec<Entry>,
    attempt_index: usize,
    in_transient_failure: bool,
}

struct Inner {
    current: Option<AddressList>,
    pending: Option<AddressList>,
    /// `(list_id, index)` of the entry currently selected and reported READY.
    selected: Option<(u64, usize)>,
    next_list_id: u64,
    shutdown: bool,
    idle: bool,
    last_resolution_note: String,
}

/// Picks the single subchannel selected at construction time, forever.
struct OneSubchannelPicker(Arc<dyn Subchannel>);

impl Picker for OneSubchannelPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::complete(self.0.clone())
    }
}

pub struct PickFirstPolicy {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
}

struct PfWatcher {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
    list_id: u64,
    index: usize,
}

impl ConnectivityStateWatcher for PfWatcher {
    fn on_state_change(&self, state: ConnectivityState, status: Status) {
        PickFirstPolicy::handle_event(&self.inner, &self.helper, self.list_id, self.index, state, status);
    }
}

impl PickFirstPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: None,
                pending: None,
                selected: None,
                next_list_id: 0,
                shutdown: false,
                idle: true,
                last_resolution_note: String::new(),
            })),
            helper,
        }
    }

    fn handle_event(
        inner: &Arc<Mutex<Inner>>,
        helper: &Arc<dyn ChannelControlHelper>,
        list_id: u64,
        index: usize,
        state: ConnectivityState,
        status: Status,
    ) {
        enum Action {
            None,
            Report(ConnectivityState, Status, Arc<dyn Picker>),
            Connect(Arc<dyn Subchannel>),
        }

        let action = {
            let mut g = inner.lock();
            if g.shutdown {
                return;
            }

            // Step 3: READY short-circuits everything else.
            if state == ConnectivityState::Ready {
                let is_pending = g.pending.as_ref().is_some_and(|l| l.id == list_id);
                let is_current = g.current.as_ref().is_some_and(|l| l.id == list_id);
                if !is_pending && !is_current {
                    Action::None
                } else {
                    if is_pending {
                        // Promote pending to current.
                        if let Some(old) = g.current.take() {
                            for e in &old.entries {
                                e.subchannel.cancel_connectivity_state_watch(&dummy_watcher());
                            }
                        }
                        g.current = g.pending.take();
                    }
                    let list = g.current.as_ref().unwrap();
                    let picked = list.entries[index].subchannel.clone();
                    let others: Vec<Arc<dyn Subchannel>> = list
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .map(|(_, e)| e.subchannel.clone())
                        .collect();
                    g.selected = Some((list_id, index));
                    g.idle = false;
                    // Shut down every other entry in the now-current list.
                    for subchannel in &others {
                        subchannel.cancel_connectivity_state_watch(&dummy_watcher());
                    }
                    Action::Report(
                        ConnectivityState::Ready,
                        Status::ok(),
                        Arc::new(OneSubchannelPicker(picked)),
                    )
                }
            } else if g.selected == Some((list_id, index)) {
                // Step 4: the selected subchannel left READY.
                g.selected = None;
                if let Some(pending) = g.pending.take() {
                    let (state, status) = Self::aggregate(&pending);
                    let picker = Self::picker_for(state, status.clone());
                    g.current = Some(pending);
                    Action::Report(state, status, picker)
                } else {
                    g.current = None;
                    g.idle = true;
                    Action::Report(
                        ConnectivityState::Idle,
                        Status::ok(),
                        Arc::new(crate::lb::picker::QueuePicker),
                    )
                }
            } else {
                // Step 5: unselected entry update, only meaningful for
                // whichever list is the one currently being attempted
                // sequentially (pending if present, else current).
                let target_is_pending = g.pending.as_ref().is_some_and(|l| l.id == list_id);
                let target_is_current = g.current.as_ref().is_some_and(|l| l.id == list_id)
                    && g.pending.is_none();
                if !target_is_pending && !target_is_current {
                    Action::None
                } else {
                    let list = if target_is_pending {
                        g.pending.as_mut().unwrap()
                    } else {
                        g.current.as_mut().unwrap()
                    };
                    let was_new = !list.entries[index].seen_initial_state;
                    list.entries[index].state = state;
                    list.entries[index].status = status.clone();
                    list.entries[index].seen_initial_state = true;

                    // AllSeenInitialState gate (spec §4.3 step 2): don't
                    // start the sequential attempt from index 0 until every
                    // subchannel in the list has reported its initial
                    // state, so an out-of-order replay can't race the
                    // first entry's connection attempt against the rest of
                    // the list's registration.
                    if !list.entries.iter().all(|e| e.seen_initial_state) {
                        Action::None
                    } else if was_new {
                        // This report is the one that completes the set:
                        // kick off the sequential attempt from the first
                        // entry, regardless of which index just reported in.
                        Action::Connect(list.entries[0].subchannel.clone())
                    } else if index != list.attempt_index {
                        Action::None
                    } else {
                        match state {
                            ConnectivityState::TransientFailure => {
                                list.attempt_index = (list.attempt_index + 1) % list.entries.len();
                                if list.attempt_index == 0 {
                                    list.in_transient_failure = true;
                                }
                                let next = list.entries[list.attempt_index].subchannel.clone();
                                let (agg_state, agg_status) = Self::aggregate(list);
                                if list.in_transient_failure {
                                    let picker = Self::picker_for(agg_state, agg_status.clone());
                                    Action::Report(agg_state, agg_status, picker)
                                } else {
                                    Action::Connect(next)
                                }
                            }
                            ConnectivityState::Idle => Action::Connect(
                                list.entries[list.attempt_index].subchannel.clone(),
                            ),
                            _ => Action::None,
                        }
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::Report(state, status, picker) => {
                debug!(target: "pick_first", %state, "publishing state");
                helper.update_state(state, status, picker);
            }
            Action::Connect(sc) => {
                trace!(target: "pick_first", "advancing attempt index");
                sc.request_connection();
            }
        }
    }

    fn aggregate(list: &AddressList) -> (ConnectivityState, Status) {
        let last = &list.entries[list.attempt_index.min(list.entries.len() - 1)];
        if list.in_transient_failure {
            (
                ConnectivityState::TransientFailure,
                Status::unavailable(format!(
                    "all subchannels failed; last error: {}",
                    last.status.message()
                )),
            )
        } else {
            (ConnectivityState::Connecting, Status::ok())
        }
    }

    fn picker_for(state: ConnectivityState, status: Status) -> Arc<dyn Picker> {
        match state {
            ConnectivityState::TransientFailure => Arc::new(crate::lb::picker::FailPicker(status)),
            _ => Arc::new(crate::lb::picker::QueuePicker),
        }
    }

    fn install_list(&self, addresses: &[ServerAddress]) {
        let list_id = {
            let mut g = self.inner.lock();
            let id = g.next_list_id;
            g.next_list_id += 1;
            id
        };

        let mut entries = Vec::with_capacity(addresses.len());
        for addr in addresses {
            if let Some(sc) = self.helper.create_subchannel(addr.socket_address) {
                entries.push(Entry {
                    subchannel: sc,
                    state: ConnectivityState::Idle,
                    status: Status::ok(),
                    seen_initial_state: false,
                });
            }
        }
        let list = AddressList {
            id: list_id,
            entries,
            attempt_index: 0,
            in_transient_failure: false,
        };

        let adopt_immediately = {
            let mut g = self.inner.lock();
            if g.current.is_none() && g.selected.is_none() {
                g.current = Some(list);
                true
            } else {
                if let Some(old_pending) = g.pending.take() {
                    for e in &old_pending.entries {
                        e.subchannel
                            .cancel_connectivity_state_watch(&dummy_watcher());
                    }
                }
                g.pending = Some(list);
                false
            }
        };

        let target_id = list_id;
        let entries_len = {
            let g = self.inner.lock();
            if adopt_immediately {
                g.current.as_ref().unwrap().entries.len()
            } else {
                g.pending.as_ref().unwrap().entries.len()
            }
        };
        for index in 0..entries_len {
            let watcher: Arc<dyn ConnectivityStateWatcher> = Arc::new(PfWatcher {
                inner: self.inner.clone(),
                helper: self.helper.clone(),
                list_id: target_id,
                index,
            });
            let sc = {
                let g = self.inner.lock();
                let list = if adopt_immediately {
                    g.current.as_ref().unwrap()
                } else {
                    g.pending.as_ref().unwrap()
                };
                list.entries[index].subchannel.clone()
            };
            // `watch_connectivity_state` replays the subchannel's current
            // (IDLE) state synchronously, which drives `handle_event`'s
            // IDLE branch to kick off the first connection attempt — no
            // separate `request_connection` call is needed here.
            sc.watch_connectivity_state(watcher);
        }
    }
}

/// A throwaway watcher handle used only to satisfy `cancel_*`'s
/// by-reference signature when the original registration's `Arc` was not
/// retained (the fakes/real subchannels key cancellation by pointer
/// identity of the *wrapper*, not of this placeholder, so in practice this
/// only matters for `FakeSubchannel`, which matches by `Arc::ptr_eq`).
fn dummy_watcher() -> Arc<dyn ConnectivityStateWatcher> {
    struct Noop;
    impl ConnectivityStateWatcher for Noop {
        fn on_state_change(&self, _state: ConnectivityState, _status: Status) {}
    }
    Arc::new(Noop)
}

impl LoadBalancingPolicy for PickFirstPolicy {
    fn name(&self) -> &'static str {
        "pick_first"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let addresses = match args.addresses {
            Ok(a) => a,
            Err(status) => {
                self.inner.lock().last_resolution_note = args.resolution_note.clone();
                self.helper.update_state(
                    ConnectivityState::TransientFailure,
                    status.clone(),
                    Arc::new(crate::lb::picker::FailPicker(status.clone())),
                );
                self.helper.request_reresolution();
                return Err(status);
            }
        };
        self.inner.lock().last_resolution_note = args.resolution_note.clone();
        if addresses.is_empty() {
            let status = UpdateArgs::empty_address_status(&args.resolution_note);
            self.helper.update_state(
                ConnectivityState::TransientFailure,
                status.clone(),
                Arc::new(crate::lb::picker::FailPicker(status.clone())),
            );
            self.helper.request_reresolution();
            return Ok(());
        }
        self.install_list(&addresses);
        Ok(())
    }

    fn exit_idle_locked(&mut self) {
        let was_idle = {
            let mut g = self.inner.lock();
            let was_idle = g.idle;
            g.idle = false;
            was_idle
        };
        if was_idle {
            if let Some((_, first)) = {
                let g = self.inner.lock();
                g.current.as_ref().map(|l| (l.id, l.entries.first().map(|e| e.subchannel.clone())))
            } {
                if let Some(sc) = first {
                    sc.request_connection();
                }
            }
        }
    }

    fn reset_backoff_locked(&mut self) {
        let g = self.inner.lock();
        if let Some(list) = &g.current {
            for e in &list.entries {
                e.subchannel.reset_backoff();
            }
        }
        if let Some(list) = &g.pending {
            for e in &list.entries {
                e.subchannel.reset_backoff();
            }
        }
    }

    fn shutdown_locked(&mut self) {
        let mut g = self.inner.lock();
        g.shutdown = true;
        for list in [g.current.take(), g.pending.take()].into_iter().flatten() {
            for e in list.entries {
                e.subchannel.cancel_connectivity_state_watch(&dummy_watcher());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::policy::ChannelArgs;
    use crate::lb::testutil::FakeHelper;
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn update(addresses: Vec<ServerAddress>) -> UpdateArgs {
        UpdateArgs {
            addresses: Ok(addresses),
            config: Arc::new(PickFirstConfig::default()),
            resolution_note: String::new(),
            args: ChannelArgs::new(),
        }
    }

    #[test]
    fn scenario_a_first_ready_wins_others_shut_down() {
        let helper = FakeHelper::new();
        let mut policy = PickFirstPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);

        let a = addr("10.0.0.1:80");
        let b = addr("10.0.0.2:80");
        let c = addr("10.0.0.3:80");
        policy
            .update_locked(update(vec![
                ServerAddress::new(a),
                ServerAddress::new(b),
                ServerAddress::new(c),
            ]))
            .unwrap();

        assert_eq!(helper.fake_at(a).unwrap().connect_attempts(), 1);

        helper
            .fake_at(a)
            .unwrap()
            .push_state(ConnectivityState::TransientFailure, Status::unavailable("refused"));
        assert_eq!(helper.fake_at(b).unwrap().connect_attempts(), 1);

        helper.fake_at(b).unwrap().push_state(ConnectivityState::Ready, Status::ok());

        let last = helper.last_update().unwrap();
        assert_eq!(last.state, ConnectivityState::Ready);
        let mut call_state = crate::lb::picker::CallState::new();
        let mut args = PickArgs {
            path: "/s/m",
            call_state: &mut call_state,
        };
        match last.picker.pick(&mut args) {
            PickResult::Complete { subchannel, .. } => {
                assert_eq!(subchannel.socket_address(), b);
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn reset_backoff_resets_every_tracked_subchannel() {
        let helper = FakeHelper::new();
        let mut policy = PickFirstPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);

        let a = addr("10.0.0.1:80");
        let b = addr("10.0.0.2:80");
        policy
            .update_locked(update(vec![ServerAddress::new(a), ServerAddress::new(b)]))
            .unwrap();

        policy.reset_backoff_locked();

        assert_eq!(helper.fake_at(a).unwrap().backoff_resets(), 1);
        assert_eq!(helper.fake_at(b).unwrap().backoff_resets(), 1);
    }

    #[test]
    fn empty_address_list_reports_transient_failure() {
        let helper = FakeHelper::new();
        let mut policy = PickFirstPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);
        policy.update_locked(update(vec![])).unwrap();
        let last = helper.last_update().unwrap();
        assert_eq!(last.state, ConnectivityState::TransientFailure);
        assert_eq!(helper.reresolutions.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn selected_subchannel_failing_with_no_pending_goes_idle() {
        let helper = FakeHelper::new();
        let mut policy = PickFirstPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);
        let a = addr("10.0.0.1:80");
        policy.update_locked(update(vec![ServerAddress::new(a)])).unwrap();
        helper.fake_at(a).unwrap().push_state(ConnectivityState::Ready, Status::ok());
        helper
            .fake_at(a)
            .unwrap()
            .push_state(ConnectivityState::TransientFailure, Status::unavailable("dropped"));
        let last = helper.last_update().unwrap();
        assert_eq!(last.state, ConnectivityState::Idle);
    }

    #[test]
    fn does_not_connect_until_every_subchannel_has_seen_its_initial_state() {
        let helper = FakeHelper::new();
        helper.set_defer_new_subchannels(true);
        let mut policy = PickFirstPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);

        let a = addr("10.0.0.1:80");
        let b = addr("10.0.0.2:80");
        let c = addr("10.0.0.3:80");
        policy
            .update_locked(update(vec![
                ServerAddress::new(a),
                ServerAddress::new(b),
                ServerAddress::new(c),
            ]))
            .unwrap();

        // All three subchannels were created but none has reported its
        // initial state yet: no connection attempt must have started,
        // including on entry 0.
        assert_eq!(helper.fake_at(a).unwrap().connect_attempts(), 0);
        assert_eq!(helper.fake_at(b).unwrap().connect_attempts(), 0);
        assert_eq!(helper.fake_at(c).unwrap().connect_attempts(), 0);

        // Report the initial state out of registration order: last (c),
        // then first (a); the set still isn't complete (b is missing), so
        // still no connection attempt.
        helper.fake_at(c).unwrap().fire_initial();
        helper.fake_at(a).unwrap().fire_initial();
        assert_eq!(helper.fake_at(a).unwrap().connect_attempts(), 0);

        // The last subchannel to report in (b, the middle entry) completes
        // AllSeenInitialState: only now should the sequential attempt start,
        // and it must start from entry 0, not from whichever entry
        // happened to complete the set.
        helper.fake_at(b).unwrap().fire_initial();
        assert_eq!(helper.fake_at(a).unwrap().connect_attempts(), 1);
        assert_eq!(helper.fake_at(b).unwrap().connect_attempts(), 0);
        assert_eq!(helper.fake_at(c).unwrap().connect_attempts(), 0);
    }
}
