//! `ChildPolicyHandler`: swaps a child's underlying policy type safely
//! when its config name changes, without dropping picks in flight (spec
//! §4.1 "Child policy handler").

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::lb::connectivity::ConnectivityState;
use crate::lb::picker::Picker;
use crate::lb::policy::{ChannelControlHelper, LoadBalancingPolicy, TraceSeverity, UpdateArgs};
use crate::lb::subchannel::Subchannel;
use crate::status::Status;

struct Slot {
    id: u64,
    name: Arc<str>,
    policy: Box<dyn LoadBalancingPolicy>,
}

struct Inner {
    current: Option<Slot>,
    pending: Option<Slot>,
    next_id: u64,
    parent: Arc<dyn ChannelControlHelper>,
    /// Set while `update_slot` has pulled a slot out of `current`/`pending`
    /// to call its `update_locked` without holding the lock: `(id,
    /// was_current)`, so a synchronous `update_state` callback made from
    /// within that call still sees the slot's role.
    inflight: Option<(u64, bool)>,
}

/// A helper handed to one child slot; forwards `create_subchannel` and
/// `request_reresolution` straight through, but intercepts `update_state`
/// to implement the graceful-handoff protocol: while a pending child has
/// not yet reported `READY`, the currently-serving child's picker keeps
/// being the one forwarded to the real parent.
struct SlotHelper {
    id: u64,
    shared: Arc<Mutex<Inner>>,
}

impl ChannelControlHelper for SlotHelper {
    fn create_subchannel(&self, address: SocketAddr) -> Option<Arc<dyn Subchannel>> {
        self.shared.lock().parent.create_subchannel(address)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let parent = {
            let mut inner = self.shared.lock();
            let is_pending = inner.pending.as_ref().is_some_and(|p| p.id == self.id)
                || inner.inflight == Some((self.id, false));
            let is_current = inner.current.as_ref().is_some_and(|c| c.id == self.id)
                || inner.inflight == Some((self.id, true));
            if is_pending {
                if state == ConnectivityState::Ready {
                    // Promote: destroy the old current, pending becomes current.
                    if let Some(mut old) = inner.current.take() {
                        old.policy.shutdown_locked();
                    }
                    inner.current = inner.pending.take();
                    Some(inner.parent.clone())
                } else if inner.current.is_none() {
                    // Nothing else is serving; surface the pending
                    // child's state directly until it promotes.
                    Some(inner.parent.clone())
                } else {
                    None
                }
            } else if is_current {
                Some(inner.parent.clone())
            } else {
                // Stale child (already replaced); ignore.
                None
            }
        };
        if let Some(parent) = parent {
            parent.update_state(state, status, picker);
        }
    }

    fn request_reresolution(&self) {
        self.shared.lock().parent.request_reresolution();
    }

    fn add_trace_event(&self, severity: TraceSeverity, message: &str) {
        self.shared.lock().parent.add_trace_event(severity, message);
    }
}

/// Owns at most two children at a time: the one currently serving picks,
/// and (during a config-driven policy-type swap) a pending replacement.
/// Cheap to clone: every clone shares the same underlying children.
#[derive(Clone)]
pub struct ChildPolicyHandler {
    inner: Arc<Mutex<Inner>>,
}

impl ChildPolicyHandler {
    pub fn new(parent: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: None,
                pending: None,
                next_id: 0,
                parent,
                inflight: None,
            })),
        }
    }

    pub fn has_child(&self) -> bool {
        let inner = self.inner.lock();
        inner.current.is_some() || inner.pending.is_some()
    }

    /// Updates the child, constructing a fresh instance via `make` only
    /// when `name` differs from both the currently-serving and the
    /// pending child (a genuine policy-type swap).
    pub fn update_locked(
        &self,
        name: impl Into<Arc<str>>,
        make: impl FnOnce(Arc<dyn ChannelControlHelper>) -> Box<dyn LoadBalancingPolicy>,
        args: UpdateArgs,
    ) -> Result<(), Status> {
        let target_id = self.ensure_slot(name.into(), make);
        self.update_slot(target_id, args)
    }

    fn ensure_slot(
        &self,
        name: Arc<str>,
        make: impl FnOnce(Arc<dyn ChannelControlHelper>) -> Box<dyn LoadBalancingPolicy>,
    ) -> u64 {
        let existing = {
            let inner = self.inner.lock();
            inner
                .pending
                .as_ref()
                .filter(|p| *p.name == *name)
                .map(|p| p.id)
                .or_else(|| {
                    inner
                        .current
                        .as_ref()
                        .filter(|c| *c.name == *name)
                        .map(|c| c.id)
                })
        };
        if let Some(id) = existing {
            return id;
        }

        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };
        let helper: Arc<dyn ChannelControlHelper> = Arc::new(SlotHelper {
            id,
            shared: self.inner.clone(),
        });
        let policy = make(helper);
        let slot = Slot { id, name, policy };

        let mut inner = self.inner.lock();
        if inner.current.is_none() && inner.pending.is_none() {
            inner.current = Some(slot);
        } else {
            if let Some(mut old_pending) = inner.pending.take() {
                old_pending.policy.shutdown_locked();
            }
            inner.pending = Some(slot);
        }
        id
    }

    fn update_slot(&self, id: u64, args: UpdateArgs) -> Result<(), Status> {
        let mut slot = {
            let mut inner = self.inner.lock();
            if inner.current.as_ref().is_some_and(|c| c.id == id) {
                inner.inflight = Some((id, true));
                inner.current.take()
            } else if inner.pending.as_ref().is_some_and(|p| p.id == id) {
                inner.inflight = Some((id, false));
                inner.pending.take()
            } else {
                None
            }
        };
        let result = if let Some(s) = &mut slot {
            s.policy.update_locked(args)
        } else {
            Ok(())
        };
        self.inner.lock().inflight = None;
        if let Some(s) = slot {
            let mut inner = self.inner.lock();
            let belongs_as_current = inner.current.is_none();
            if belongs_as_current {
                inner.current = Some(s);
            } else if inner.pending.is_none() {
                inner.pending = Some(s);
            } else {
                // A swap raced with this update; the pending slot is
                // already authoritative, so drop this stale one.
                let mut s = s;
                s.policy.shutdown_locked();
            }
        }
        result
    }

    pub fn shutdown_locked(&self) {
        let mut inner = self.inner.lock();
        if let Some(mut c) = inner.current.take() {
            c.policy.shutdown_locked();
        }
        if let Some(mut p) = inner.pending.take() {
            p.policy.shutdown_locked();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::address::ServerAddress;
    use crate::lb::picker::QueuePicker;
    use crate::lb::policy::{ChannelArgs, Config};
    use crate::lb::testutil::FakeHelper;
    use std::fmt;

    #[derive(Debug)]
    struct NoopConfig;
    impl Config for NoopConfig {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct StubPolicy {
        name: &'static str,
        helper: Arc<dyn ChannelControlHelper>,
        ready_on_update: bool,
    }
    impl LoadBalancingPolicy for StubPolicy {
        fn name(&self) -> &'static str {
            self.name
        }
        fn update_locked(&mut self, _args: UpdateArgs) -> Result<(), Status> {
            let state = if self.ready_on_update {
                ConnectivityState::Ready
            } else {
                ConnectivityState::Connecting
            };
            self.helper
                .update_state(state, Status::ok(), Arc::new(QueuePicker));
            Ok(())
        }
        fn shutdown_locked(&mut self) {}
    }
    impl fmt::Debug for StubPolicy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "StubPolicy({})", self.name)
        }
    }

    fn args() -> UpdateArgs {
        UpdateArgs {
            addresses: Ok(Vec::<ServerAddress>::new()),
            config: Arc::new(NoopConfig),
            resolution_note: String::new(),
            args: ChannelArgs::new(),
        }
    }

    #[test]
    fn first_child_becomes_current_immediately() {
        let parent = FakeHelper::new();
        let handler = ChildPolicyHandler::new(parent.clone() as Arc<dyn ChannelControlHelper>);
        handler
            .update_locked(
                "a",
                |h| {
                    Box::new(StubPolicy {
                        name: "a",
                        helper: h,
                        ready_on_update: true,
                    })
                },
                args(),
            )
            .unwrap();
        assert_eq!(parent.last_update().unwrap().state, ConnectivityState::Ready);
    }

    #[test]
    fn swap_keeps_old_serving_until_pending_is_ready() {
        let parent = FakeHelper::new();
        let parent_dyn = parent.clone() as Arc<dyn ChannelControlHelper>;
        let handler = ChildPolicyHandler::new(parent_dyn);
        handler
            .update_locked(
                "a",
                |h| {
                    Box::new(StubPolicy {
                        name: "a",
                        helper: h,
                        ready_on_update: true,
                    })
                },
                args(),
            )
            .unwrap();
        assert_eq!(parent.last_update().unwrap().state, ConnectivityState::Ready);

        // Swap to policy "b", which does not go ready immediately: "a"
        // keeps serving, so the parent should not see a new update.
        let updates_before = parent.updates.lock().len();
        handler
            .update_locked(
                "b",
                |h| {
                    Box::new(StubPolicy {
                        name: "b",
                        helper: h,
                        ready_on_update: false,
                    })
                },
                args(),
            )
            .unwrap();
        assert_eq!(parent.updates.lock().len(), updates_before);

        // Now push "b" to ready by re-updating it; it must promote.
        handler
            .update_locked(
                "b",
                |h| {
                    Box::new(StubPolicy {
                        name: "b",
                        helper: h,
                        ready_on_update: true,
                    })
                },
                args(),
            )
            .unwrap();
        assert_eq!(parent.last_update().unwrap().state, ConnectivityState::Ready);
    }
}
