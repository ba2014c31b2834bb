//! `priority`: chooses among named children in a declared order, falling
//! back to a lower priority only after a failover timer elapses (spec
//! §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::lb::address::ServerAddress;
use crate::lb::child_handler::ChildPolicyHandler;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::helper::ForwardingChannelControlHelper;
use crate::lb::picker::{Picker, QueuePicker};
use crate::lb::policy::{ChannelArgs, ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::status::Status;

pub const CHILD_RETENTION_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChildEntryConfig {
    pub config_name: String,
    #[serde(default)]
    pub ignore_reresolution: bool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PriorityConfig {
    pub children: HashMap<String, ChildEntryConfig>,
    pub priorities: Vec<String>,
}

impl Config for PriorityConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct ChildState {
    handler: ChildPolicyHandler,
    state: ConnectivityState,
    status: Status,
    picker: Arc<dyn Picker>,
    failover_epoch: u64,
    deactivation_epoch: Option<u64>,
    seen_ready_or_idle_since_tf: bool,
    in_config: bool,
}

struct Inner {
    children: HashMap<String, ChildState>,
    priorities: Vec<String>,
    current_priority: Option<usize>,
    current_child_from_before_update: Option<String>,
    failover_timeout: Duration,
    next_epoch: u64,
    shutdown: bool,
    /// Per-priority child config from the most recent resolver update, kept
    /// around so `choose_priority` can lazily materialize a missing
    /// priority's child the first time its scan reaches it.
    child_configs: HashMap<String, ChildEntryConfig>,
    pending_addresses: Result<Vec<ServerAddress>, Status>,
    pending_config: Option<Arc<dyn Config>>,
    pending_resolution_note: String,
}

/// A helper handed to one named priority's child: intercepts
/// `update_state` to record the child's state/picker for `ChoosePriority`
/// and drive the failover timer, instead of forwarding straight to the
/// real parent (spec §4.5's per-child state lives here, not on the raw
/// parent helper).
struct PriorityChildHelper {
    inner: Arc<dyn ChannelControlHelper>,
    shared: Arc<Mutex<Inner>>,
    name: String,
}

impl ForwardingChannelControlHelper for PriorityChildHelper {
    fn inner(&self) -> &Arc<dyn ChannelControlHelper> {
        &self.inner
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let restart_failover = {
            let mut g = self.shared.lock();
            let mut restart = false;
            if let Some(child) = g.children.get_mut(&self.name) {
                match state {
                    ConnectivityState::TransientFailure => child.seen_ready_or_idle_since_tf = false,
                    ConnectivityState::Ready | ConnectivityState::Idle => {
                        child.seen_ready_or_idle_since_tf = true
                    }
                    ConnectivityState::Connecting if child.seen_ready_or_idle_since_tf => {
                        child.seen_ready_or_idle_since_tf = false;
                        restart = true;
                    }
                    _ => {}
                }
                child.state = state;
                child.status = status;
                child.picker = picker;
            }
            restart
        };
        if restart_failover {
            start_failover_timer(&self.shared, &self.inner, self.name.clone());
        }
        PriorityPolicy::choose_priority(&self.shared, &self.inner);
    }
}

fn start_failover_timer(shared: &Arc<Mutex<Inner>>, helper: &Arc<dyn ChannelControlHelper>, name: String) {
    let (epoch, timeout) = {
        let mut g = shared.lock();
        let epoch = g.next_epoch;
        g.next_epoch += 1;
        if let Some(c) = g.children.get_mut(&name) {
            c.failover_epoch = epoch;
        }
        (epoch, g.failover_timeout)
    };
    let inner = shared.clone();
    let helper = helper.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        PriorityPolicy::on_failover_fired(&inner, &helper, &name, epoch);
    });
}

pub struct PriorityPolicy {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
}

impl PriorityPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                children: HashMap::new(),
                priorities: Vec::new(),
                current_priority: None,
                current_child_from_before_update: None,
                failover_timeout: DEFAULT_FAILOVER_TIMEOUT,
                next_epoch: 0,
                shutdown: false,
                child_configs: HashMap::new(),
                pending_addresses: Ok(Vec::new()),
                pending_config: None,
                pending_resolution_note: String::new(),
            })),
            helper,
        }
    }

    fn on_failover_fired(inner: &Arc<Mutex<Inner>>, helper: &Arc<dyn ChannelControlHelper>, name: &str, epoch: u64) {
        {
            let mut g = inner.lock();
            if g.shutdown {
                return;
            }
            let Some(child) = g.children.get_mut(name) else {
                return;
            };
            if child.failover_epoch != epoch {
                return;
            }
            child.state = ConnectivityState::TransientFailure;
            child.status = Status::unavailable("failover timer fired");
        }
        debug!(target: "priority", child = name, "failover timer fired");
        Self::choose_priority(inner, helper);
    }

    fn start_deactivation_timer(&self, name: String) {
        let epoch = {
            let mut g = self.inner.lock();
            let epoch = g.next_epoch;
            g.next_epoch += 1;
            if let Some(c) = g.children.get_mut(&name) {
                c.deactivation_epoch = Some(epoch);
            }
            epoch
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CHILD_RETENTION_INTERVAL).await;
            let mut g = inner.lock();
            if g.shutdown {
                return;
            }
            if let Some(child) = g.children.get(&name) {
                if child.deactivation_epoch == Some(epoch) {
                    if let Some(removed) = g.children.remove(&name) {
                        removed.handler.shutdown_locked();
                    }
                }
            }
        });
    }

    /// Idempotent selection pass (spec §4.5 `ChoosePriority`). Creates at
    /// most one missing priority's child per pass, then stops scanning
    /// further (lower) priorities: a child is materialized lazily, the
    /// first time the scan reaches a priority that doesn't have one yet,
    /// matching `priority.cc`'s `ChoosePriorityLocked` rather than
    /// pre-creating every configured priority up front.
    fn choose_priority(inner: &Arc<Mutex<Inner>>, helper: &Arc<dyn ChannelControlHelper>) {
        enum Step {
            None,
            Create {
                name: String,
                config_name: String,
                addresses: Result<Vec<ServerAddress>, Status>,
                config: Arc<dyn Config>,
                resolution_note: String,
            },
            Adopted(String, ConnectivityState, Status, Arc<dyn Picker>),
        }

        let step = {
            let mut g = inner.lock();
            if g.priorities.is_empty() {
                Step::None
            } else {
                let priorities = g.priorities.clone();
                let mut adopted = None;
                let mut to_create = None;
                for (idx, name) in priorities.iter().enumerate() {
                    if !g.children.contains_key(name) {
                        // First missing priority in order: materialize it
                        // and stop scanning lower priorities this pass.
                        to_create = Some(name.clone());
                        break;
                    }
                    let child = g.children.get(name).unwrap();
                    if child.state == ConnectivityState::Ready || child.state == ConnectivityState::Idle {
                        adopted = Some((idx, name.clone()));
                        break;
                    }
                    // Failover timer still pending (epoch assigned but not
                    // yet a TRANSIENT_FAILURE from firing): wait on it.
                    if child.state != ConnectivityState::TransientFailure {
                        adopted = Some((idx, name.clone()));
                        break;
                    }
                }

                if let Some(name) = to_create {
                    let entry = g
                        .child_configs
                        .get(&name)
                        .cloned()
                        .expect("priority listed in `priorities` without a matching child config");
                    Step::Create {
                        name,
                        config_name: entry.config_name,
                        addresses: g.pending_addresses.clone(),
                        config: g
                            .pending_config
                            .clone()
                            .expect("pending_config set by the time a priority is first scanned"),
                        resolution_note: g.pending_resolution_note.clone(),
                    }
                } else {
                    if adopted.is_none() {
                        adopted = priorities
                            .iter()
                            .enumerate()
                            .find(|(_, n)| {
                                g.children
                                    .get(*n)
                                    .is_some_and(|c| c.state == ConnectivityState::Connecting)
                            })
                            .map(|(i, n)| (i, n.clone()))
                            .or_else(|| {
                                // Nothing in the new list is usable yet: keep
                                // forwarding whoever served before this update,
                                // if it's still alive and READY/IDLE, rather
                                // than spuriously reporting CONNECTING.
                                let prev = g.current_child_from_before_update.as_ref()?;
                                let still_good = g
                                    .children
                                    .get(prev)
                                    .is_some_and(|c| matches!(c.state, ConnectivityState::Ready | ConnectivityState::Idle));
                                still_good
                                    .then(|| priorities.iter().position(|n| n == prev))
                                    .flatten()
                                    .map(|i| (i, prev.clone()))
                            })
                            .or_else(|| priorities.last().map(|n| (priorities.len() - 1, n.clone())));
                    } else {
                        g.current_child_from_before_update = None;
                    }
                    g.current_priority = adopted.as_ref().map(|(i, _)| *i);
                    match adopted {
                        Some((_, name)) => {
                            let child = g.children.get(&name).unwrap();
                            Step::Adopted(name, child.state, child.status.clone(), child.picker.clone())
                        }
                        None => Step::None,
                    }
                }
            }
        };

        match step {
            Step::Create {
                name,
                config_name,
                addresses,
                config,
                resolution_note,
            } => {
                let child_helper: Arc<dyn ChannelControlHelper> = Arc::new(PriorityChildHelper {
                    inner: helper.clone(),
                    shared: inner.clone(),
                    name: name.clone(),
                });
                let handler = ChildPolicyHandler::new(child_helper);
                {
                    let mut g = inner.lock();
                    if !g.children.contains_key(&name) {
                        g.children.insert(
                            name.clone(),
                            ChildState {
                                handler: handler.clone(),
                                state: ConnectivityState::Connecting,
                                status: Status::ok(),
                                picker: Arc::new(QueuePicker),
                                failover_epoch: 0,
                                deactivation_epoch: None,
                                seen_ready_or_idle_since_tf: false,
                                in_config: true,
                            },
                        );
                    }
                }
                start_failover_timer(inner, helper, name.clone());
                let config_name: Arc<str> = Arc::from(config_name.as_str());
                let config_name_for_build = config_name.clone();
                let child_args = UpdateArgs {
                    addresses,
                    config,
                    resolution_note,
                    args: ChannelArgs::new(),
                };
                let _ = handler.update_locked(
                    config_name,
                    |h| {
                        crate::lb::registry::global()
                            .build(&config_name_for_build, h)
                            .unwrap_or_else(|| panic!("unregistered child policy '{config_name_for_build}'"))
                    },
                    child_args,
                );
                // The new child's own update_locked call only synchronously
                // reports a state back through `PriorityChildHelper` (which
                // re-runs `choose_priority` itself) when it has something to
                // report right away (e.g. an empty address list); otherwise
                // it just sits at its initial CONNECTING. Re-run here so
                // that initial CONNECTING gets surfaced (or, if nothing else
                // changed, so a still-missing lower priority gets created
                // next).
                Self::choose_priority(inner, helper);
            }
            Step::Adopted(name, state, status, picker) => {
                debug!(target: "priority", child = %name, %state, "adopted priority");
                helper.update_state(state, status, picker);
            }
            Step::None => {
                helper.update_state(
                    ConnectivityState::TransientFailure,
                    Status::unavailable("no priorities configured"),
                    Arc::new(crate::lb::picker::FailPicker(Status::unavailable(
                        "no priorities configured",
                    ))),
                );
            }
        }
    }
}

impl LoadBalancingPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority_experimental"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let config = args
            .config
            .as_any()
            .downcast_ref::<PriorityConfig>()
            .ok_or_else(|| Status::internal("priority: wrong config type"))?;

        for name in &config.priorities {
            if !config.children.contains_key(name) {
                return Err(Status::internal(format!(
                    "priority: '{name}' listed in priorities but missing from children"
                )));
            }
        }

        let addresses: Result<Vec<ServerAddress>, Status> = args.addresses;

        {
            let mut g = self.inner.lock();
            // Remember whoever was serving before this update takes effect,
            // so `choose_priority` can keep forwarding its picker if the new
            // priority list has nothing ready yet, instead of dropping
            // straight to CONNECTING/TRANSIENT_FAILURE.
            g.current_child_from_before_update =
                g.current_priority.and_then(|i| g.priorities.get(i).cloned());
            g.priorities = config.priorities.clone();
            g.child_configs = config.children.clone();
            g.pending_addresses = addresses.clone();
            g.pending_config = Some(args.config.clone());
            g.pending_resolution_note = args.resolution_note.clone();
            let timeout_ms = args
                .args
                .int("priority_failover_timeout_ms", DEFAULT_FAILOVER_TIMEOUT.as_millis() as i64)
                .max(0) as u64;
            g.failover_timeout = Duration::from_millis(timeout_ms);
            for c in g.children.values_mut() {
                c.in_config = false;
            }
            for name in &config.priorities {
                if let Some(c) = g.children.get_mut(name) {
                    c.in_config = true;
                    c.deactivation_epoch = None;
                }
            }
        }

        // Deactivate children no longer listed.
        let to_deactivate: Vec<String> = {
            let g = self.inner.lock();
            g.children
                .iter()
                .filter(|(_, c)| !c.in_config)
                .map(|(n, _)| n.clone())
                .collect()
        };
        for name in to_deactivate {
            self.start_deactivation_timer(name);
        }

        // Forward the new config/address list to every priority that
        // already has a child (address partitioning by priority is
        // caller-specific and out of this core's scope: the same address
        // list is forwarded to every priority's child, matching a
        // single-child-per-priority deployment). A priority with no child
        // yet is deliberately NOT created here: `choose_priority` creates it
        // lazily, one at a time, the first time its scan reaches it (spec
        // §4.5 step 2a) — otherwise every configured priority would start
        // connecting concurrently instead of only after a higher one fails
        // over.
        for name in &config.priorities {
            let handler = self.inner.lock().children.get(name).map(|c| c.handler.clone());
            if let Some(handler) = handler {
                let entry = config.children.get(name).unwrap();
                let child_args = UpdateArgs {
                    addresses: addresses.clone(),
                    config: args.config.clone(),
                    resolution_note: args.resolution_note.clone(),
                    args: ChannelArgs::new(),
                };
                let config_name: Arc<str> = Arc::from(entry.config_name.as_str());
                let config_name_for_build = config_name.clone();
                let _ = handler.update_locked(
                    config_name,
                    |h| {
                        crate::lb::registry::global()
                            .build(&config_name_for_build, h)
                            .unwrap_or_else(|| panic!("unregistered child policy '{config_name_for_build}'"))
                    },
                    child_args,
                );
            }
        }

        PriorityPolicy::choose_priority(&self.inner, &self.helper);
        Ok(())
    }

    fn shutdown_locked(&mut self) {
        let mut g = self.inner.lock();
        g.shutdown = true;
        for (_, child) in g.children.drain() {
            let child = child;
            child.handler.shutdown_locked();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::testutil::FakeHelper;

    fn config(priorities: &[&str]) -> Arc<PriorityConfig> {
        let mut children = HashMap::new();
        for p in priorities {
            children.insert(
                p.to_string(),
                ChildEntryConfig {
                    config_name: "pick_first".to_string(),
                    ignore_reresolution: false,
                },
            );
        }
        Arc::new(PriorityConfig {
            children,
            priorities: priorities.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_priority_is_adopted_on_creation() {
        let helper = FakeHelper::new();
        let mut policy = PriorityPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);
        policy
            .update_locked(UpdateArgs {
                addresses: Ok(vec![]),
                config: config(&["hi", "lo"]),
                resolution_note: String::new(),
                args: ChannelArgs::new(),
            })
            .unwrap();
        // No addresses: pick_first for "hi" reports TRANSIENT_FAILURE
        // immediately, but since it is still the only candidate at its
        // priority with no child existing yet for "lo" to preempt, "hi"
        // remains current until its failover window is irrelevant here.
        assert!(!helper.updates.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_ready_wins_over_lower_priority_ready() {
        let helper = FakeHelper::new();
        let mut policy = PriorityPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);
        policy
            .update_locked(UpdateArgs {
                addresses: Ok(vec![]),
                config: config(&["hi", "lo"]),
                resolution_note: String::new(),
                args: ChannelArgs::new(),
            })
            .unwrap();

        // Drive each child's reported state directly through the same
        // helper a real child policy would use, bypassing pick_first
        // itself so this isolates `ChoosePriority`'s behavior.
        let hi_child = PriorityChildHelper {
            inner: helper.clone() as Arc<dyn ChannelControlHelper>,
            shared: policy.inner.clone(),
            name: "hi".to_string(),
        };
        let lo_child = PriorityChildHelper {
            inner: helper.clone() as Arc<dyn ChannelControlHelper>,
            shared: policy.inner.clone(),
            name: "lo".to_string(),
        };

        // Both children immediately failed over (pick_first given an empty
        // address list reports TRANSIENT_FAILURE right away); reset them to
        // CONNECTING to isolate `ChoosePriority`'s behavior from pick_first's.
        {
            let mut g = policy.inner.lock();
            for name in ["hi", "lo"] {
                let c = g.children.get_mut(name).unwrap();
                c.state = ConnectivityState::Connecting;
                c.seen_ready_or_idle_since_tf = false;
            }
        }

        // "lo" reports READY first, but "hi" is still only CONNECTING
        // (not yet TRANSIENT_FAILURE), so "hi" must still be adopted:
        // "lo" reaching READY must not leak straight to the real parent.
        ChannelControlHelper::update_state(&lo_child, ConnectivityState::Ready, Status::ok(), Arc::new(QueuePicker));
        assert_eq!(helper.last_update().unwrap().state, ConnectivityState::Connecting);

        // Once "hi" fails over, "lo" becomes the adopted priority.
        let failure = Status::unavailable("refused");
        ChannelControlHelper::update_state(
            &hi_child,
            ConnectivityState::TransientFailure,
            failure.clone(),
            Arc::new(crate::lb::picker::FailPicker(failure)),
        );
        assert_eq!(helper.last_update().unwrap().state, ConnectivityState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_priority_name_is_rejected() {
        let helper = FakeHelper::new();
        let mut policy = PriorityPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);
        let mut children = HashMap::new();
        children.insert(
            "hi".to_string(),
            ChildEntryConfig {
                config_name: "pick_first".to_string(),
                ignore_reresolution: false,
            },
        );
        let bad_config = Arc::new(PriorityConfig {
            children,
            priorities: vec!["hi".to_string(), "missing".to_string()],
        });
        let result = policy.update_locked(UpdateArgs {
            addresses: Ok(vec![]),
            config: bad_config,
            resolution_note: String::new(),
            args: ChannelArgs::new(),
        });
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lower_priority_child_is_not_created_while_higher_priority_still_viable() {
        let helper = FakeHelper::new();
        let mut policy = PriorityPolicy::new(helper.clone() as Arc<dyn ChannelControlHelper>);
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        policy
            .update_locked(UpdateArgs {
                addresses: Ok(vec![ServerAddress::new(addr)]),
                config: config(&["hi", "lo"]),
                resolution_note: String::new(),
                args: ChannelArgs::new(),
            })
            .unwrap();

        // "hi" is still CONNECTING (a real subchannel, not yet READY or
        // TRANSIENT_FAILURE): "lo" must not have been materialized at all,
        // and only "hi"'s pick_first should have touched the address.
        {
            let g = policy.inner.lock();
            assert!(g.children.contains_key("hi"));
            assert!(
                !g.children.contains_key("lo"),
                "lo's child must not be created while hi is still viable"
            );
        }
        assert_eq!(helper.created.lock().len(), 1, "only hi's pick_first should have created a subchannel");

        // Drive "hi" into TRANSIENT_FAILURE (as if its failover timer fired
        // after the real subchannel never came up): only then should
        // `choose_priority` fall through and materialize "lo".
        let failure = Status::unavailable("refused");
        PriorityPolicy::on_failover_fired(&policy.inner, &(helper.clone() as Arc<dyn ChannelControlHelper>), "hi", 0);
        let _ = failure;

        let g = policy.inner.lock();
        assert!(
            g.children.contains_key("lo"),
            "lo's child must be created once hi has failed over"
        );
    }
}
