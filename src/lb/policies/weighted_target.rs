//! `weighted_target`: a stateless WRR composer over named children (spec
//! §4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::lb::child_handler::ChildPolicyHandler;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::picker::{PickArgs, PickResult, Picker, QueuePicker};
use crate::lb::policy::{ChannelArgs, ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::status::Status;

pub const CHILD_RETENTION_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TargetConfig {
    pub weight: u32,
    pub config_name: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct WeightedTargetConfig {
    pub targets: HashMap<String, TargetConfig>,
}

impl Config for WeightedTargetConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct ChildState {
    handler: ChildPolicyHandler,
    weight: u32,
    state: ConnectivityState,
    status: Status,
    picker: Arc<dyn Picker>,
    deactivation_epoch: Option<u64>,
}

struct Inner {
    children: HashMap<String, ChildState>,
    next_epoch: u64,
    shutdown: bool,
}

pub struct WeightedTargetPolicy {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
}

/// Binary-searches a prefix-sum table of child weights (spec §9 open
/// question 2: a key landing exactly on a boundary must fall to the next
/// index, so the table invariant after search is `table[index].0 > key`).
struct PrefixSumPicker {
    table: Vec<(u64, Arc<dyn Picker>)>,
    total: u64,
}

impl Picker for PrefixSumPicker {
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult {
        if self.table.is_empty() {
            return PickResult::Queue;
        }
        let key = fastrand::u64(0..self.total);
        let index = self.table.partition_point(|(cum, _)| *cum <= key);
        let index = index.min(self.table.len() - 1);
        debug_assert!(self.table[index].0 > key);
        self.table[index].1.pick(args)
    }
}

fn build_picker(entries: &[(&str, u32, Arc<dyn Picker>)]) -> Arc<dyn Picker> {
    let mut table = Vec::with_capacity(entries.len());
    let mut cum = 0u64;
    for (_, weight, picker) in entries {
        cum += *weight as u64;
        table.push((cum, picker.clone()));
    }
    Arc::new(PrefixSumPicker { table, total: cum })
}

impl WeightedTargetPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                children: HashMap::new(),
                next_epoch: 0,
                shutdown: false,
            })),
            helper,
        }
    }

    fn publish_locked(&self) {
        let g = self.inner.lock();
        let ready: Vec<(&str, u32, Arc<dyn Picker>)> = g
            .children
            .iter()
            .filter(|(_, c)| c.state == ConnectivityState::Ready)
            .map(|(n, c)| (n.as_str(), c.weight, c.picker.clone()))
            .collect();
        let (state, picker, status) = if !ready.is_empty() {
            (ConnectivityState::Ready, build_picker(&ready), Status::ok())
        } else if g.children.values().any(|c| c.state == ConnectivityState::Connecting) {
            (ConnectivityState::Connecting, Arc::new(QueuePicker) as Arc<dyn Picker>, Status::ok())
        } else if g.children.values().any(|c| c.state == ConnectivityState::Idle) {
            (ConnectivityState::Idle, Arc::new(QueuePicker) as Arc<dyn Picker>, Status::ok())
        } else {
            let tf: Vec<(&str, u32, Arc<dyn Picker>)> = g
                .children
                .iter()
                .filter(|(_, c)| c.state == ConnectivityState::TransientFailure)
                .map(|(n, c)| (n.as_str(), c.weight, c.picker.clone()))
                .collect();
            let status = g
                .children
                .values()
                .find(|c| c.state == ConnectivityState::TransientFailure)
                .map(|c| c.status.clone())
                .unwrap_or_else(Status::ok);
            (ConnectivityState::TransientFailure, build_picker(&tf), status)
        };
        debug!(target: "weighted_target", %state, "publishing state");
        drop(g);
        self.helper.update_state(state, status, picker);
    }

    fn start_deactivation_timer(&self, name: String) {
        let epoch = {
            let mut g = self.inner.lock();
            let epoch = g.next_epoch;
            g.next_epoch += 1;
            if let Some(c) = g.children.get_mut(&name) {
                c.deactivation_epoch = Some(epoch);
                c.weight = 0;
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
            if g.children.get(&name).and_then(|c| c.deactivation_epoch) == Some(epoch) {
                if let Some(removed) = g.children.remove(&name) {
                    removed.handler.shutdown_locked();
                }
            }
        });
    }
}

impl LoadBalancingPolicy for WeightedTargetPolicy {
    fn name(&self) -> &'static str {
        "weighted_target_experimental"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let config = args
            .config
            .as_any()
            .downcast_ref::<WeightedTargetConfig>()
            .ok_or_else(|| Status::internal("weighted_target: wrong config type"))?;

        for (name, target) in &config.targets {
            let mut g = self.inner.lock();
            if let Some(existing) = g.children.get_mut(name) {
                existing.weight = target.weight;
                existing.deactivation_epoch = None;
            } else {
                let helper: Arc<dyn ChannelControlHelper> = self.helper.clone();
                let handler = ChildPolicyHandler::new(helper);
                g.children.insert(
                    name.clone(),
                    ChildState {
                        handler,
                        weight: target.weight,
                        state: ConnectivityState::Connecting,
                        status: Status::ok(),
                        picker: Arc::new(QueuePicker),
                        deactivation_epoch: None,
                    },
                );
            }
        }

        let to_remove: Vec<String> = {
            let g = self.inner.lock();
            g.children
                .keys()
                .filter(|n| !config.targets.contains_key(n.as_str()))
                .cloned()
                .collect()
        };
        for name in to_remove {
            self.start_deactivation_timer(name);
        }

        for (name, target) in &config.targets {
            let child_args = UpdateArgs {
                addresses: args.addresses.clone(),
                config: args.config.clone(),
                resolution_note: args.resolution_note.clone(),
                args: ChannelArgs::new(),
            };
            let g = self.inner.lock();
            if let Some(child) = g.children.get(name) {
                let config_name: Arc<str> = Arc::from(target.config_name.as_str());
                let config_name_for_build = config_name.clone();
                let _ = child.handler.update_locked(
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

        self.publish_locked();
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

    #[test]
    fn prefix_sum_picker_lands_on_strict_upper_bound() {
        let a: Arc<dyn Picker> = Arc::new(crate::lb::picker::FailPicker(Status::ok()));
        let b: Arc<dyn Picker> = Arc::new(crate::lb::picker::FailPicker(Status::internal("b")));
        let table = vec![(3u64, a), (5u64, b)];
        let picker = PrefixSumPicker { table, total: 5 };
        let mut state = crate::lb::picker::CallState::new();
        for _ in 0..50 {
            let mut args = PickArgs {
                path: "/s/m",
                call_state: &mut state,
            };
            match picker.pick(&mut args) {
                PickResult::Fail(status) => {
                    assert!(status.is_ok() || status.message() == "b");
                }
                _ => panic!("expected Fail"),
            }
        }
    }
}
