//! `outlier_detection`: wraps a child policy and periodically ejects
//! addresses whose error rate stands out (spec §4.7).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::lb::child_handler::ChildPolicyHandler;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::helper::ForwardingChannelControlHelper;
use crate::lb::picker::{PickArgs, PickResult, Picker, SubchannelCallTracker};
use crate::lb::policy::{ChannelArgs, ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::lb::subchannel::{Subchannel, SubchannelWrapper};
use crate::status::Status;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SuccessRateEjection {
    pub stdev_factor: u32,
    pub enforcement_percentage: u32,
    pub minimum_hosts: u32,
    pub request_volume: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FailurePercentageEjection {
    pub threshold: u32,
    pub enforcement_percentage: u32,
    pub minimum_hosts: u32,
    pub request_volume: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OutlierDetectionConfig {
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    #[serde(with = "duration_millis")]
    pub base_ejection_time: Duration,
    #[serde(with = "duration_millis")]
    pub max_ejection_time: Duration,
    pub max_ejection_percent: u32,
    #[serde(default)]
    pub success_rate_ejection: Option<SuccessRateEjection>,
    #[serde(default)]
    pub failure_percentage_ejection: Option<FailurePercentageEjection>,
    pub child_policy: String,
}

mod duration_millis {
    use std::time::Duration;
    use serde::Deserialize;
    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Config for OutlierDetectionConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Per-address call-count state (spec §3, "Subchannel state (outlier
/// detection)").
pub struct AddressState {
    active: Mutex<(u64, u64)>,
    backup: Mutex<(u64, u64)>,
    ejection_time: Mutex<Option<Instant>>,
    multiplier: AtomicU32,
    wrappers: Mutex<Vec<Arc<SubchannelWrapper>>>,
}

impl AddressState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new((0, 0)),
            backup: Mutex::new((0, 0)),
            ejection_time: Mutex::new(None),
            multiplier: AtomicU32::new(0),
            wrappers: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, success: bool) {
        let mut bucket = self.active.lock();
        if success {
            bucket.0 += 1;
        } else {
            bucket.1 += 1;
        }
    }

    fn is_ejected(&self) -> bool {
        self.ejection_time.lock().is_some()
    }
}

/// A snapshot of one address's observation window, used by the pure tick
/// algorithm so it is testable without any subchannel/timer plumbing.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub successes: u64,
    pub failures: u64,
}

impl Observation {
    fn total(&self) -> u64 {
        self.successes + self.failures
    }
    fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            1.0
        } else {
            self.successes as f64 / self.total() as f64
        }
    }
}

/// Runs one interval tick's success-rate and failure-percentage
/// algorithms (spec §4.7 steps 2-4) over already-swapped observation
/// windows, returning the set of indices to eject this round. `already_ejected`
/// lists indices already ejected before this round (so the "always allow
/// if no host is currently ejected" relaxation and the
/// `max_ejection_percent` cap can be evaluated correctly).
pub fn compute_ejections(
    observations: &[Observation],
    already_ejected: &[bool],
    success_rate: Option<&SuccessRateEjection>,
    failure_percentage: Option<&FailurePercentageEjection>,
    max_ejection_percent: u32,
    roll: impl Fn() -> u32,
) -> Vec<bool> {
    let n = observations.len();
    let mut ejected: Vec<bool> = already_ejected.to_vec();
    ejected.resize(n, false);

    let currently_ejected = |e: &[bool]| e.iter().filter(|x| **x).count();

    let try_eject = |idx: usize, enforcement_percentage: u32, ejected: &mut Vec<bool>| {
        let roll_value = roll();
        if roll_value >= enforcement_percentage {
            return;
        }
        let would_be = currently_ejected(ejected) + 1;
        let pct = (would_be * 100) as u32 / n.max(1) as u32;
        if currently_ejected(ejected) == 0 || pct <= max_ejection_percent {
            ejected[idx] = true;
        }
    };

    if let Some(sr) = success_rate {
        let candidates: Vec<usize> = (0..n)
            .filter(|&i| observations[i].total() >= sr.request_volume as u64)
            .collect();
        if candidates.len() as u32 >= sr.minimum_hosts {
            let rates: Vec<f64> = candidates.iter().map(|&i| observations[i].success_rate()).collect();
            let mean = rates.iter().sum::<f64>() / rates.len() as f64;
            let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64;
            let stddev = variance.sqrt();
            let threshold = mean - stddev * (sr.stdev_factor as f64 / 1000.0);
            for &idx in &candidates {
                if ejected[idx] {
                    continue;
                }
                if observations[idx].success_rate() < threshold {
                    try_eject(idx, sr.enforcement_percentage, &mut ejected);
                }
            }
        }
    }

    if let Some(fp) = failure_percentage {
        let candidates: Vec<usize> = (0..n)
            .filter(|&i| !ejected[i] && observations[i].total() >= fp.request_volume as u64)
            .collect();
        if candidates.len() as u32 >= fp.minimum_hosts {
            for &idx in &candidates {
                let failure_pct = 100.0 - observations[idx].success_rate() * 100.0;
                if failure_pct > fp.threshold as f64 {
                    try_eject(idx, fp.enforcement_percentage, &mut ejected);
                }
            }
        }
    }

    ejected
}

struct Inner {
    addresses: HashMap<SocketAddr, Arc<AddressState>>,
    disabled: HashMap<SocketAddr, bool>,
    config: Arc<OutlierDetectionConfig>,
    tick_epoch: u64,
    handler: ChildPolicyHandler,
    shutdown: bool,
}

pub struct OutlierDetectionPolicy {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
}

struct OdHelper {
    inner: Arc<dyn ChannelControlHelper>,
    state: Arc<Mutex<Inner>>,
}

impl ForwardingChannelControlHelper for OdHelper {
    fn inner(&self) -> &Arc<dyn ChannelControlHelper> {
        &self.inner
    }

    fn create_subchannel(&self, address: SocketAddr) -> Option<Arc<dyn Subchannel>> {
        let raw = self.inner.create_subchannel(address)?;
        let disabled = self
            .state
            .lock()
            .disabled
            .get(&address)
            .copied()
            .unwrap_or(false);
        if disabled {
            return Some(raw);
        }
        let wrapper = SubchannelWrapper::new(raw);
        let mut g = self.state.lock();
        let entry = g.addresses.entry(address).or_insert_with(AddressState::new);
        entry.wrappers.lock().push(wrapper.clone());
        Some(wrapper as Arc<dyn Subchannel>)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let counting_enabled = {
            let g = self.state.lock();
            g.config.success_rate_ejection.is_some() || g.config.failure_percentage_ejection.is_some()
        };
        let wrapped: Arc<dyn Picker> = Arc::new(OdPicker {
            child: picker,
            state: self.state.clone(),
            counting_enabled,
        });
        self.inner.update_state(state, status, wrapped);
    }
}

struct OdPicker {
    child: Arc<dyn Picker>,
    state: Arc<Mutex<Inner>>,
    counting_enabled: bool,
}

impl Picker for OdPicker {
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult {
        match self.child.pick(args) {
            PickResult::Complete {
                subchannel,
                call_tracker,
            } => {
                if !self.counting_enabled {
                    return PickResult::Complete {
                        subchannel,
                        call_tracker,
                    };
                }
                let address_state = {
                    let g = self.state.lock();
                    g.addresses.get(&subchannel.socket_address()).cloned()
                };
                let Some(address_state) = address_state else {
                    return PickResult::Complete {
                        subchannel,
                        call_tracker,
                    };
                };
                PickResult::complete_with_tracker(
                    subchannel,
                    Arc::new(OdCallTracker {
                        inner: call_tracker,
                        address_state,
                    }),
                )
            }
            other => other,
        }
    }
}

struct OdCallTracker {
    inner: Option<Arc<dyn SubchannelCallTracker>>,
    address_state: Arc<AddressState>,
}

impl SubchannelCallTracker for OdCallTracker {
    fn start(&self) {
        if let Some(inner) = &self.inner {
            inner.start();
        }
    }

    fn finish(&self, status: &Status) {
        if let Some(inner) = &self.inner {
            inner.finish(status);
        }
        self.address_state.record(status.is_ok());
    }
}

impl OutlierDetectionPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            addresses: HashMap::new(),
            disabled: HashMap::new(),
            config: Arc::new(OutlierDetectionConfig {
                interval: Duration::from_secs(10),
                base_ejection_time: Duration::from_secs(30),
                max_ejection_time: Duration::from_secs(300),
                max_ejection_percent: 10,
                success_rate_ejection: None,
                failure_percentage_ejection: None,
                child_policy: "pick_first".to_string(),
            }),
            tick_epoch: 0,
            handler: ChildPolicyHandler::new(helper.clone()),
            shutdown: false,
        }));
        Self { inner, helper }
    }

    fn start_tick_loop(&self) {
        let epoch = {
            let mut g = self.inner.lock();
            g.tick_epoch += 1;
            g.tick_epoch
        };
        let inner = self.inner.clone();
        let interval = self.inner.lock().config.interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let still_current = {
                    let g = inner.lock();
                    !g.shutdown && g.tick_epoch == epoch
                };
                if !still_current {
                    return;
                }
                Self::tick(&inner);
            }
        });
    }

    fn tick(inner: &Arc<Mutex<Inner>>) {
        let g = inner.lock();
        if g.shutdown {
            return;
        }
        let config = g.config.clone();
        let addrs: Vec<(SocketAddr, Arc<AddressState>)> =
            g.addresses.iter().map(|(a, s)| (*a, s.clone())).collect();

        let mut observations = Vec::with_capacity(addrs.len());
        for (_, state) in &addrs {
            let window = {
                let mut active = state.active.lock();
                let finished = *active;
                *active = (0, 0);
                finished
            };
            *state.backup.lock() = window;
            observations.push(Observation {
                successes: window.0,
                failures: window.1,
            });
        }

        let already_ejected: Vec<bool> = addrs.iter().map(|(_, s)| s.is_ejected()).collect();
        let ejections = compute_ejections(
            &observations,
            &already_ejected,
            config.success_rate_ejection.as_ref(),
            config.failure_percentage_ejection.as_ref(),
            config.max_ejection_percent,
            || fastrand::u32(1..100),
        );

        let now = Instant::now();
        for (i, (_, state)) in addrs.iter().enumerate() {
            if ejections[i] && !already_ejected[i] {
                *state.ejection_time.lock() = Some(now);
                state.multiplier.fetch_add(1, Ordering::Relaxed);
                for w in state.wrappers.lock().iter() {
                    w.eject();
                }
                debug!(target: "outlier_detection", "ejected address");
            } else if !ejections[i]
                && state.multiplier.load(Ordering::Relaxed) > 0 {
                    state.multiplier.fetch_sub(1, Ordering::Relaxed);
                }
            if already_ejected[i] && !ejections[i] {
                // retained below by the base/max window check
            }
            let mut ejection_time = state.ejection_time.lock();
            if let Some(since) = *ejection_time {
                let multiplier = state.multiplier.load(Ordering::Relaxed).max(1);
                let window = (config.base_ejection_time * multiplier).min(config.base_ejection_time.max(config.max_ejection_time));
                if now.duration_since(since) >= window {
                    *ejection_time = None;
                    drop(ejection_time);
                    for w in state.wrappers.lock().iter() {
                        w.uneject();
                    }
                }
            }
        }
    }
}

impl LoadBalancingPolicy for OutlierDetectionPolicy {
    fn name(&self) -> &'static str {
        "outlier_detection_experimental"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let config = args
            .config
            .as_any()
            .downcast_ref::<OutlierDetectionConfig>()
            .ok_or_else(|| Status::internal("outlier_detection: wrong config type"))?;

        let first_update = {
            let mut g = self.inner.lock();
            let first = g.tick_epoch == 0;
            g.config = Arc::new(config.clone());
            first
        };
        if first_update {
            self.start_tick_loop();
        }

        if let Ok(addresses) = &args.addresses {
            let mut g = self.inner.lock();
            g.disabled.clear();
            for addr in addresses {
                let disabled = addr
                    .attributes
                    .get_as::<bool>("disable_outlier_detection")
                    .copied()
                    .unwrap_or(false);
                g.disabled.insert(addr.socket_address, disabled);
            }
        }

        let od_helper: Arc<dyn ChannelControlHelper> = Arc::new(OdHelper {
            inner: self.helper.clone(),
            state: self.inner.clone(),
        });

        let config_name: Arc<str> = Arc::from(config.child_policy.as_str());
        let config_name_for_build = config_name.clone();
        let child_args = UpdateArgs {
            addresses: args.addresses,
            config: args.config.clone(),
            resolution_note: args.resolution_note,
            args: ChannelArgs::new(),
        };
        let g = self.inner.lock();
        g.handler.update_locked(
            config_name,
            |_unused_helper| {
                crate::lb::registry::global()
                    .build(&config_name_for_build, od_helper.clone())
                    .unwrap_or_else(|| panic!("unregistered child policy '{config_name_for_build}'"))
            },
            child_args,
        )
    }

    fn shutdown_locked(&mut self) {
        let mut g = self.inner.lock();
        g.shutdown = true;
        g.handler.shutdown_locked();
        g.addresses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_d_ejects_the_outlier_host() {
        let observations = vec![
            Observation { successes: 95, failures: 5 },
            Observation { successes: 96, failures: 4 },
            Observation { successes: 20, failures: 80 },
        ];
        let sr = SuccessRateEjection {
            stdev_factor: 1000,
            enforcement_percentage: 100,
            minimum_hosts: 3,
            request_volume: 10,
        };
        let ejections = compute_ejections(&observations, &[false, false, false], Some(&sr), None, 10, || 0);
        assert_eq!(ejections, vec![false, false, true]);
    }

    #[test]
    fn max_ejection_percent_caps_further_ejections() {
        let observations = vec![
            Observation { successes: 0, failures: 100 },
            Observation { successes: 0, failures: 100 },
            Observation { successes: 100, failures: 0 },
        ];
        let fp = FailurePercentageEjection {
            threshold: 50,
            enforcement_percentage: 100,
            minimum_hosts: 1,
            request_volume: 10,
        };
        // One host already ejected; capping at max_ejection_percent=33%
        // of 3 hosts (1 host) should block the second ejection.
        let ejections = compute_ejections(&observations, &[true, false, false], None, Some(&fp), 33, || 0);
        assert_eq!(ejections, vec![true, false, false]);
    }

    #[test]
    fn below_minimum_hosts_ejects_nobody() {
        let observations = vec![
            Observation { successes: 1, failures: 99 },
            Observation { successes: 99, failures: 1 },
        ];
        let sr = SuccessRateEjection {
            stdev_factor: 1000,
            enforcement_percentage: 100,
            minimum_hosts: 3,
            request_volume: 10,
        };
        let ejections = compute_ejections(&observations, &[false, false], Some(&sr), None, 50, || 0);
        assert_eq!(ejections, vec![false, false]);
    }
}
