//! `weighted_round_robin`: picks probabilistically over a flat endpoint
//! set in proportion to reported load (spec §4.4).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::lb::address::ServerAddress;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::picker::{PickArgs, PickResult, Picker, SubchannelCallTracker};
use crate::lb::policies::stride_scheduler::StrideScheduler;
use crate::lb::policy::{ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::lb::subchannel::{ConnectivityStateWatcher, DataWatcher, Subchannel};
use crate::status::Status;

fn default_oob_reporting_period() -> Duration {
    Duration::from_secs(10)
}
fn default_blackout_period() -> Duration {
    Duration::from_secs(10)
}
fn default_weight_update_period() -> Duration {
    Duration::from_secs(1)
}
fn default_weight_expiration_period() -> Duration {
    Duration::from_secs(180)
}
fn default_error_utilization_penalty() -> f32 {
    1.0
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct WeightedRoundRobinConfig {
    #[serde(default)]
    pub enable_oob_load_report: bool,
    #[serde(default = "default_oob_reporting_period", with = "duration_millis")]
    pub oob_reporting_period: Duration,
    #[serde(default = "default_blackout_period", with = "duration_millis")]
    pub blackout_period: Duration,
    #[serde(default = "default_weight_update_period", with = "duration_millis")]
    pub weight_update_period: Duration,
    #[serde(default = "default_weight_expiration_period", with = "duration_millis")]
    pub weight_expiration_period: Duration,
    #[serde(default = "default_error_utilization_penalty")]
    pub error_utilization_penalty: f32,
}

impl Default for WeightedRoundRobinConfig {
    fn default() -> Self {
        Self {
            enable_oob_load_report: false,
            oob_reporting_period: default_oob_reporting_period(),
            blackout_period: default_blackout_period(),
            weight_update_period: default_weight_update_period().max(Duration::from_millis(100)),
            weight_expiration_period: default_weight_expiration_period(),
            error_utilization_penalty: default_error_utilization_penalty(),
        }
    }
}

impl Config for WeightedRoundRobinConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
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

/// A single backend-metric sample, whether delivered per-call or OOB.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendMetricReport {
    pub qps: f64,
    pub eps: f64,
    pub application_utilization: f64,
    pub cpu_utilization: f64,
}

/// Tracks one endpoint's weight across subchannel churn (spec §3,
/// "Endpoint weight").
pub struct EndpointWeight {
    bits: AtomicU64,
    non_empty_since: Mutex<Option<Instant>>,
    last_update_time: Mutex<Option<Instant>>,
}

impl EndpointWeight {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bits: AtomicU64::new(0f64.to_bits()),
            non_empty_since: Mutex::new(None),
            last_update_time: Mutex::new(None),
        })
    }

    /// Resets the blackout window; called when the owning endpoint
    /// (re)enters READY, per spec §4.4's "reset on READY" rule.
    pub fn reset_non_empty_since(&self) {
        *self.non_empty_since.lock() = None;
    }

    pub fn maybe_update(&self, report: &BackendMetricReport, error_utilization_penalty: f32, now: Instant) {
        let utilization = if report.application_utilization > 0.0 {
            report.application_utilization
        } else {
            report.cpu_utilization
        };
        if report.qps <= 0.0 || utilization <= 0.0 {
            return;
        }
        let penalty = if report.eps > 0.0 {
            (report.eps / report.qps) * error_utilization_penalty as f64
        } else {
            0.0
        };
        let weight = report.qps / (utilization + penalty);
        self.bits.store(weight.to_bits(), Ordering::Relaxed);
        let mut non_empty_since = self.non_empty_since.lock();
        if non_empty_since.is_none() {
            *non_empty_since = Some(now);
        }
        *self.last_update_time.lock() = Some(now);
    }

    pub fn read(&self, blackout: Duration, expiration: Duration, now: Instant) -> f32 {
        let last_update = *self.last_update_time.lock();
        let Some(last_update) = last_update else {
            return 0.0;
        };
        if now.saturating_duration_since(last_update) >= expiration {
            *self.non_empty_since.lock() = None;
            return 0.0;
        }
        let non_empty_since = *self.non_empty_since.lock();
        match non_empty_since {
            Some(since) if now.saturating_duration_since(since) >= blackout => {
                f64::from_bits(self.bits.load(Ordering::Relaxed)) as f32
            }
            _ => 0.0,
        }
    }
}

struct Entry {
    subchannel: Arc<dyn Subchannel>,
    address: SocketAddr,
    weight: Arc<EndpointWeight>,
    state: ConnectivityState,
    status: Status,
}

struct Inner {
    entries: Vec<Entry>,
    config: Arc<WeightedRoundRobinConfig>,
    scheduler: Arc<ArcSwap<Option<StrideScheduler>>>,
    shutdown: bool,
}

pub struct WeightedRoundRobinPolicy {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
}

struct WrrWatcher {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
    address: SocketAddr,
}

impl ConnectivityStateWatcher for WrrWatcher {
    fn on_state_change(&self, state: ConnectivityState, status: Status) {
        {
            let mut g = self.inner.lock();
            if g.shutdown {
                return;
            }
            let Some(entry) = g.entries.iter_mut().find(|e| e.address == self.address) else {
                return;
            };
            if state == ConnectivityState::Ready {
                entry.weight.reset_non_empty_since();
            }
            entry.state = state;
            entry.status = status;
        }
        publish(&self.inner, &self.helper);
    }
}

struct WrrCallTracker {
    weight: Arc<EndpointWeight>,
    error_utilization_penalty: f32,
}

impl SubchannelCallTracker for WrrCallTracker {
    fn finish(&self, status: &Status) {
        let _ = status;
    }

    fn record_metrics(&self, report: &BackendMetricReport) {
        self.weight
            .maybe_update(report, self.error_utilization_penalty, Instant::now());
    }
}

struct WrrPicker {
    scheduler: Arc<ArcSwap<Option<StrideScheduler>>>,
    subchannels: Vec<Arc<dyn Subchannel>>,
    weights: Vec<Arc<EndpointWeight>>,
    error_utilization_penalty: f32,
    suppress_per_call_tracking: bool,
}

impl Picker for WrrPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        if self.subchannels.is_empty() {
            return PickResult::Queue;
        }
        let index = match self.scheduler.load().as_ref() {
            Some(s) => s.next() % self.subchannels.len(),
            None => 0,
        };
        if self.suppress_per_call_tracking {
            PickResult::complete(self.subchannels[index].clone())
        } else {
            PickResult::complete_with_tracker(
                self.subchannels[index].clone(),
                Arc::new(WrrCallTracker {
                    weight: self.weights[index].clone(),
                    error_utilization_penalty: self.error_utilization_penalty,
                }),
            )
        }
    }
}

impl WeightedRoundRobinPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: Vec::new(),
                config: Arc::new(WeightedRoundRobinConfig::default()),
                scheduler: Arc::new(ArcSwap::from_pointee(None)),
                shutdown: false,
            })),
            helper,
        }
    }

    /// Recomputes weights for every READY endpoint and atomically swaps
    /// in a fresh scheduler; called on the `weightUpdatePeriod` timer, or
    /// directly by tests.
    pub fn rebuild_scheduler_locked(&self) {
        let g = self.inner.lock();
        let now = Instant::now();
        let weights: Vec<f32> = g
            .entries
            .iter()
            .map(|e| {
                e.weight
                    .read(g.config.blackout_period, g.config.weight_expiration_period, now)
            })
            .collect();
        if weights.is_empty() {
            return;
        }
        g.scheduler.store(Arc::new(Some(StrideScheduler::new(&weights))));
    }

    fn publish_locked(&self) {
        publish(&self.inner, &self.helper);
    }
}

fn publish(inner: &Arc<Mutex<Inner>>, helper: &Arc<dyn ChannelControlHelper>) {
    let g = inner.lock();
    let ready: Vec<&Entry> = g
        .entries
        .iter()
        .filter(|e| e.state == ConnectivityState::Ready)
        .collect();
    let (state, status) = if !ready.is_empty() {
        (ConnectivityState::Ready, Status::ok())
    } else if g.entries.iter().any(|e| e.state == ConnectivityState::Connecting) {
        (ConnectivityState::Connecting, Status::ok())
    } else if !g.entries.is_empty() && g.entries.iter().all(|e| e.state == ConnectivityState::TransientFailure) {
        (
            ConnectivityState::TransientFailure,
            g.entries.last().map(|e| e.status.clone()).unwrap_or_else(Status::ok),
        )
    } else {
        (ConnectivityState::Connecting, Status::ok())
    };

    let picker: Arc<dyn Picker> = match state {
        ConnectivityState::Ready => Arc::new(WrrPicker {
            scheduler: g.scheduler.clone(),
            subchannels: ready.iter().map(|e| e.subchannel.clone()).collect(),
            weights: ready.iter().map(|e| e.weight.clone()).collect(),
            error_utilization_penalty: g.config.error_utilization_penalty,
            suppress_per_call_tracking: g.config.enable_oob_load_report,
        }),
        ConnectivityState::TransientFailure => Arc::new(crate::lb::picker::FailPicker(status.clone())),
        _ => Arc::new(crate::lb::picker::QueuePicker),
    };
    debug!(target: "weighted_round_robin", %state, "publishing state");
    drop(g);
    helper.update_state(state, status, picker);
}

impl LoadBalancingPolicy for WeightedRoundRobinPolicy {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let addresses: Vec<ServerAddress> = match args.addresses {
            Ok(a) => a,
            Err(status) => {
                self.helper.update_state(
                    ConnectivityState::TransientFailure,
                    status.clone(),
                    Arc::new(crate::lb::picker::FailPicker(status.clone())),
                );
                return Err(status);
            }
        };
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

        let config = args
            .config
            .as_any()
            .downcast_ref::<WeightedRoundRobinConfig>()
            .map(|c| Arc::new(WeightedRoundRobinConfig {
                enable_oob_load_report: c.enable_oob_load_report,
                oob_reporting_period: c.oob_reporting_period,
                blackout_period: c.blackout_period,
                weight_update_period: c.weight_update_period.max(Duration::from_millis(100)),
                weight_expiration_period: c.weight_expiration_period,
                error_utilization_penalty: c.error_utilization_penalty,
            }))
            .unwrap_or_else(|| Arc::new(WeightedRoundRobinConfig::default()));

        let mut sorted = addresses;
        sorted.sort();
        sorted.dedup_by(|a, b| a.socket_address == b.socket_address);

        let existing: HashMap<SocketAddr, (Arc<dyn Subchannel>, Arc<EndpointWeight>)> = {
            let g = self.inner.lock();
            g.entries
                .iter()
                .map(|e| (e.address, (e.subchannel.clone(), e.weight.clone())))
                .collect()
        };

        let mut new_entries = Vec::with_capacity(sorted.len());
        for addr in &sorted {
            let (subchannel, weight) = match existing.get(&addr.socket_address) {
                Some((sc, w)) => (sc.clone(), w.clone()),
                None => {
                    let sc = self
                        .helper
                        .create_subchannel(addr.socket_address)
                        .ok_or_else(|| Status::unavailable("channel is shutting down"))?;
                    (sc, EndpointWeight::new())
                }
            };
            new_entries.push(Entry {
                subchannel,
                address: addr.socket_address,
                weight,
                state: ConnectivityState::Idle,
                status: Status::ok(),
            });
        }

        {
            let mut g = self.inner.lock();
            g.entries = new_entries;
            g.config = config;
        }

        let addrs: Vec<SocketAddr> = {
            let g = self.inner.lock();
            g.entries.iter().map(|e| e.address).collect()
        };
        for addr in addrs {
            let sc = {
                let g = self.inner.lock();
                g.entries.iter().find(|e| e.address == addr).unwrap().subchannel.clone()
            };
            let watcher: Arc<dyn ConnectivityStateWatcher> = Arc::new(WrrWatcher {
                inner: self.inner.clone(),
                helper: self.helper.clone(),
                address: addr,
            });
            sc.watch_connectivity_state(watcher);
            sc.request_connection();
        }

        self.publish_locked();
        Ok(())
    }

    fn reset_backoff_locked(&mut self) {
        let g = self.inner.lock();
        for e in &g.entries {
            e.subchannel.reset_backoff();
        }
    }

    fn shutdown_locked(&mut self) {
        let mut g = self.inner.lock();
        g.shutdown = true;
        g.entries.clear();
    }
}

/// An out-of-band report watcher registered per subchannel when
/// `enableOobLoadReport` is set; suppresses per-call tracking on that
/// subchannel since load is reported on its own cadence instead.
pub struct OobReportWatcher {
    weight: Arc<EndpointWeight>,
    error_utilization_penalty: f32,
}

impl OobReportWatcher {
    pub fn new(weight: Arc<EndpointWeight>, error_utilization_penalty: f32) -> Arc<Self> {
        Arc::new(Self {
            weight,
            error_utilization_penalty,
        })
    }

    pub fn report(&self, report: &BackendMetricReport) {
        self.weight
            .maybe_update(report, self.error_utilization_penalty, Instant::now());
    }
}

impl DataWatcher for OobReportWatcher {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_sample_is_dropped_below_zero_qps() {
        let w = EndpointWeight::new();
        w.maybe_update(
            &BackendMetricReport {
                qps: 0.0,
                eps: 0.0,
                application_utilization: 0.5,
                cpu_utilization: 0.0,
            },
            1.0,
            Instant::now(),
        );
        assert_eq!(w.read(Duration::ZERO, Duration::from_secs(60), Instant::now()), 0.0);
    }

    #[test]
    fn weight_matches_scenario_c_formula() {
        let w = EndpointWeight::new();
        let now = Instant::now();
        w.maybe_update(
            &BackendMetricReport {
                qps: 100.0,
                eps: 0.0,
                application_utilization: 0.5,
                cpu_utilization: 0.0,
            },
            1.0,
            now,
        );
        // Blackout elapses instantly in this test by asking for a read at
        // a later instant past a zero blackout period.
        let read = w.read(Duration::ZERO, Duration::from_secs(60), now + Duration::from_millis(1));
        assert!((read - 200.0).abs() < 0.01, "weight was {read}");
    }

    #[test]
    fn weight_reads_zero_during_blackout() {
        let w = EndpointWeight::new();
        let now = Instant::now();
        w.maybe_update(
            &BackendMetricReport {
                qps: 100.0,
                eps: 0.0,
                application_utilization: 0.5,
                cpu_utilization: 0.0,
            },
            1.0,
            now,
        );
        let read = w.read(Duration::from_secs(10), Duration::from_secs(60), now);
        assert_eq!(read, 0.0);
    }

    #[test]
    fn weight_expires_after_expiration_period() {
        let w = EndpointWeight::new();
        let now = Instant::now();
        w.maybe_update(
            &BackendMetricReport {
                qps: 100.0,
                eps: 0.0,
                application_utilization: 0.5,
                cpu_utilization: 0.0,
            },
            1.0,
            now,
        );
        let later = now + Duration::from_secs(200);
        let read = w.read(Duration::ZERO, Duration::from_secs(180), later);
        assert_eq!(read, 0.0);
    }
}
