//! `xds_cluster_impl`: circuit breaker, EDS drop categories, and LRS load
//! reporting for one xDS cluster, wrapping a child policy (spec §4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::lb::child_handler::ChildPolicyHandler;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::helper::ForwardingChannelControlHelper;
use crate::lb::picker::{PickArgs, PickResult, Picker, SubchannelCallTracker};
use crate::lb::policy::{ChannelArgs, ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::status::Status;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DropCategory {
    pub category: String,
    pub requests_per_million: u32,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DropConfig {
    #[serde(default)]
    pub categories: Vec<DropCategory>,
}

impl DropConfig {
    /// True when any category is configured to drop every request (spec
    /// §4.8 "`drop_config.drop_all`").
    pub fn drop_all(&self) -> bool {
        self.categories.iter().any(|c| c.requests_per_million >= 1_000_000)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct XdsClusterImplConfig {
    pub cluster_name: String,
    #[serde(default)]
    pub eds_service_name: Option<String>,
    #[serde(default)]
    pub lrs_load_reporting_server: Option<String>,
    pub max_concurrent_requests: u32,
    #[serde(default)]
    pub drop_config: DropConfig,
    pub child_policy: String,
}

impl Config for XdsClusterImplConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A handle to one cluster's process-wide in-flight counter. Shared by
/// every channel that builds an `xds_cluster_impl` for the same
/// `(cluster, eds_service_name)` pair, mirroring the original's global
/// circuit-breaker registry.
#[derive(Clone)]
pub struct CircuitBreaker {
    in_flight: Arc<AtomicU32>,
    limit: u32,
}

impl CircuitBreaker {
    /// Read-only admission check; the actual increment happens in
    /// `increment` when the chosen call's tracker starts (spec §4.8:
    /// "the channel increments only when the chosen subchannel call
    /// actually starts").
    fn admits(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.limit
    }

    fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn circuit_breakers() -> &'static Mutex<HashMap<(String, String), Arc<AtomicU32>>> {
    static MAP: OnceLock<Mutex<HashMap<(String, String), Arc<AtomicU32>>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

fn circuit_breaker_for(cluster_name: &str, eds_service_name: &str, limit: u32) -> CircuitBreaker {
    let key = (cluster_name.to_string(), eds_service_name.to_string());
    let mut g = circuit_breakers().lock();
    let in_flight = g.entry(key).or_insert_with(|| Arc::new(AtomicU32::new(0))).clone();
    CircuitBreaker { in_flight, limit }
}

/// Locality load-reporting accumulator (spec §4.8 "Load reporting"). A
/// real LRS transport is out of this core's scope; this is the handle its
/// call tracker would report into.
#[derive(Default)]
pub struct XdsClusterLocalityStats {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_in_progress: AtomicI64,
}

impl XdsClusterLocalityStats {
    pub fn call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
        self.calls_in_progress.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_call_finished(&self, errored: bool) {
        self.calls_in_progress.fetch_sub(1, Ordering::Relaxed);
        if errored {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> (u64, u64, u64, i64) {
        (
            self.calls_started.load(Ordering::Relaxed),
            self.calls_succeeded.load(Ordering::Relaxed),
            self.calls_failed.load(Ordering::Relaxed),
            self.calls_in_progress.load(Ordering::Relaxed),
        )
    }
}

/// Draws one sample per configured drop category, in declaration order,
/// and returns the first hit (spec §4.8 "Drop categories"). `roll` is
/// injected so the policy is pure-function testable.
pub fn pick_drop_category(
    categories: &[DropCategory],
    roll: impl Fn() -> u32,
) -> Option<&str> {
    for category in categories {
        if roll() < category.requests_per_million {
            return Some(&category.category);
        }
    }
    None
}

struct Inner {
    config: Arc<XdsClusterImplConfig>,
    breaker: CircuitBreaker,
    locality_stats: HashMap<String, Arc<XdsClusterLocalityStats>>,
    uncategorized_drops: u64,
    category_drops: HashMap<String, u64>,
    handler: ChildPolicyHandler,
}

pub struct XdsClusterImplPolicy {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
}

struct ClusterImplHelper {
    inner: Arc<dyn ChannelControlHelper>,
    state: Arc<Mutex<Inner>>,
}

impl ForwardingChannelControlHelper for ClusterImplHelper {
    fn inner(&self) -> &Arc<dyn ChannelControlHelper> {
        &self.inner
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let (config, breaker, force_ready) = {
            let g = self.state.lock();
            (g.config.clone(), g.breaker.clone(), g.config.drop_config.drop_all())
        };
        let wrapped: Arc<dyn Picker> = Arc::new(ClusterImplPicker {
            child: picker,
            config,
            breaker,
            state: self.state.clone(),
        });
        if force_ready {
            self.inner.update_state(ConnectivityState::Ready, Status::ok(), wrapped);
        } else {
            self.inner.update_state(state, status, wrapped);
        }
    }
}

struct ClusterImplPicker {
    child: Arc<dyn Picker>,
    config: Arc<XdsClusterImplConfig>,
    breaker: CircuitBreaker,
    state: Arc<Mutex<Inner>>,
}

impl Picker for ClusterImplPicker {
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult {
        if let Some(category) = pick_drop_category(&self.config.drop_config.categories, || fastrand::u32(0..1_000_000)) {
            let mut g = self.state.lock();
            *g.category_drops.entry(category.to_string()).or_insert(0) += 1;
            return PickResult::Drop(Status::unavailable(format!("EDS-configured drop: {category}")));
        }

        if !self.breaker.admits() {
            self.state.lock().uncategorized_drops += 1;
            return PickResult::Drop(Status::unavailable("circuit breaker drop"));
        }

        match self.child.pick(args) {
            PickResult::Complete { subchannel, call_tracker } => {
                let locality = args
                    .call_state
                    .get::<String>("xds_locality_name")
                    .cloned();
                let stats = locality.and_then(|name| self.state.lock().locality_stats.get(&name).cloned());
                PickResult::complete_with_tracker(
                    subchannel,
                    Arc::new(ClusterImplCallTracker {
                        inner: call_tracker,
                        breaker: self.breaker.clone(),
                        stats,
                    }),
                )
            }
            other => other,
        }
    }
}

struct ClusterImplCallTracker {
    inner: Option<Arc<dyn SubchannelCallTracker>>,
    breaker: CircuitBreaker,
    stats: Option<Arc<XdsClusterLocalityStats>>,
}

impl SubchannelCallTracker for ClusterImplCallTracker {
    fn start(&self) {
        if let Some(inner) = &self.inner {
            inner.start();
        }
        self.breaker.increment();
        if let Some(stats) = &self.stats {
            stats.call_started();
        }
    }

    fn finish(&self, status: &Status) {
        if let Some(inner) = &self.inner {
            inner.finish(status);
        }
        if let Some(stats) = &self.stats {
            stats.add_call_finished(!status.is_ok());
        }
        self.breaker.decrement();
    }
}

impl XdsClusterImplPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config: Arc::new(XdsClusterImplConfig {
                    cluster_name: String::new(),
                    eds_service_name: None,
                    lrs_load_reporting_server: None,
                    max_concurrent_requests: u32::MAX,
                    drop_config: DropConfig::default(),
                    child_policy: "pick_first".to_string(),
                }),
                breaker: circuit_breaker_for("", "", u32::MAX),
                locality_stats: HashMap::new(),
                uncategorized_drops: 0,
                category_drops: HashMap::new(),
                handler: ChildPolicyHandler::new(helper.clone()),
            })),
            helper,
        }
    }
}

impl LoadBalancingPolicy for XdsClusterImplPolicy {
    fn name(&self) -> &'static str {
        "xds_cluster_impl_experimental"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let config = args
            .config
            .as_any()
            .downcast_ref::<XdsClusterImplConfig>()
            .ok_or_else(|| Status::internal("xds_cluster_impl: wrong config type"))?;

        let breaker = circuit_breaker_for(
            &config.cluster_name,
            config.eds_service_name.as_deref().unwrap_or(""),
            config.max_concurrent_requests,
        );
        {
            let mut g = self.inner.lock();
            g.config = Arc::new(config.clone());
            g.breaker = breaker;
            if config.lrs_load_reporting_server.is_some() {
                if let Ok(addresses) = &args.addresses {
                    for addr in addresses {
                        if let Some(name) = addr.attributes.get_as::<String>("xds_locality_name") {
                            g.locality_stats
                                .entry(name.clone())
                                .or_insert_with(|| Arc::new(XdsClusterLocalityStats::default()));
                        }
                    }
                }
            }
        }

        let cluster_helper: Arc<dyn ChannelControlHelper> = Arc::new(ClusterImplHelper {
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
        debug!(target: "xds_cluster_impl", cluster = %config.cluster_name, "updating child");
        let g = self.inner.lock();
        g.handler.update_locked(
            config_name,
            |_unused_helper| {
                crate::lb::registry::global()
                    .build(&config_name_for_build, cluster_helper.clone())
                    .unwrap_or_else(|| panic!("unregistered child policy '{config_name_for_build}'"))
            },
            child_args,
        )
    }

    fn shutdown_locked(&mut self) {
        let g = self.inner.lock();
        g.handler.shutdown_locked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_all_category_always_matches() {
        let categories = vec![DropCategory {
            category: "all".to_string(),
            requests_per_million: 1_000_000,
        }];
        assert_eq!(pick_drop_category(&categories, || 999_999), Some("all"));
        let config = DropConfig { categories };
        assert!(config.drop_all());
    }

    #[test]
    fn first_matching_category_wins() {
        let categories = vec![
            DropCategory { category: "a".to_string(), requests_per_million: 0 },
            DropCategory { category: "b".to_string(), requests_per_million: 500_000 },
        ];
        assert_eq!(pick_drop_category(&categories, || 100), Some("b"));
    }

    #[test]
    fn circuit_breaker_admits_up_to_limit_then_drops() {
        let breaker = CircuitBreaker {
            in_flight: Arc::new(AtomicU32::new(0)),
            limit: 2,
        };
        assert!(breaker.admits());
        breaker.increment();
        assert!(breaker.admits());
        breaker.increment();
        assert!(!breaker.admits());
        breaker.decrement();
        assert!(breaker.admits());
    }
}
