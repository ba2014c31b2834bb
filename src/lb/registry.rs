//! Name -> config/builder registry for the stable LB policy names (spec
//! §6), grounded on `lb_policy_factory.h`'s registry pattern and the shape
//! implied by `xds_lb_policy_registry_test.cc`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::lb::policy::{ChannelControlHelper, LoadBalancingPolicy};

/// Builds a fresh policy instance from a parent helper. Registered once
/// per stable policy name; `priority` and `weighted_target` call through
/// this to instantiate children purely from a config name.
pub trait LbPolicyBuilder: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, helper: Arc<dyn ChannelControlHelper>) -> Box<dyn LoadBalancingPolicy>;
}

#[derive(Default)]
pub struct Registry {
    builders: HashMap<&'static str, Arc<dyn LbPolicyBuilder>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, builder: Arc<dyn LbPolicyBuilder>) {
        self.builders.insert(builder.name(), builder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.builders.get(name).cloned()
    }

    pub fn build(
        &self,
        name: &str,
        helper: Arc<dyn ChannelControlHelper>,
    ) -> Option<Box<dyn LoadBalancingPolicy>> {
        self.get(name).map(|b| b.build(helper))
    }
}

struct FnBuilder<F> {
    name: &'static str,
    make: F,
}

impl<F> LbPolicyBuilder for FnBuilder<F>
where
    F: Fn(Arc<dyn ChannelControlHelper>) -> Box<dyn LoadBalancingPolicy> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn build(&self, helper: Arc<dyn ChannelControlHelper>) -> Box<dyn LoadBalancingPolicy> {
        (self.make)(helper)
    }
}

/// Builds the registry of the eight stable policy names from spec.md §6,
/// each wired to its `Default`-configured builder.
pub fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut r = Registry::new();
        r.register(Arc::new(FnBuilder {
            name: "pick_first",
            make: |h| Box::new(crate::lb::policies::pick_first::PickFirstPolicy::new(h))
                as Box<dyn LoadBalancingPolicy>,
        }));
        r.register(Arc::new(FnBuilder {
            name: "weighted_round_robin",
            make: |h| {
                Box::new(crate::lb::policies::weighted_round_robin::WeightedRoundRobinPolicy::new(h))
                    as Box<dyn LoadBalancingPolicy>
            },
        }));
        r.register(Arc::new(FnBuilder {
            name: "priority_experimental",
            make: |h| Box::new(crate::lb::policies::priority::PriorityPolicy::new(h))
                as Box<dyn LoadBalancingPolicy>,
        }));
        r.register(Arc::new(FnBuilder {
            name: "weighted_target_experimental",
            make: |h| Box::new(crate::lb::policies::weighted_target::WeightedTargetPolicy::new(h))
                as Box<dyn LoadBalancingPolicy>,
        }));
        r.register(Arc::new(FnBuilder {
            name: "outlier_detection_experimental",
            make: |h| Box::new(crate::lb::policies::outlier_detection::OutlierDetectionPolicy::new(h))
                as Box<dyn LoadBalancingPolicy>,
        }));
        r.register(Arc::new(FnBuilder {
            name: "xds_cluster_impl_experimental",
            make: |h| Box::new(crate::lb::policies::xds_cluster_impl::XdsClusterImplPolicy::new(h))
                as Box<dyn LoadBalancingPolicy>,
        }));
        r.register(Arc::new(FnBuilder {
            name: "xds_override_host_experimental",
            make: |h| Box::new(crate::lb::policies::xds_override_host::XdsOverrideHostPolicy::new(h))
                as Box<dyn LoadBalancingPolicy>,
        }));
        r.register(Arc::new(FnBuilder {
            name: "xds_wrr_locality_experimental",
            make: |h| Box::new(crate::lb::policies::xds_wrr_locality::XdsWrrLocalityPolicy::new(h))
                as Box<dyn LoadBalancingPolicy>,
        }));
        r
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::testutil::FakeHelper;

    #[test]
    fn global_registry_resolves_pick_first() {
        let helper = FakeHelper::new() as Arc<dyn ChannelControlHelper>;
        let policy = global().build("pick_first", helper).unwrap();
        assert_eq!(policy.name(), "pick_first");
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let helper = FakeHelper::new() as Arc<dyn ChannelControlHelper>;
        assert!(global().build("does_not_exist", helper).is_none());
    }
}
