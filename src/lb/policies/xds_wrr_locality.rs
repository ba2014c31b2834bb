//! `xds_wrr_locality`: translates per-address locality weights into a
//! generated `weighted_target` config, one child per locality (spec §4.10).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::lb::address::ServerAddress;
use crate::lb::child_handler::ChildPolicyHandler;
use crate::lb::policies::weighted_target::{TargetConfig, WeightedTargetConfig};
use crate::lb::policy::{ChannelArgs, ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::status::Status;

pub const LOCALITY_ATTRIBUTE_KEY: &str = "xds_locality";

#[derive(Debug, Clone, PartialEq)]
pub struct XdsLocalityAttribute {
    pub locality_name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct XdsWrrLocalityConfig {
    pub child_policy: String,
}

impl Config for XdsWrrLocalityConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

const DEFAULT_LOCALITY: &str = "__no_locality__";

/// Builds the `weighted_target` targets map for one resolver update,
/// deduplicating localities and keeping the first observed weight for
/// each (spec §4.10: "the first observed wins").
pub fn compute_targets(addresses: &[ServerAddress], child_policy: &str) -> HashMap<String, TargetConfig> {
    let mut targets: HashMap<String, TargetConfig> = HashMap::new();
    let mut any_locality = false;
    for addr in addresses {
        if let Some(locality) = addr.attributes.get_as::<XdsLocalityAttribute>(LOCALITY_ATTRIBUTE_KEY) {
            any_locality = true;
            match targets.get(&locality.locality_name) {
                Some(existing) if existing.weight != locality.weight => {
                    warn!(
                        target: "xds_wrr_locality",
                        locality = %locality.locality_name,
                        "inconsistent weight observed; first value wins"
                    );
                }
                Some(_) => {}
                None => {
                    targets.insert(
                        locality.locality_name.clone(),
                        TargetConfig {
                            weight: locality.weight,
                            config_name: child_policy.to_string(),
                        },
                    );
                }
            }
        }
    }
    if !any_locality && !addresses.is_empty() {
        targets.insert(
            DEFAULT_LOCALITY.to_string(),
            TargetConfig {
                weight: 1,
                config_name: child_policy.to_string(),
            },
        );
    }
    targets
}

struct Inner {
    handler: ChildPolicyHandler,
}

pub struct XdsWrrLocalityPolicy {
    inner: Arc<Mutex<Inner>>,
}

impl XdsWrrLocalityPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                handler: ChildPolicyHandler::new(helper),
            })),
        }
    }
}

impl LoadBalancingPolicy for XdsWrrLocalityPolicy {
    fn name(&self) -> &'static str {
        "xds_wrr_locality_experimental"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let config = args
            .config
            .as_any()
            .downcast_ref::<XdsWrrLocalityConfig>()
            .ok_or_else(|| Status::internal("xds_wrr_locality: wrong config type"))?;

        let targets = match &args.addresses {
            Ok(addresses) => compute_targets(addresses, &config.child_policy),
            Err(_) => HashMap::new(),
        };
        let generated = Arc::new(WeightedTargetConfig { targets });

        let child_args = UpdateArgs {
            addresses: args.addresses,
            config: generated,
            resolution_note: args.resolution_note,
            args: ChannelArgs::new(),
        };

        let g = self.inner.lock();
        g.handler.update_locked(
            "weighted_target_experimental",
            |h| {
                crate::lb::registry::global()
                    .build("weighted_target_experimental", h)
                    .expect("weighted_target_experimental must be registered")
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
    use std::sync::Arc as StdArc;

    fn addr_with_locality(port: u16, name: &str, weight: u32) -> ServerAddress {
        ServerAddress::new(format!("127.0.0.1:{port}").parse().unwrap()).with_attribute(
            LOCALITY_ATTRIBUTE_KEY,
            StdArc::new(XdsLocalityAttribute {
                locality_name: name.to_string(),
                weight,
            }),
        )
    }

    #[test]
    fn groups_addresses_by_locality_with_their_weight() {
        let addresses = vec![
            addr_with_locality(1, "us-east", 10),
            addr_with_locality(2, "us-east", 10),
            addr_with_locality(3, "us-west", 20),
        ];
        let targets = compute_targets(&addresses, "pick_first");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["us-east"].weight, 10);
        assert_eq!(targets["us-west"].weight, 20);
        assert_eq!(targets["us-west"].config_name, "pick_first");
    }

    #[test]
    fn first_observed_weight_wins_on_conflict() {
        let addresses = vec![
            addr_with_locality(1, "us-east", 10),
            addr_with_locality(2, "us-east", 99),
        ];
        let targets = compute_targets(&addresses, "pick_first");
        assert_eq!(targets["us-east"].weight, 10);
    }

    #[test]
    fn addresses_without_locality_get_a_single_default_target() {
        let addresses = vec![ServerAddress::new("127.0.0.1:1".parse().unwrap())];
        let targets = compute_targets(&addresses, "pick_first");
        assert_eq!(targets.len(), 1);
    }
}
