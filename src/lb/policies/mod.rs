//! The stable LB policy implementations (spec §4, §6).

pub mod outlier_detection;
pub mod pick_first;
pub mod priority;
pub mod stride_scheduler;
pub mod weighted_round_robin;
pub mod weighted_target;
pub mod xds_cluster_impl;
pub mod xds_override_host;
pub mod xds_wrr_locality;
