//! # tonic-xds
//!
//! Client-side gRPC load-balancing core: a pluggable LB-policy tree and
//! subchannel state/eviction machinery, modeled on grpc/grpc's C++
//! client-channel LB policies and their [documented xDS feature
//! set](https://github.com/grpc/grpc/blob/master/doc/grpc_xds_features.md).
//!
//! The eight stable policy names from `lb::registry` cover the load
//! balancing behavior used by a production xDS client: `pick_first`,
//! `weighted_round_robin`, `priority_experimental`,
//! `weighted_target_experimental`, `outlier_detection_experimental`,
//! `xds_cluster_impl_experimental`, `xds_override_host_experimental`, and
//! `xds_wrr_locality_experimental`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tonic_xds::lb::address::ServerAddress;
//! use tonic_xds::lb::policies::pick_first::PickFirstConfig;
//! use tonic_xds::client::channel::LbChannel;
//!
//! # fn example<S>(service: S, addr: std::net::SocketAddr)
//! # where S: tower::Service<()> + Clone + Send + 'static, S::Future: Send + 'static, S::Error: Into<tower::BoxError> {
//! let channel: LbChannel<(), S> = LbChannel::new("pick_first").unwrap();
//! channel.insert_service(addr, service);
//! channel
//!     .update(vec![ServerAddress::new(addr)], Arc::new(PickFirstConfig::default()))
//!     .unwrap();
//! # }
//! ```

pub mod client;
pub mod common;
pub mod lb;
pub mod status;
pub mod xds;

pub use xds::uri::{XdsUri, XdsUriError};
