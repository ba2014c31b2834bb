//! The `LoadBalancingPolicy` contract and its parent-facing helper (spec §3
//! "LoadBalancingPolicy", §4.1).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::lb::address::ServerAddress;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::picker::Picker;
use crate::lb::subchannel::Subchannel;
use crate::status::Status;

/// A typed, immutable, reference-counted policy configuration. Each
/// policy defines its own concrete config type and downcasts via
/// [`Config::as_any`]; see `lb::registry` for the name -> config mapping.
pub trait Config: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// A named bag of channel arguments consumed across the tree (spec §6):
/// health-check toggles, failover timeouts, the xDS cluster name a parent
/// injects for its child, etc.
#[derive(Clone, Debug, Default)]
pub struct ChannelArgs {
    values: HashMap<&'static str, ChannelArgValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelArgValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: ChannelArgValue) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(ChannelArgValue::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn int(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(ChannelArgValue::Int(i)) => *i,
            _ => default,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(ChannelArgValue::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// The resolver update delivered to the root policy and threaded down
/// through the tree (spec §3 "UpdateArgs").
pub struct UpdateArgs {
    /// `Err` means resolution failed; policies typically retain the
    /// previous address list and surface the error upward.
    pub addresses: Result<Vec<ServerAddress>, Status>,
    pub config: Arc<dyn Config>,
    pub resolution_note: String,
    pub args: ChannelArgs,
}

impl UpdateArgs {
    /// Builds the `UNAVAILABLE("empty address list: <note>")` status used
    /// whenever a policy is handed no addresses to work with (spec §7).
    pub fn empty_address_status(note: &str) -> Status {
        Status::unavailable(format!("empty address list: {note}"))
    }
}

/// One `(state, status, picker)` tuple published by a child to its parent.
#[derive(Clone)]
pub struct ChannelStateUpdate {
    pub state: ConnectivityState,
    pub status: Status,
    pub picker: Arc<dyn Picker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSeverity {
    Info,
    Warning,
    Error,
}

/// The capability set a parent policy (or the channel, for the root)
/// exposes to a child (spec §4.1, "Public contract to a parent policy").
pub trait ChannelControlHelper: Send + Sync {
    /// May return `None` only if the channel is shutting down. Identity of
    /// the returned subchannel is stable per address within the channel.
    fn create_subchannel(&self, address: SocketAddr) -> Option<Arc<dyn Subchannel>>;

    /// Publishes the child's latest externally visible state. May be
    /// called zero or more times per `update`.
    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>);

    /// Advisory: ask the channel to re-run the resolver.
    fn request_reresolution(&self);

    fn authority(&self) -> &str {
        ""
    }

    fn add_trace_event(&self, _severity: TraceSeverity, _message: &str) {}
}

/// A node in the policy tree (spec §3 "LoadBalancingPolicy").
///
/// Every mutating method here is only legal to call from inside the
/// channel's [`crate::lb::serializer::WorkSerializer`] (spec §5); methods
/// are named `*_locked` to mirror that discipline explicitly, the same
/// way the source suffixes them to flag "only call me while holding the
/// lock".
pub trait LoadBalancingPolicy: Send {
    /// The stable policy name (spec §6), e.g. `"pick_first"`.
    fn name(&self) -> &'static str;

    /// Handle a new resolver update. Implementations report their new
    /// `(state, status, picker)` via their helper; they must not assume
    /// any particular number of `update_state` calls per `update_locked`.
    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status>;

    /// Re-attempt connections after the channel exits idle. Default is a
    /// no-op for policies with no notion of idleness.
    fn exit_idle_locked(&mut self) {}

    /// Reset backoff timers on every owned subchannel.
    fn reset_backoff_locked(&mut self) {}

    /// Orphans the policy: destroys every subchannel wrapper, every child
    /// policy, and every pending watcher/timer it owns. A policy must
    /// never publish a picker after this returns.
    fn shutdown_locked(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_args_default_when_missing() {
        let args = ChannelArgs::new().with("a", ChannelArgValue::Bool(true));
        assert!(args.bool("a", false));
        assert!(!args.bool("missing", false));
        assert_eq!(args.int("missing-int", 42), 42);
    }

    #[test]
    fn empty_address_status_carries_note() {
        let status = UpdateArgs::empty_address_status("DNS lookup failed");
        assert!(status.message().contains("DNS lookup failed"));
        assert_eq!(status.code(), crate::status::Code::Unavailable);
    }
}
