//! The data-plane side of the model: pickers, pick arguments and results
//! (spec §3, "Picker").

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::lb::subchannel::Subchannel;
use crate::status::Status;

/// Per-call attributes threaded through the pick path (e.g. the xDS host
/// override cookie). Stands in for the original's arena-allocated
/// per-call state; here it is a simple attribute bag since the core does
/// not need a custom allocator.
#[derive(Default)]
pub struct CallState {
    attributes: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl CallState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &'static str, value: Box<dyn Any + Send + Sync>) {
        self.attributes.insert(key, value);
    }

    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref::<T>())
    }
}

/// Arguments passed to [`Picker::pick`] for a single outbound call.
pub struct PickArgs<'a> {
    pub path: &'a str,
    pub call_state: &'a mut CallState,
}

/// Observes the lifecycle of a call that was routed to a particular
/// subchannel, so policies like `outlier_detection` and `xds_cluster_impl`
/// can count successes/failures or track in-flight concurrency.
///
/// `finish` is passed through to any decorated tracker *first*, so
/// wrapping trackers see the true status before recording their own
/// accounting (spec §4.7).
pub trait SubchannelCallTracker: Send + Sync {
    fn start(&self) {}
    fn finish(&self, status: &Status);

    /// Per-call backend-metric report, delivered (by the transport layer,
    /// out of scope here) some time before `finish`. Only
    /// `weighted_round_robin` and `xds_cluster_impl`'s load reporting
    /// consume this; the default is a no-op.
    fn record_metrics(&self, _report: &crate::lb::policies::weighted_round_robin::BackendMetricReport) {}
}

/// The outcome of a pick.
pub enum PickResult {
    /// Route the call to `subchannel`. `call_tracker`, if present, is
    /// notified of call start/finish.
    Complete {
        subchannel: Arc<dyn Subchannel>,
        call_tracker: Option<Arc<dyn SubchannelCallTracker>>,
    },
    /// No subchannel is ready yet; the caller should queue and retry once
    /// a new picker is published.
    Queue,
    /// The call cannot be served; propagate `status` to the caller.
    Fail(Status),
    /// The call was deliberately dropped by policy (not a failure); the
    /// call framework must not retry it.
    Drop(Status),
}

impl PickResult {
    pub fn complete(subchannel: Arc<dyn Subchannel>) -> Self {
        PickResult::Complete {
            subchannel,
            call_tracker: None,
        }
    }

    pub fn complete_with_tracker(
        subchannel: Arc<dyn Subchannel>,
        call_tracker: Arc<dyn SubchannelCallTracker>,
    ) -> Self {
        PickResult::Complete {
            subchannel,
            call_tracker: Some(call_tracker),
        }
    }
}

/// An immutable, thread-safe function object from call context to a pick
/// decision. A new picker is produced whenever a policy's externally
/// visible state changes; pickers themselves never mutate.
pub trait Picker: Send + Sync {
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult;
}

/// A picker that queues every call — the state assumed between policy
/// construction and its first published `(state, status, picker)` tuple.
pub struct QueuePicker;

impl Picker for QueuePicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// A picker that fails every call with a fixed status.
pub struct FailPicker(pub Status);

impl Picker for FailPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_picker_always_queues() {
        let picker = QueuePicker;
        let mut state = CallState::new();
        let mut args = PickArgs {
            path: "/svc/method",
            call_state: &mut state,
        };
        assert!(matches!(picker.pick(&mut args), PickResult::Queue));
    }

    #[test]
    fn call_state_roundtrips_typed_attributes() {
        let mut state = CallState::new();
        state.set("host-override", Box::new("1.2.3.4:80".to_string()));
        assert_eq!(
            state.get::<String>("host-override").map(String::as_str),
            Some("1.2.3.4:80")
        );
    }
}
