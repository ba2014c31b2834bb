//! Delegating helper layering (spec §9: "any number of `DelegatingHelper`
//! layers"), grounded on `delegating_helper.h`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::lb::connectivity::ConnectivityState;
use crate::lb::picker::Picker;
use crate::lb::policy::{ChannelControlHelper, TraceSeverity};
use crate::status::Status;

/// A `ChannelControlHelper` that forwards every method to an inner helper
/// by default. Interior policies that only need to intercept one or two
/// methods (e.g. `outlier_detection` wrapping the picker passed to
/// `update_state`) implement this instead of `ChannelControlHelper`
/// directly, overriding only what they change.
pub trait ForwardingChannelControlHelper: Send + Sync {
    fn inner(&self) -> &Arc<dyn ChannelControlHelper>;

    fn create_subchannel(&self, address: SocketAddr) -> Option<Arc<dyn crate::lb::subchannel::Subchannel>> {
        self.inner().create_subchannel(address)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        self.inner().update_state(state, status, picker)
    }

    fn request_reresolution(&self) {
        self.inner().request_reresolution()
    }

    fn authority(&self) -> &str {
        self.inner().authority()
    }

    fn add_trace_event(&self, severity: TraceSeverity, message: &str) {
        self.inner().add_trace_event(severity, message)
    }
}

/// Blanket bridge so any `ForwardingChannelControlHelper` is usable
/// wherever a `ChannelControlHelper` is expected.
impl<T: ForwardingChannelControlHelper> ChannelControlHelper for T {
    fn create_subchannel(&self, address: SocketAddr) -> Option<Arc<dyn crate::lb::subchannel::Subchannel>> {
        ForwardingChannelControlHelper::create_subchannel(self, address)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        ForwardingChannelControlHelper::update_state(self, state, status, picker)
    }

    fn request_reresolution(&self) {
        ForwardingChannelControlHelper::request_reresolution(self)
    }

    fn authority(&self) -> &str {
        ForwardingChannelControlHelper::authority(self)
    }

    fn add_trace_event(&self, severity: TraceSeverity, message: &str) {
        ForwardingChannelControlHelper::add_trace_event(self, severity, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::testutil::FakeHelper;
    use crate::lb::picker::QueuePicker;

    struct TraceAugmenting {
        inner: Arc<dyn ChannelControlHelper>,
        tag: &'static str,
    }
    impl ForwardingChannelControlHelper for TraceAugmenting {
        fn inner(&self) -> &Arc<dyn ChannelControlHelper> {
            &self.inner
        }
        fn add_trace_event(&self, severity: TraceSeverity, message: &str) {
            self.inner
                .add_trace_event(severity, &format!("[{}] {message}", self.tag));
        }
    }

    #[test]
    fn unoverridden_methods_forward_through() {
        let fake = FakeHelper::new();
        let wrapped = TraceAugmenting {
            inner: fake.clone() as Arc<dyn ChannelControlHelper>,
            tag: "outlier_detection",
        };
        ChannelControlHelper::update_state(&wrapped, ConnectivityState::Ready, Status::ok(), Arc::new(QueuePicker));
        assert_eq!(fake.updates.lock().len(), 1);
    }
}
