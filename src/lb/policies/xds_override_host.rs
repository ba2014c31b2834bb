//! `xds_override_host`: lets a call bypass the child picker and pin to a
//! specific host cookie (spec §4.9).

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::lb::child_handler::ChildPolicyHandler;
use crate::lb::connectivity::ConnectivityState;
use crate::lb::helper::ForwardingChannelControlHelper;
use crate::lb::picker::{PickArgs, PickResult, Picker};
use crate::lb::policy::{ChannelArgs, ChannelControlHelper, Config, LoadBalancingPolicy, UpdateArgs};
use crate::lb::subchannel::{ConnectivityStateWatcher, DataWatcher, Subchannel};
use crate::status::Status;

pub const OVERRIDE_HOST_CALL_ATTRIBUTE: &str = "xds_host_override_type";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct XdsOverrideHostConfig {
    pub child_policy: String,
}

impl Config for XdsOverrideHostConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

type OverrideMap = Arc<Mutex<HashMap<String, Option<Weak<OverrideHostSubchannel>>>>>;

/// A thin pass-through wrapper created for every subchannel this policy's
/// children create. Its only job is to occupy the override map's slot for
/// its address and clear that slot again when dropped (spec §4.9 "cleared
/// in the wrapper's destructor").
struct OverrideHostSubchannel {
    inner: Arc<dyn Subchannel>,
    key: String,
    map: OverrideMap,
}

impl Drop for OverrideHostSubchannel {
    fn drop(&mut self) {
        if let Some(slot) = self.map.lock().get_mut(&self.key) {
            *slot = None;
        }
    }
}

impl Subchannel for OverrideHostSubchannel {
    fn socket_address(&self) -> SocketAddr {
        self.inner.socket_address()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn watch_connectivity_state(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        self.inner.watch_connectivity_state(watcher);
    }

    fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn ConnectivityStateWatcher>) {
        self.inner.cancel_connectivity_state_watch(watcher);
    }

    fn request_connection(&self) {
        self.inner.request_connection();
    }

    fn reset_backoff(&self) {
        self.inner.reset_backoff();
    }

    fn add_data_watcher(&self, key: &'static str, watcher: Arc<dyn DataWatcher>) {
        self.inner.add_data_watcher(key, watcher);
    }

    fn cancel_data_watcher(&self, key: &'static str) {
        self.inner.cancel_data_watcher(key);
    }
}

struct Inner {
    map: OverrideMap,
    handler: ChildPolicyHandler,
}

pub struct XdsOverrideHostPolicy {
    inner: Arc<Mutex<Inner>>,
    helper: Arc<dyn ChannelControlHelper>,
}

struct OverrideHostHelper {
    inner: Arc<dyn ChannelControlHelper>,
    map: OverrideMap,
}

impl ForwardingChannelControlHelper for OverrideHostHelper {
    fn inner(&self) -> &Arc<dyn ChannelControlHelper> {
        &self.inner
    }

    fn create_subchannel(&self, address: SocketAddr) -> Option<Arc<dyn Subchannel>> {
        let raw = self.inner.create_subchannel(address)?;
        let key = address.to_string();
        let wrapper = Arc::new(OverrideHostSubchannel {
            inner: raw,
            key: key.clone(),
            map: self.map.clone(),
        });
        if let Some(slot) = self.map.lock().get_mut(&key) {
            *slot = Some(Arc::downgrade(&wrapper));
        }
        Some(wrapper as Arc<dyn Subchannel>)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let wrapped: Arc<dyn Picker> = Arc::new(OverrideHostPicker {
            child: picker,
            map: self.map.clone(),
        });
        self.inner.update_state(state, status, wrapped);
    }
}

struct OverrideHostPicker {
    child: Arc<dyn Picker>,
    map: OverrideMap,
}

impl Picker for OverrideHostPicker {
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult {
        if let Some(cookie) = args.call_state.get::<String>(OVERRIDE_HOST_CALL_ATTRIBUTE) {
            if !cookie.is_empty() {
                let live = self
                    .map
                    .lock()
                    .get(cookie)
                    .and_then(|slot| slot.as_ref())
                    .and_then(Weak::upgrade);
                if let Some(wrapper) = live {
                    return PickResult::complete(wrapper.inner.clone());
                }
            }
        }

        match self.child.pick(args) {
            PickResult::Complete { subchannel, call_tracker } => {
                let unwrapped = subchannel
                    .as_any()
                    .downcast_ref::<OverrideHostSubchannel>()
                    .map(|w| w.inner.clone())
                    .unwrap_or(subchannel);
                PickResult::Complete {
                    subchannel: unwrapped,
                    call_tracker,
                }
            }
            other => other,
        }
    }
}

impl XdsOverrideHostPolicy {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: Arc::new(Mutex::new(HashMap::new())),
                handler: ChildPolicyHandler::new(helper.clone()),
            })),
            helper,
        }
    }
}

impl LoadBalancingPolicy for XdsOverrideHostPolicy {
    fn name(&self) -> &'static str {
        "xds_override_host_experimental"
    }

    fn update_locked(&mut self, args: UpdateArgs) -> Result<(), Status> {
        let config = args
            .config
            .as_any()
            .downcast_ref::<XdsOverrideHostConfig>()
            .ok_or_else(|| Status::internal("xds_override_host: wrong config type"))?;

        if let Ok(addresses) = &args.addresses {
            let keys: std::collections::HashSet<String> =
                addresses.iter().map(|a| a.socket_address.to_string()).collect();
            let g = self.inner.lock();
            let mut map = g.map.lock();
            map.retain(|k, _| keys.contains(k));
            for key in keys {
                map.entry(key).or_insert(None);
            }
            drop(map);
            drop(g);
        }

        let override_helper: Arc<dyn ChannelControlHelper> = Arc::new(OverrideHostHelper {
            inner: self.helper.clone(),
            map: self.inner.lock().map.clone(),
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
                    .build(&config_name_for_build, override_helper.clone())
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
    use crate::lb::picker::CallState;
    use crate::lb::testutil::FakeSubchannel;

    #[test]
    fn override_cookie_bypasses_child_picker() {
        let map: OverrideMap = Arc::new(Mutex::new(HashMap::new()));
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let key = addr.to_string();
        map.lock().insert(key.clone(), None);

        let raw = FakeSubchannel::new(addr) as Arc<dyn Subchannel>;
        let wrapper = Arc::new(OverrideHostSubchannel {
            inner: raw,
            key: key.clone(),
            map: map.clone(),
        });
        *map.lock().get_mut(&key).unwrap() = Some(Arc::downgrade(&wrapper));

        let picker = OverrideHostPicker {
            child: Arc::new(crate::lb::picker::FailPicker(Status::internal("no child"))),
            map: map.clone(),
        };
        let mut state = CallState::new();
        state.set(OVERRIDE_HOST_CALL_ATTRIBUTE, Box::new(key.clone()));
        let mut args = PickArgs {
            path: "/s/m",
            call_state: &mut state,
        };
        match picker.pick(&mut args) {
            PickResult::Complete { subchannel, .. } => {
                assert_eq!(subchannel.socket_address(), addr);
            }
            _ => panic!("expected override to short-circuit to the bypassed subchannel"),
        }
    }

    #[test]
    fn dropping_wrapper_clears_its_slot() {
        let map: OverrideMap = Arc::new(Mutex::new(HashMap::new()));
        let addr: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let key = addr.to_string();
        map.lock().insert(key.clone(), None);
        let raw = FakeSubchannel::new(addr) as Arc<dyn Subchannel>;
        let wrapper = Arc::new(OverrideHostSubchannel {
            inner: raw,
            key: key.clone(),
            map: map.clone(),
        });
        *map.lock().get_mut(&key).unwrap() = Some(Arc::downgrade(&wrapper));
        drop(wrapper);
        assert!(map.lock().get(&key).unwrap().is_none());
    }
}
