//! `ServerAddress` and its attribute map (spec §3).

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A typed, opaque piece of metadata attached to a [`ServerAddress`].
///
/// Implementors are attached under a `UniqueTypeName` (a `&'static str`
/// namespacing the attribute, e.g. `"xds_locality"` or
/// `"xds_host_override"`), mirroring the original `ServerAddress`
/// attribute map, which keys on a type-erased unique identifier rather
/// than a Rust type so the same attribute kind can be produced by
/// unrelated crates.
pub trait Attribute: Any + fmt::Debug + Send + Sync {
    fn clone_attr(&self) -> Arc<dyn Attribute>;
    fn eq_attr(&self, other: &dyn Attribute) -> bool;
    fn as_any(&self) -> &dyn Any;
}

/// Blanket impl for any cloneable, comparable, 'static attribute payload.
impl<T> Attribute for T
where
    T: Any + Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn clone_attr(&self) -> Arc<dyn Attribute> {
        Arc::new(self.clone())
    }

    fn eq_attr(&self, other: &dyn Attribute) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An attribute map keyed by unique type name, in deterministic (sorted)
/// iteration order.
#[derive(Clone, Default)]
pub struct AttributeMap {
    inner: BTreeMap<&'static str, Arc<dyn Attribute>>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &'static str, value: Arc<dyn Attribute>) {
        self.inner.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Attribute>> {
        self.inner.get(key)
    }

    pub fn get_as<T: 'static>(&self, key: &str) -> Option<&T> {
        self.get(key).and_then(|v| v.as_any().downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.iter()).finish()
    }
}

impl PartialEq for AttributeMap {
    fn eq(&self, other: &Self) -> bool {
        self.inner.len() == other.inner.len()
            && self.inner.iter().all(|(k, v)| {
                other
                    .inner
                    .get(k)
                    .is_some_and(|ov| v.eq_attr(ov.as_ref()))
            })
    }
}
impl Eq for AttributeMap {}

/// One resolved backend address, plus any per-address channel args and
/// attributes attached by the resolver or by an interior policy (e.g.
/// xDS locality/weight, host-override markers).
///
/// Two `ServerAddress`es compare equal iff their socket address and
/// attributes are equal. Ordering is defined purely by byte comparison of
/// the socket address, for deterministic list processing (spec §3).
#[derive(Clone, Debug)]
pub struct ServerAddress {
    pub socket_address: SocketAddr,
    pub attributes: AttributeMap,
}

impl ServerAddress {
    pub fn new(socket_address: SocketAddr) -> Self {
        Self {
            socket_address,
            attributes: AttributeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &'static str, value: Arc<dyn Attribute>) -> Self {
        self.attributes.insert(key, value);
        self
    }

    fn sort_key(&self) -> (u8, Vec<u8>, u16) {
        match self.socket_address {
            SocketAddr::V4(v4) => (4, v4.ip().octets().to_vec(), v4.port()),
            SocketAddr::V6(v6) => (6, v6.ip().octets().to_vec(), v6.port()),
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.socket_address == other.socket_address && self.attributes == other.attributes
    }
}
impl Eq for ServerAddress {}

impl PartialOrd for ServerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerAddress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_requires_same_address_and_attributes() {
        let a1 = ServerAddress::new("127.0.0.1:80".parse().unwrap());
        let a2 = ServerAddress::new("127.0.0.1:80".parse().unwrap());
        assert_eq!(a1, a2);

        let a3 = a2.clone().with_attribute("tag", Arc::new(1u32));
        assert_ne!(a1, a3);
    }

    #[test]
    fn ordering_is_byte_comparison_of_socket_address() {
        let mut addrs = [ServerAddress::new("10.0.0.2:80".parse().unwrap()),
            ServerAddress::new("10.0.0.1:80".parse().unwrap()),
            ServerAddress::new("10.0.0.1:443".parse().unwrap())];
        addrs.sort();
        let rendered: Vec<_> = addrs.iter().map(|a| a.socket_address.to_string()).collect();
        assert_eq!(rendered, vec!["10.0.0.1:80", "10.0.0.1:443", "10.0.0.2:80"]);
    }

    #[test]
    fn attribute_downcast_roundtrips() {
        let addr = ServerAddress::new("127.0.0.1:1".parse().unwrap())
            .with_attribute("weight", Arc::new(42u32));
        assert_eq!(addr.attributes.get_as::<u32>("weight"), Some(&42));
    }
}
