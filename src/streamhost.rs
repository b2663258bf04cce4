//! Value types shared by every layer of the negotiation.
//!
//! A [`StreamHost`] is one candidate endpoint a peer may connect to. An
//! ordered [`StreamHostList`] is what gets offered over signaling, and a
//! [`NegotiationRequest`] is the decoded form of an inbound offer.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Full peer identity on the signaling network (`node@domain/resource`).
///
/// Comparison is exact on the full string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Parses a peer identity, returning `None` when it is empty, contains
    /// whitespace or has no domain part.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return None;
        }
        let without_resource = s.split('/').next().unwrap_or_default();
        let domain = match without_resource.rsplit_once('@') {
            Some((node, domain)) if !node.is_empty() => domain,
            Some(_) => return None,
            None => without_resource,
        };
        if domain.is_empty() {
            return None;
        }
        Some(Self(s.to_string()))
    }

    /// Returns the identity without its resource part.
    pub fn bare(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport flavour of a bytestream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StreamMode {
    #[default]
    #[serde(rename = "tcp")]
    Stream,
    #[serde(rename = "udp")]
    Datagram,
}

impl StreamMode {
    pub fn is_datagram(self) -> bool {
        matches!(self, StreamMode::Datagram)
    }
}

/// Computes the negotiation key for a session.
///
/// The key is the lowercase hex SHA-1 of `sid + initiator + target`. It is
/// sent as the SOCKS5 destination address and indexes sessions locally.
pub fn make_key(sid: &str, initiator: &PeerId, target: &PeerId) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.as_str().as_bytes());
    hasher.update(target.as_str().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// A candidate endpoint offered for the bytestream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHost {
    jid: PeerId,
    host: String,
    port: u16,
    is_proxy: bool,
}

impl StreamHost {
    /// A direct host owned by `jid`.
    pub fn new(jid: PeerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            jid,
            host: host.into(),
            port,
            is_proxy: false,
        }
    }

    /// A host operated by a third-party proxy service.
    pub fn proxy(jid: PeerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            is_proxy: true,
            ..Self::new(jid, host, port)
        }
    }

    pub fn jid(&self) -> &PeerId {
        &self.jid
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }

    /// A host is usable when it names an address and a non-zero port.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for StreamHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}", self.jid, self.host, self.port)?;
        if self.is_proxy {
            f.write_str(", proxy")?;
        }
        f.write_str(")")
    }
}

/// Ordered list of candidates; order is the offer and try order.
///
/// One peer may appear several times with different addresses, but an
/// identical host is never stored twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHostList(Vec<StreamHost>);

impl StreamHostList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a host unless an identical one is already present.
    pub fn push(&mut self, host: StreamHost) -> bool {
        if self.0.contains(&host) {
            return false;
        }
        self.0.push(host);
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StreamHost> {
        self.0.iter()
    }

    /// Returns true if any host belongs to `jid`.
    pub fn contains_peer(&self, jid: &PeerId) -> bool {
        self.0.iter().any(|h| h.jid() == jid)
    }

    /// First host owned by `jid`.
    pub fn find(&self, jid: &PeerId) -> Option<&StreamHost> {
        self.0.iter().find(|h| h.jid() == jid)
    }

    pub fn has_proxy(&self) -> bool {
        self.0.iter().any(StreamHost::is_proxy)
    }

    /// The subset of hosts that are (or are not) proxies, order preserved.
    pub fn filter_proxy(&self, proxy: bool) -> StreamHostList {
        Self(
            self.0
                .iter()
                .filter(|h| h.is_proxy() == proxy)
                .cloned()
                .collect(),
        )
    }
}

impl FromIterator<StreamHost> for StreamHostList {
    fn from_iter<I: IntoIterator<Item = StreamHost>>(iter: I) -> Self {
        let mut list = Self::new();
        for host in iter {
            list.push(host);
        }
        list
    }
}

impl IntoIterator for StreamHostList {
    type Item = StreamHost;
    type IntoIter = std::vec::IntoIter<StreamHost>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a StreamHostList {
    type Item = &'a StreamHost;
    type IntoIter = std::slice::Iter<'a, StreamHost>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A decoded inbound offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRequest {
    /// Sender of the offer.
    pub from: PeerId,
    /// Request id to answer.
    pub id: String,
    pub sid: String,
    pub hosts: StreamHostList,
    /// The sender asked for fast (same round-trip) negotiation.
    pub fast: bool,
    pub mode: StreamMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[test]
    fn test_peer_id_parse() {
        assert!(PeerId::parse("alice@example.com/desk").is_some());
        assert!(PeerId::parse("proxy.example.com").is_some());
        assert!(PeerId::parse("").is_none());
        assert!(PeerId::parse("bad id@example.com").is_none());
        assert!(PeerId::parse("@example.com").is_none());
        assert!(PeerId::parse("alice@/res").is_none());
        assert_eq!(jid("alice@example.com/desk").bare(), "alice@example.com");
    }

    #[test]
    fn test_make_key_is_sha1_hex() {
        let key = make_key("sid", &jid("a@x/r"), &jid("b@y/r"));
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_make_key_known_vector() {
        // sha1("abc") == a9993e364706816aba3e25717850c26c9cd0d89d
        let key = make_key("a", &jid("b"), &jid("c"));
        assert_eq!(key, "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_make_key_is_directional() {
        let a = jid("a@x/r");
        let b = jid("b@y/r");
        assert_ne!(make_key("s", &a, &b), make_key("s", &b, &a));
        assert_eq!(make_key("s", &a, &b), make_key("s", &a, &b));
    }

    #[test]
    fn test_stream_host_list_keeps_order_and_rejects_duplicates() {
        let a = jid("a@x/r");
        let mut list = StreamHostList::new();
        assert!(list.push(StreamHost::new(a.clone(), "10.0.0.1", 8010)));
        assert!(list.push(StreamHost::new(a.clone(), "192.168.1.2", 8010)));
        assert!(!list.push(StreamHost::new(a.clone(), "10.0.0.1", 8010)));
        assert!(list.push(StreamHost::proxy(jid("proxy.x"), "10.0.0.9", 7777)));

        assert_eq!(list.len(), 3);
        assert_eq!(list.iter().next().unwrap().host(), "10.0.0.1");
        assert!(list.has_proxy());
        assert_eq!(list.filter_proxy(false).len(), 2);
        assert_eq!(list.filter_proxy(true).len(), 1);
        assert!(list.contains_peer(&a));
        assert_eq!(list.find(&jid("proxy.x")).unwrap().port(), 7777);
    }

    #[test]
    fn test_stream_host_validity() {
        assert!(StreamHost::new(jid("a@x"), "h", 1).is_valid());
        assert!(!StreamHost::new(jid("a@x"), "", 1).is_valid());
        assert!(!StreamHost::new(jid("a@x"), "h", 0).is_valid());
    }
}
