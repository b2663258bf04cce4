//! Wire protocol implementation for s5b.
//!
//! This module defines the stanzas that carry bytestream offers, results,
//! proxy queries and activation notices, the builders that produce them and
//! the decoders that turn inbound stanzas back into typed values. It also
//! implements the 4-byte virtual port header used to frame datagrams.
//!
//! Stanzas mirror the element/attribute layout of the bytestreams
//! namespace and are serialized as JSON for transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streamhost::{NegotiationRequest, PeerId, StreamHost, StreamHostList, StreamMode};

/// Namespace of bytestream queries and notices.
pub const NS_BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";

/// Namespace of the proxy flag, the fast marker and the activate notice.
pub const NS_STREAM: &str = "http://affinix.com/jabber/stream";

/// Maximum number of stream hosts taken from one inbound offer.
pub const MAX_STREAMHOSTS: usize = 5;

/// Size of the datagram virtual port header.
pub const DATAGRAM_HEADER_SIZE: usize = 4;

/// Error code: none of the offered hosts could be reached.
pub const ERR_NOT_FOUND: u16 = 404;
/// Error code: request declined or sid already in use.
pub const ERR_NOT_ACCEPTABLE: u16 = 406;
/// Error code: request timed out locally.
pub const ERR_TIMEOUT: u16 = 500;

/// Protocol error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed stanza: {0}")]
    Malformed(String),

    #[error("unexpected stanza")]
    Unexpected,

    #[error("wrong namespace: {0}")]
    WrongNamespace(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid peer id: {0:?}")]
    InvalidPeer(String),

    #[error("datagram too short: {0} bytes")]
    ShortDatagram(usize),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Error payload of an `iq` of type error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code} {text}")]
pub struct StanzaError {
    pub code: u16,
    pub text: String,
}

impl StanzaError {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(ERR_NOT_FOUND, "Could not connect to given hosts")
    }

    pub fn not_acceptable() -> Self {
        Self::new(ERR_NOT_ACCEPTABLE, "Not acceptable")
    }

    pub fn sid_in_use() -> Self {
        Self::new(ERR_NOT_ACCEPTABLE, "SID in use")
    }

    pub fn timed_out() -> Self {
        Self::new(ERR_TIMEOUT, "Timed out")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

/// Empty element carrying only a namespace (`<fast/>`, `<proxy/>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub xmlns: String,
}

impl Marker {
    fn stream() -> Self {
        Self {
            xmlns: NS_STREAM.to_string(),
        }
    }

    fn is_stream(marker: &Option<Marker>) -> bool {
        marker.as_ref().is_some_and(|m| m.xmlns == NS_STREAM)
    }
}

/// `<streamhost jid host port/>` as found on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHostElement {
    pub jid: String,
    pub host: String,
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Marker>,
}

impl From<&StreamHost> for StreamHostElement {
    fn from(h: &StreamHost) -> Self {
        Self {
            jid: h.jid().to_string(),
            host: h.host().to_string(),
            port: h.port().to_string(),
            proxy: h.is_proxy().then(Marker::stream),
        }
    }
}

impl StreamHostElement {
    /// Converts to a [`StreamHost`], or `None` if any attribute is unusable.
    fn to_stream_host(&self) -> Option<StreamHost> {
        let jid = PeerId::parse(&self.jid)?;
        let port: u16 = self.port.parse().ok()?;
        let host = if Marker::is_stream(&self.proxy) {
            StreamHost::proxy(jid, self.host.clone(), port)
        } else {
            StreamHost::new(jid, self.host.clone(), port)
        };
        host.is_valid().then_some(host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JidElement {
    pub jid: String,
}

/// `<query xmlns=...>` payload of bytestream iqs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub xmlns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, rename = "streamhost", skip_serializing_if = "Vec::is_empty")]
    pub streamhosts: Vec<StreamHostElement>,
    #[serde(default, rename = "streamhost-used", skip_serializing_if = "Option::is_none")]
    pub streamhost_used: Option<JidElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast: Option<Marker>,
}

impl Query {
    fn bytestreams() -> Self {
        Self {
            xmlns: NS_BYTESTREAMS.to_string(),
            sid: None,
            mode: None,
            streamhosts: Vec::new(),
            streamhost_used: None,
            activate: None,
            fast: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iq {
    #[serde(rename = "type")]
    pub kind: IqType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StanzaError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpSuccessElement {
    pub xmlns: String,
    pub dstaddr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateElement {
    pub xmlns: String,
    pub sid: String,
    pub jid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udpsuccess: Option<UdpSuccessElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<ActivateElement>,
}

/// A signaling stanza.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stanza", rename_all = "lowercase")]
pub enum Stanza {
    Iq(Iq),
    Message(Message),
}

impl Stanza {
    /// Encodes this stanza to its wire form.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Decodes a stanza from its wire form.
    pub fn decode(s: &str) -> ProtocolResult<Stanza> {
        serde_json::from_str(s).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to(&self) -> &str {
        match self {
            Stanza::Iq(iq) => &iq.to,
            Stanza::Message(m) => &m.to,
        }
    }

    pub fn from(&self) -> Option<&str> {
        match self {
            Stanza::Iq(iq) => iq.from.as_deref(),
            Stanza::Message(m) => m.from.as_deref(),
        }
    }

    /// Stamps the sender; transports call this on outbound stanzas.
    pub fn set_from(&mut self, from: &PeerId) {
        let slot = match self {
            Stanza::Iq(iq) => &mut iq.from,
            Stanza::Message(m) => &mut m.from,
        };
        *slot = Some(from.to_string());
    }

    /// Returns the iq if this is a reply (result or error) to a request.
    pub fn as_reply(&self) -> Option<&Iq> {
        match self {
            Stanza::Iq(iq) if matches!(iq.kind, IqType::Result | IqType::Error) => Some(iq),
            _ => None,
        }
    }

    fn iq(kind: IqType, to: &PeerId, id: &str, query: Option<Query>) -> Self {
        Stanza::Iq(Iq {
            kind,
            id: id.to_string(),
            from: None,
            to: to.to_string(),
            query,
            error: None,
        })
    }
}

/// Builds a bytestream offer.
pub fn offer(
    to: &PeerId,
    id: &str,
    sid: &str,
    hosts: &StreamHostList,
    fast: bool,
    mode: StreamMode,
) -> Stanza {
    let mut query = Query::bytestreams();
    query.sid = Some(sid.to_string());
    query.mode = Some(if mode.is_datagram() { "udp" } else { "tcp" }.to_string());
    query.streamhosts = hosts.iter().map(StreamHostElement::from).collect();
    query.fast = fast.then(Marker::stream);
    Stanza::iq(IqType::Set, to, id, Some(query))
}

/// Builds the reply to an offer naming the host that was used.
///
/// `None` produces an empty result, which a fast-mode target sends when it
/// has accepted but not yet connected.
pub fn streamhost_used(to: &PeerId, id: &str, used: Option<&PeerId>) -> Stanza {
    let query = used.map(|jid| {
        let mut query = Query::bytestreams();
        query.streamhost_used = Some(JidElement {
            jid: jid.to_string(),
        });
        query
    });
    Stanza::iq(IqType::Result, to, id, query)
}

/// Builds an error reply to any request.
pub fn error_reply(to: &PeerId, id: &str, error: StanzaError) -> Stanza {
    let mut stanza = Stanza::iq(IqType::Error, to, id, None);
    if let Stanza::Iq(iq) = &mut stanza {
        iq.error = Some(error);
    }
    stanza
}

/// Builds an empty success reply.
pub fn empty_result(to: &PeerId, id: &str) -> Stanza {
    Stanza::iq(IqType::Result, to, id, None)
}

/// Builds a query for a proxy's connection info.
pub fn proxy_info_query(proxy: &PeerId, id: &str) -> Stanza {
    Stanza::iq(IqType::Get, proxy, id, Some(Query::bytestreams()))
}

/// Builds the reply of a proxy service describing itself.
pub fn proxy_info_result(to: &PeerId, id: &str, host: &StreamHost) -> Stanza {
    let mut query = Query::bytestreams();
    query.streamhosts.push(StreamHostElement {
        proxy: None,
        ..StreamHostElement::from(host)
    });
    Stanza::iq(IqType::Result, to, id, Some(query))
}

/// Builds a request asking `proxy` to join the two halves of `sid`.
pub fn proxy_activate(proxy: &PeerId, id: &str, sid: &str, target: &PeerId) -> Stanza {
    let mut query = Query::bytestreams();
    query.sid = Some(sid.to_string());
    query.activate = Some(target.to_string());
    Stanza::iq(IqType::Set, proxy, id, Some(query))
}

/// Builds the notice that a UDP init probe for `key` arrived.
pub fn udp_success(to: &PeerId, key: &str) -> Stanza {
    Stanza::Message(Message {
        from: None,
        to: to.to_string(),
        udpsuccess: Some(UdpSuccessElement {
            xmlns: NS_BYTESTREAMS.to_string(),
            dstaddr: key.to_string(),
        }),
        activate: None,
    })
}

/// Builds the datagram-mode activation notice naming the winning host.
pub fn activate(to: &PeerId, sid: &str, streamhost: &PeerId) -> Stanza {
    Stanza::Message(Message {
        from: None,
        to: to.to_string(),
        udpsuccess: None,
        activate: Some(ActivateElement {
            xmlns: NS_STREAM.to_string(),
            sid: sid.to_string(),
            jid: streamhost.to_string(),
        }),
    })
}

fn reply_query(reply: &Stanza) -> Result<Option<&Query>, StanzaError> {
    match reply {
        Stanza::Iq(iq) if iq.kind == IqType::Result => Ok(iq.query.as_ref()),
        Stanza::Iq(iq) if iq.kind == IqType::Error => Err(iq
            .error
            .clone()
            .unwrap_or_else(|| StanzaError::new(0, "unknown error"))),
        _ => Err(StanzaError::new(0, "unexpected reply")),
    }
}

/// Interprets the reply to an offer.
///
/// Returns the id of the host the peer used, `None` for an empty result.
pub fn parse_offer_result(reply: &Stanza) -> Result<Option<PeerId>, StanzaError> {
    let query = reply_query(reply)?;
    Ok(query
        .filter(|q| q.xmlns == NS_BYTESTREAMS)
        .and_then(|q| q.streamhost_used.as_ref())
        .and_then(|used| PeerId::parse(&used.jid)))
}

/// Interprets the reply to a proxy-info query.
///
/// The advertised host is always marked as a proxy.
pub fn parse_proxy_info(reply: &Stanza) -> Result<Option<StreamHost>, StanzaError> {
    let query = reply_query(reply)?;
    Ok(query
        .filter(|q| q.xmlns == NS_BYTESTREAMS)
        .and_then(|q| q.streamhosts.first())
        .and_then(|el| {
            let host = el.to_stream_host()?;
            Some(StreamHost::proxy(
                host.jid().clone(),
                host.host(),
                host.port(),
            ))
        }))
}

/// Interprets a reply that only signals success or failure.
pub fn parse_empty_result(reply: &Stanza) -> Result<(), StanzaError> {
    reply_query(reply).map(|_| ())
}

/// Decodes an inbound offer.
///
/// At most [`MAX_STREAMHOSTS`] usable hosts are kept; unusable ones are
/// skipped.
pub fn parse_offer(stanza: &Stanza) -> ProtocolResult<NegotiationRequest> {
    let Stanza::Iq(iq) = stanza else {
        return Err(ProtocolError::Unexpected);
    };
    if iq.kind != IqType::Set {
        return Err(ProtocolError::Unexpected);
    }
    let query = iq.query.as_ref().ok_or(ProtocolError::MissingField("query"))?;
    if query.xmlns != NS_BYTESTREAMS {
        return Err(ProtocolError::WrongNamespace(query.xmlns.clone()));
    }
    let sid = query.sid.clone().ok_or(ProtocolError::MissingField("sid"))?;
    let from = iq.from.as_deref().ok_or(ProtocolError::MissingField("from"))?;
    let from = PeerId::parse(from).ok_or_else(|| ProtocolError::InvalidPeer(from.to_string()))?;

    let mut hosts = StreamHostList::new();
    for el in &query.streamhosts {
        if hosts.len() >= MAX_STREAMHOSTS {
            break;
        }
        if let Some(host) = el.to_stream_host() {
            hosts.push(host);
        }
    }

    Ok(NegotiationRequest {
        from,
        id: iq.id.clone(),
        sid,
        hosts,
        fast: Marker::is_stream(&query.fast),
        mode: match query.mode.as_deref() {
            Some("udp") => StreamMode::Datagram,
            _ => StreamMode::Stream,
        },
    })
}

/// Application datagram with its virtual ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source_port: u16,
    pub dest_port: u16,
    pub data: Bytes,
}

impl Datagram {
    pub fn new(source_port: u16, dest_port: u16, data: impl Into<Bytes>) -> Self {
        Self {
            source_port,
            dest_port,
            data: data.into(),
        }
    }

    /// Encode this datagram to a byte buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(DATAGRAM_HEADER_SIZE + self.data.len());
        buf.put_u16(self.source_port);
        buf.put_u16(self.dest_port);
        buf.put_slice(&self.data);
    }

    /// Decode a datagram; buffers shorter than the header are rejected.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Datagram> {
        if buf.len() < DATAGRAM_HEADER_SIZE {
            return Err(ProtocolError::ShortDatagram(buf.len()));
        }
        let mut header = &buf[..DATAGRAM_HEADER_SIZE];
        let source_port = header.get_u16();
        let dest_port = header.get_u16();
        Ok(Datagram {
            source_port,
            dest_port,
            data: Bytes::copy_from_slice(&buf[DATAGRAM_HEADER_SIZE..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn stamped(mut stanza: Stanza, from: &str) -> Stanza {
        stanza.set_from(&jid(from));
        Stanza::decode(&stanza.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_offer_preserves_stream_hosts() {
        let mut hosts = StreamHostList::new();
        hosts.push(StreamHost::new(jid("alice@example.com/desk"), "10.0.0.1", 8010));
        hosts.push(StreamHost::proxy(jid("proxy.example.com"), "203.0.113.5", 7777));

        let stanza = offer(&jid("bob@example.com/phone"), "id1", "s5b_1", &hosts, true, StreamMode::Stream);
        let req = parse_offer(&stamped(stanza, "alice@example.com/desk")).unwrap();

        assert_eq!(req.from, jid("alice@example.com/desk"));
        assert_eq!(req.id, "id1");
        assert_eq!(req.sid, "s5b_1");
        assert!(req.fast);
        assert_eq!(req.mode, StreamMode::Stream);
        assert_eq!(req.hosts, hosts);
    }

    #[test]
    fn test_offer_mode_and_fast_flags() {
        let stanza = offer(&jid("b@x"), "i", "s", &StreamHostList::new(), false, StreamMode::Datagram);
        let req = parse_offer(&stamped(stanza, "a@x")).unwrap();
        assert!(!req.fast);
        assert_eq!(req.mode, StreamMode::Datagram);
        assert!(req.hosts.is_empty());
    }

    #[test]
    fn test_offer_caps_and_skips_hosts() {
        let stanza = offer(&jid("b@x"), "i", "s", &StreamHostList::new(), false, StreamMode::Stream);
        let Stanza::Iq(mut iq) = stamped(stanza, "a@x") else {
            panic!("expected iq");
        };
        let query = iq.query.as_mut().unwrap();
        query.streamhosts.push(StreamHostElement {
            jid: "bad jid".into(),
            host: "h".into(),
            port: "1".into(),
            proxy: None,
        });
        query.streamhosts.push(StreamHostElement {
            jid: "a@x".into(),
            host: "h".into(),
            port: "not-a-port".into(),
            proxy: None,
        });
        for i in 0..7 {
            query.streamhosts.push(StreamHostElement {
                jid: "a@x".into(),
                host: format!("10.0.0.{}", i),
                port: "8010".into(),
                proxy: None,
            });
        }

        let req = parse_offer(&Stanza::Iq(iq)).unwrap();
        assert_eq!(req.hosts.len(), MAX_STREAMHOSTS);
        assert_eq!(req.hosts.iter().next().unwrap().host(), "10.0.0.0");
    }

    #[test]
    fn test_offer_rejects_foreign_namespace() {
        let stanza = offer(&jid("b@x"), "i", "s", &StreamHostList::new(), false, StreamMode::Stream);
        let Stanza::Iq(mut iq) = stamped(stanza, "a@x") else {
            panic!("expected iq");
        };
        iq.query.as_mut().unwrap().xmlns = "urn:other".into();
        assert_eq!(
            parse_offer(&Stanza::Iq(iq)),
            Err(ProtocolError::WrongNamespace("urn:other".into()))
        );
    }

    #[test]
    fn test_offer_requires_sender() {
        let stanza = offer(&jid("b@x"), "i", "s", &StreamHostList::new(), false, StreamMode::Stream);
        assert_eq!(parse_offer(&stanza), Err(ProtocolError::MissingField("from")));
    }

    #[test]
    fn test_streamhost_used_result() {
        let used = jid("proxy.example.com");
        let reply = stamped(streamhost_used(&jid("a@x"), "i", Some(&used)), "b@x");
        assert_eq!(parse_offer_result(&reply), Ok(Some(used)));

        let empty = stamped(streamhost_used(&jid("a@x"), "i", None), "b@x");
        assert_eq!(parse_offer_result(&empty), Ok(None));
    }

    #[test]
    fn test_error_reply() {
        let reply = stamped(error_reply(&jid("a@x"), "i", StanzaError::not_found()), "b@x");
        let err = parse_offer_result(&reply).unwrap_err();
        assert_eq!(err.code, ERR_NOT_FOUND);
        assert_eq!(parse_empty_result(&reply).unwrap_err(), StanzaError::not_found());
        assert!(reply.as_reply().is_some());
    }

    #[test]
    fn test_proxy_info_marks_proxy() {
        let host = StreamHost::new(jid("proxy.x"), "198.51.100.1", 7777);
        let reply = stamped(proxy_info_result(&jid("a@x"), "q", &host), "proxy.x");
        let info = parse_proxy_info(&reply).unwrap().unwrap();
        assert!(info.is_proxy());
        assert_eq!(info.host(), "198.51.100.1");
        assert_eq!(info.port(), 7777);

        let empty = stamped(empty_result(&jid("a@x"), "q"), "proxy.x");
        assert_eq!(parse_proxy_info(&empty), Ok(None));
    }

    #[test]
    fn test_notices_encode() {
        let notice = stamped(udp_success(&jid("a@x"), "abcd"), "b@x");
        let Stanza::Message(m) = notice else {
            panic!("expected message");
        };
        assert_eq!(m.udpsuccess.unwrap().dstaddr, "abcd");

        let notice = stamped(activate(&jid("a@x"), "s", &jid("b@x")), "b@x");
        let Stanza::Message(m) = notice else {
            panic!("expected message");
        };
        let act = m.activate.unwrap();
        assert_eq!(act.xmlns, NS_STREAM);
        assert_eq!(act.jid, "b@x");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(Stanza::decode("{not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_datagram_framing() {
        let dg = Datagram::new(5000, 6000, Bytes::from_static(b"payload"));
        let mut buf = BytesMut::new();
        dg.encode(&mut buf);

        assert_eq!(&buf[..4], &[0x13, 0x88, 0x17, 0x70]);
        assert_eq!(Datagram::decode(&buf).unwrap(), dg);
    }

    #[test]
    fn test_datagram_short_buffer_rejected() {
        assert_eq!(Datagram::decode(&[1, 2, 3]), Err(ProtocolError::ShortDatagram(3)));
        let empty = Datagram::decode(&[0, 1, 0, 2]).unwrap();
        assert!(empty.data.is_empty());
    }
}
