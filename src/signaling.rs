//! Boundary to the structured-stanza transport.
//!
//! The transport delivers addressed stanzas and correlates requests with
//! their replies; everything above it speaks in terms of [`Stanza`] values
//! built and parsed by [`crate::protocol`].

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{self, IqType, ProtocolResult, Stanza, StanzaError, NS_BYTESTREAMS, NS_STREAM};
use crate::streamhost::{NegotiationRequest, PeerId};

/// Transport failures, distinct from error replies sent by the peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to {0}")]
    NoRoute(String),

    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for StanzaError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoRoute(_) => StanzaError::new(503, e.to_string()),
            TransportError::Closed => StanzaError::new(0, e.to_string()),
        }
    }
}

/// Send/receive plumbing for stanzas.
///
/// Implementations stamp `from` with [`StanzaTransport::local_id`] on
/// everything they send.
#[async_trait]
pub trait StanzaTransport: Send + Sync + 'static {
    /// Our own full identity.
    fn local_id(&self) -> PeerId;

    /// Sends an `iq` request and waits for the reply with the same id.
    async fn request(&self, stanza: Stanza) -> Result<Stanza, TransportError>;

    /// Sends a stanza that expects no reply.
    fn send(&self, stanza: Stanza);
}

/// An inbound stanza the negotiation engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Offer(NegotiationRequest),
    UdpSuccess { from: PeerId, key: String },
    Activate { from: PeerId, sid: String, streamhost: PeerId },
}

/// Classifies an inbound stanza.
///
/// Returns `Ok(None)` for stanzas that are not bytestream traffic (including
/// replies, which the transport routes to their requests).
pub fn classify(stanza: &Stanza) -> ProtocolResult<Option<Inbound>> {
    match stanza {
        Stanza::Iq(iq) => {
            let is_offer = iq.kind == IqType::Set
                && iq
                    .query
                    .as_ref()
                    .is_some_and(|q| q.xmlns == NS_BYTESTREAMS && q.activate.is_none());
            if !is_offer {
                return Ok(None);
            }
            protocol::parse_offer(stanza).map(|req| Some(Inbound::Offer(req)))
        }
        Stanza::Message(m) => {
            let Some(from) = m.from.as_deref().and_then(PeerId::parse) else {
                return Ok(None);
            };
            if let Some(udp) = m.udpsuccess.as_ref().filter(|u| u.xmlns == NS_BYTESTREAMS) {
                return Ok(Some(Inbound::UdpSuccess {
                    from,
                    key: udp.dstaddr.clone(),
                }));
            }
            if let Some(act) = m.activate.as_ref().filter(|a| a.xmlns == NS_STREAM) {
                let Some(streamhost) = PeerId::parse(&act.jid) else {
                    return Ok(None);
                };
                return Ok(Some(Inbound::Activate {
                    from,
                    sid: act.sid.clone(),
                    streamhost,
                }));
            }
            Ok(None)
        }
    }
}

/// Sends `stanza` and maps both transport failures and error replies to a
/// [`StanzaError`].
pub async fn request(transport: &dyn StanzaTransport, stanza: Stanza) -> Result<Stanza, StanzaError> {
    let reply = transport.request(stanza).await?;
    match reply.as_reply() {
        Some(iq) if iq.kind == IqType::Error => Err(iq
            .error
            .clone()
            .unwrap_or_else(|| StanzaError::new(0, "unknown error"))),
        _ => Ok(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamhost::{StreamHostList, StreamMode};

    fn jid(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[test]
    fn test_classify_offer() {
        let mut stanza = protocol::offer(&jid("b@x/r"), "i1", "s1", &StreamHostList::new(), true, StreamMode::Stream);
        stanza.set_from(&jid("a@x/r"));
        match classify(&stanza).unwrap() {
            Some(Inbound::Offer(req)) => {
                assert_eq!(req.sid, "s1");
                assert!(req.fast);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_ignores_replies_and_activation_requests() {
        let reply = protocol::empty_result(&jid("a@x"), "i");
        assert_eq!(classify(&reply).unwrap(), None);

        let mut act = protocol::proxy_activate(&jid("proxy.x"), "i", "s", &jid("b@x"));
        act.set_from(&jid("a@x"));
        assert_eq!(classify(&act).unwrap(), None);

        let query = protocol::proxy_info_query(&jid("proxy.x"), "q");
        assert_eq!(classify(&query).unwrap(), None);
    }

    #[test]
    fn test_classify_notices() {
        let mut udp = protocol::udp_success(&jid("a@x/r"), "k");
        udp.set_from(&jid("b@x/r"));
        assert_eq!(
            classify(&udp).unwrap(),
            Some(Inbound::UdpSuccess {
                from: jid("b@x/r"),
                key: "k".into()
            })
        );

        let mut act = protocol::activate(&jid("a@x/r"), "s", &jid("a@x/r"));
        act.set_from(&jid("b@x/r"));
        assert_eq!(
            classify(&act).unwrap(),
            Some(Inbound::Activate {
                from: jid("b@x/r"),
                sid: "s".into(),
                streamhost: jid("a@x/r")
            })
        );
    }

    #[test]
    fn test_classify_anonymous_notice_dropped() {
        let udp = protocol::udp_success(&jid("a@x/r"), "k");
        assert_eq!(classify(&udp).unwrap(), None);
    }
}
