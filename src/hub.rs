//! In-memory stanza transport.
//!
//! A [`LoopbackHub`] connects any number of local identities. Every stanza is
//! encoded to its wire form and decoded again on the way through, so peers
//! on a hub exchange exactly what they would over a real connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::Stanza;
use crate::signaling::{StanzaTransport, TransportError};
use crate::streamhost::PeerId;

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<Stanza>>,
    /// Outstanding requests keyed by (requester, request id).
    pending: HashMap<(PeerId, String), oneshot::Sender<Stanza>>,
}

/// Router shared by all endpoints.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns its transport together with the stream of
    /// stanzas addressed to it that are not replies to its own requests.
    ///
    /// Registering an id again replaces the previous endpoint.
    pub fn endpoint(&self, id: PeerId) -> (Arc<HubTransport>, mpsc::UnboundedReceiver<Stanza>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(id.clone(), tx);
        let transport = Arc::new(HubTransport {
            state: Arc::clone(&self.state),
            id,
        });
        (transport, rx)
    }

    /// Removes an endpoint; stanzas addressed to it are dropped afterwards.
    pub fn remove(&self, id: &PeerId) {
        let mut state = self.state.lock();
        state.endpoints.remove(id);
        state.pending.retain(|(requester, _), _| requester != id);
    }
}

/// One identity's view of a [`LoopbackHub`].
pub struct HubTransport {
    state: Arc<Mutex<HubState>>,
    id: PeerId,
}

impl HubTransport {
    fn route(&self, mut stanza: Stanza) -> Result<(), TransportError> {
        stanza.set_from(&self.id);
        let stanza = stanza
            .encode()
            .and_then(|wire| Stanza::decode(&wire))
            .map_err(|e| {
                tracing::warn!(from = %self.id, error = %e, "dropping unencodable stanza");
                TransportError::Closed
            })?;
        let to = PeerId::parse(stanza.to()).ok_or_else(|| TransportError::NoRoute(stanza.to().to_string()))?;

        let mut state = self.state.lock();
        if let Some(reply) = stanza.as_reply() {
            if let Some(waiter) = state.pending.remove(&(to.clone(), reply.id.clone())) {
                let _ = waiter.send(stanza);
                return Ok(());
            }
        }
        let endpoint = state
            .endpoints
            .get(&to)
            .ok_or_else(|| TransportError::NoRoute(to.to_string()))?;
        endpoint
            .send(stanza)
            .map_err(|_| TransportError::NoRoute(to.to_string()))
    }
}

#[async_trait]
impl StanzaTransport for HubTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn request(&self, stanza: Stanza) -> Result<Stanza, TransportError> {
        let id = match &stanza {
            Stanza::Iq(iq) => iq.id.clone(),
            Stanza::Message(_) => return Err(TransportError::Closed),
        };
        let (tx, rx) = oneshot::channel();
        let key = (self.id.clone(), id);
        self.state.lock().pending.insert(key.clone(), tx);

        if let Err(e) = self.route(stanza) {
            self.state.lock().pending.remove(&key);
            return Err(e);
        }
        rx.await.map_err(|_| TransportError::Closed)
    }

    fn send(&self, stanza: Stanza) {
        if let Err(e) = self.route(stanza) {
            tracing::debug!(from = %self.id, error = %e, "stanza not delivered");
        }
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.pending.retain(|(requester, _), _| requester != &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;

    fn jid(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let hub = LoopbackHub::new();
        let (alice, _alice_rx) = hub.endpoint(jid("alice@x/r"));
        let (bob, mut bob_rx) = hub.endpoint(jid("bob@x/r"));

        let responder = tokio::spawn(async move {
            let stanza = bob_rx.recv().await.unwrap();
            assert_eq!(stanza.from(), Some("alice@x/r"));
            let Stanza::Iq(iq) = stanza else {
                panic!("expected iq");
            };
            bob.send(protocol::streamhost_used(&jid("alice@x/r"), &iq.id, Some(&jid("bob@x/r"))));
        });

        let reply = alice
            .request(protocol::proxy_info_query(&jid("bob@x/r"), "req1"))
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(protocol::parse_offer_result(&reply), Ok(Some(jid("bob@x/r"))));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let hub = LoopbackHub::new();
        let (alice, _rx) = hub.endpoint(jid("alice@x/r"));
        let result = alice
            .request(protocol::proxy_info_query(&jid("nobody@x/r"), "req1"))
            .await;
        assert_eq!(result, Err(TransportError::NoRoute("nobody@x/r".into())));
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_delivered_inbound() {
        let hub = LoopbackHub::new();
        let (alice, _rx) = hub.endpoint(jid("alice@x/r"));
        let (_bob, mut bob_rx) = hub.endpoint(jid("bob@x/r"));
        alice.send(protocol::empty_result(&jid("bob@x/r"), "stray"));
        let got = bob_rx.recv().await.unwrap();
        assert!(got.as_reply().is_some());
    }

    #[tokio::test]
    async fn test_removed_endpoint_fails_pending_request() {
        let hub = LoopbackHub::new();
        let (alice, _alice_rx) = hub.endpoint(jid("alice@x/r"));
        let (_bob, _bob_rx) = hub.endpoint(jid("bob@x/r"));

        let hub2 = hub.clone();
        let pending = tokio::spawn(async move {
            alice
                .request(protocol::proxy_info_query(&jid("bob@x/r"), "q"))
                .await
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        hub2.remove(&jid("alice@x/r"));
        assert_eq!(pending.await.unwrap(), Err(TransportError::Closed));
    }
}
