//! In-process signaling relay.
//!
//! [`SignalRelay`] plays the role of the signaling server: it authenticates
//! parties by token and forwards each published event to the other party of
//! the call named in its payload. Every room gets its own mailbox task, so
//! events for one room are delivered in publish order while rooms never block
//! each other. A caller's `Outgoing` reaches the receiver as `Incoming`.
//!
//! [`MemoryChannel`] is the [`SignalingChannel`] a client uses to talk to it.

use crate::calls::{InboundSignal, SignalKind};
use crate::channel::{ChannelError, ChannelEvent, SignalingChannel};
use crate::types::call::Party;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TrySendError};

/// Decides whether a delivery is lost. Called with the delivered topic and
/// the recipient's party id.
pub type DropFilter = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RelayConfig {
    /// Buffered events per room before publishers wait.
    pub room_mailbox_capacity: usize,
    /// A room that sees no event for this long is retired.
    pub room_idle_timeout: Duration,
    /// Simulated message loss.
    pub drop_filter: Option<DropFilter>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            room_mailbox_capacity: 32,
            room_idle_timeout: Duration::from_secs(120),
            drop_filter: None,
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("room_mailbox_capacity", &self.room_mailbox_capacity)
            .field("room_idle_timeout", &self.room_idle_timeout)
            .field("drop_filter", &self.drop_filter.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Envelope {
    from: String,
    topic: String,
    room_id: String,
    payload: Value,
}

struct Connection {
    events: mpsc::Sender<ChannelEvent>,
    subscriptions: HashMap<String, mpsc::Sender<ChannelEvent>>,
}

struct RelayInner {
    config: RelayConfig,
    tokens: DashMap<String, Party>,
    connections: DashMap<String, Connection>,
    rooms: DashMap<String, mpsc::Sender<Envelope>>,
}

/// Shared relay. Cloning yields another handle to the same relay.
#[derive(Clone)]
pub struct SignalRelay {
    inner: Arc<RelayInner>,
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl SignalRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                tokens: DashMap::new(),
                connections: DashMap::new(),
                rooms: DashMap::new(),
            }),
        }
    }

    /// Allow `party` to connect with `auth_token`.
    pub fn register(&self, auth_token: impl Into<String>, party: Party) {
        self.inner.tokens.insert(auth_token.into(), party);
    }

    /// A new channel bound to this relay.
    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel {
            relay: self.clone(),
            party: Mutex::new(None),
        }
    }

    pub fn is_connected(&self, party_id: &str) -> bool {
        self.inner.connections.contains_key(party_id)
    }

    /// Rooms with a live mailbox.
    pub fn active_rooms(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Revoke every token of `party_id` and drop its connection.
    pub async fn deauthenticate(&self, party_id: &str) {
        self.inner.tokens.retain(|_, party| party.id != party_id);
        if let Some((_, connection)) = self.inner.connections.remove(party_id) {
            info!("Deauthenticated {}", party_id);
            let _ = connection.events.send(ChannelEvent::Disconnected).await;
        }
    }

    fn authenticate(&self, auth_token: &str) -> Option<Party> {
        self.inner.tokens.get(auth_token).map(|p| p.value().clone())
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let mut envelope = envelope;
        // A mailbox closes when its room retires; the second attempt opens a fresh one.
        for _ in 0..2 {
            let mailbox = self.mailbox(&envelope.room_id);
            match mailbox.send(envelope).await {
                Ok(()) => return Ok(()),
                Err(SendError(returned)) => {
                    self.inner
                        .rooms
                        .remove_if(&returned.room_id, |_, tx| tx.same_channel(&mailbox));
                    envelope = returned;
                }
            }
        }
        Err(ChannelError::Publish(anyhow::anyhow!(
            "room {} is not accepting events",
            envelope.room_id
        )))
    }

    fn mailbox(&self, room_id: &str) -> mpsc::Sender<Envelope> {
        self.inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.inner.config.room_mailbox_capacity);
                debug!("Opening room {}", room_id);
                tokio::spawn(room_worker(self.clone(), room_id.to_string(), tx.clone(), rx));
                tx
            })
            .clone()
    }

    fn deliver(&self, envelope: Envelope) {
        let Some(recipient) = recipient_of(&envelope) else {
            warn!(
                "Dropping {} for room {}: sender {} is not a party to the call",
                envelope.topic, envelope.room_id, envelope.from
            );
            return;
        };

        let topic = match SignalKind::from_topic(&envelope.topic) {
            Some(SignalKind::Outgoing) => SignalKind::Incoming.topic().to_string(),
            _ => envelope.topic.clone(),
        };

        if let Some(filter) = &self.inner.config.drop_filter {
            if filter(&topic, &recipient) {
                debug!("Lost {} for room {} to {}", topic, envelope.room_id, recipient);
                return;
            }
        }

        let Some(handler) = self
            .inner
            .connections
            .get(&recipient)
            .and_then(|c| c.subscriptions.get(&topic).cloned())
        else {
            debug!(
                "Dropping {} for room {}: {} is not listening",
                topic, envelope.room_id, recipient
            );
            return;
        };

        let message = ChannelEvent::Message(InboundSignal {
            topic: topic.clone(),
            room_id: envelope.room_id.clone(),
            payload: envelope.payload,
        });
        match handler.try_send(message) {
            Ok(()) => debug!("Delivered {} for room {} to {}", topic, envelope.room_id, recipient),
            Err(TrySendError::Full(_)) => warn!(
                "Dropping {} for room {}: {} is not keeping up",
                topic, envelope.room_id, recipient
            ),
            Err(TrySendError::Closed(_)) => debug!(
                "Dropping {} for room {}: {} went away",
                topic, envelope.room_id, recipient
            ),
        }
    }
}

/// The party that is not the sender, if the sender is one of the two.
fn recipient_of(envelope: &Envelope) -> Option<String> {
    let caller = envelope.payload.pointer("/caller/id")?.as_str()?;
    let receiver = envelope.payload.pointer("/receiver/id")?.as_str()?;
    if envelope.from == caller {
        Some(receiver.to_string())
    } else if envelope.from == receiver {
        Some(caller.to_string())
    } else {
        None
    }
}

async fn room_worker(
    relay: SignalRelay,
    room_id: String,
    tx: mpsc::Sender<Envelope>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    let idle_timeout = relay.inner.config.room_idle_timeout;
    // Events that trail a terminal one reopen the room; the idle timeout closes it again.
    while let Ok(Some(envelope)) = tokio::time::timeout(idle_timeout, rx.recv()).await {
        let terminal = SignalKind::from_topic(&envelope.topic).is_some_and(|k| k.is_terminal());
        relay.deliver(envelope);
        if terminal {
            break;
        }
    }

    relay
        .inner
        .rooms
        .remove_if(&room_id, |_, current| current.same_channel(&tx));
    drop(tx);
    rx.close();
    while let Some(envelope) = rx.recv().await {
        relay.deliver(envelope);
    }
    debug!("Room {} retired", room_id);
}

/// A client connection to a [`SignalRelay`].
pub struct MemoryChannel {
    relay: SignalRelay,
    party: Mutex<Option<Party>>,
}

impl MemoryChannel {
    fn party_id(&self) -> Option<String> {
        self.party
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(|p| p.id.clone()))
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn connect(
        &self,
        auth_token: &str,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError> {
        let party = self
            .relay
            .authenticate(auth_token)
            .ok_or(ChannelError::Unauthorized)?;

        self.relay.inner.connections.insert(
            party.id.clone(),
            Connection {
                events: events.clone(),
                subscriptions: HashMap::new(),
            },
        );
        info!("{} connected to relay", party.id);
        if let Ok(mut current) = self.party.lock() {
            *current = Some(party);
        }
        let _ = events.send(ChannelEvent::Connected).await;
        Ok(())
    }

    async fn disconnect(&self) {
        let party = self.party.lock().ok().and_then(|mut p| p.take());
        if let Some(party) = party {
            self.relay.inner.connections.remove(&party.id);
            info!("{} disconnected from relay", party.id);
        }
    }

    async fn publish(&self, topic: &str, room_id: &str, payload: Value) -> Result<(), ChannelError> {
        let from = self.party_id().ok_or(ChannelError::NotConnected)?;
        if !self.relay.is_connected(&from) {
            return Err(ChannelError::NotConnected);
        }
        self.relay
            .publish(Envelope {
                from,
                topic: topic.to_string(),
                room_id: room_id.to_string(),
                payload,
            })
            .await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError> {
        let party_id = self.party_id().ok_or(ChannelError::NotConnected)?;
        let mut connection = self
            .relay
            .inner
            .connections
            .get_mut(&party_id)
            .ok_or(ChannelError::NotConnected)?;
        connection.subscriptions.insert(topic.to_string(), handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn payload(room: &str) -> Value {
        json!({
            "roomId": room,
            "caller": {"id": "alice", "displayName": "Alice"},
            "receiver": {"id": "bob", "displayName": "Bob"},
        })
    }

    async fn connect(
        relay: &SignalRelay,
        token: &str,
        topics: &[SignalKind],
    ) -> (MemoryChannel, mpsc::Receiver<ChannelEvent>) {
        let channel = relay.channel();
        let (tx, mut rx) = mpsc::channel(16);
        channel.connect(token, tx.clone()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Connected)));
        for kind in topics {
            channel.subscribe(kind.topic(), tx.clone()).await.unwrap();
        }
        (channel, rx)
    }

    fn relay() -> SignalRelay {
        let relay = SignalRelay::default();
        relay.register("alice-token", Party::new("alice", "Alice"));
        relay.register("bob-token", Party::new("bob", "Bob"));
        relay
    }

    async fn next_message(rx: &mut mpsc::Receiver<ChannelEvent>) -> InboundSignal {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(ChannelEvent::Message(signal))) => signal,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_unauthorized() {
        let relay = relay();
        let (tx, _rx) = mpsc::channel(1);
        let result = relay.channel().connect("nope", tx).await;
        assert!(matches!(result, Err(ChannelError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let relay = relay();
        let result = relay.channel().publish("Outgoing", "room-1", payload("room-1")).await;
        assert!(matches!(result, Err(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn test_outgoing_delivered_as_incoming() {
        let relay = relay();
        let (alice, _alice_rx) = connect(&relay, "alice-token", &[SignalKind::Accepted]).await;
        let (_bob, mut bob_rx) = connect(&relay, "bob-token", &[SignalKind::Incoming]).await;

        alice
            .publish("Outgoing", "room-1", payload("room-1"))
            .await
            .unwrap();

        let signal = next_message(&mut bob_rx).await;
        assert_eq!(signal.topic, "Incoming");
        assert_eq!(signal.room_id, "room-1");
    }

    #[tokio::test]
    async fn test_events_in_a_room_keep_publish_order() {
        let relay = relay();
        let (alice, _alice_rx) = connect(&relay, "alice-token", &[]).await;
        let (_bob, mut bob_rx) = connect(
            &relay,
            "bob-token",
            &[SignalKind::Incoming, SignalKind::EscrowRequested, SignalKind::Ended],
        )
        .await;

        for topic in ["Outgoing", "EscrowRequested", "Ended"] {
            alice.publish(topic, "room-1", payload("room-1")).await.unwrap();
        }

        let received: Vec<String> = [
            next_message(&mut bob_rx).await,
            next_message(&mut bob_rx).await,
            next_message(&mut bob_rx).await,
        ]
        .into_iter()
        .map(|s| s.topic)
        .collect();
        assert_eq!(received, vec!["Incoming", "EscrowRequested", "Ended"]);
    }

    #[tokio::test]
    async fn test_sender_outside_the_call_is_dropped() {
        let relay = relay();
        relay.register("mallory-token", Party::new("mallory", "Mallory"));
        let (mallory, _rx) = connect(&relay, "mallory-token", &[]).await;
        let (_bob, mut bob_rx) = connect(&relay, "bob-token", &[SignalKind::Ended]).await;

        mallory.publish("Ended", "room-1", payload("room-1")).await.unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(50), bob_rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_drop_filter_loses_matching_deliveries() {
        let filter: DropFilter = Arc::new(|topic: &str, _to: &str| topic == "Accepted");
        let relay = SignalRelay::new(RelayConfig {
            drop_filter: Some(filter),
            ..Default::default()
        });
        relay.register("alice-token", Party::new("alice", "Alice"));
        relay.register("bob-token", Party::new("bob", "Bob"));
        let (_alice, mut alice_rx) =
            connect(&relay, "alice-token", &[SignalKind::Accepted, SignalKind::Ended]).await;
        let (bob, _bob_rx) = connect(&relay, "bob-token", &[]).await;

        bob.publish("Accepted", "room-1", payload("room-1")).await.unwrap();
        bob.publish("Ended", "room-1", payload("room-1")).await.unwrap();

        assert_eq!(next_message(&mut alice_rx).await.topic, "Ended");
    }

    #[tokio::test]
    async fn test_deauthenticate_disconnects_party() {
        let relay = relay();
        let (_bob, mut bob_rx) = connect(&relay, "bob-token", &[]).await;

        relay.deauthenticate("bob").await;

        assert!(matches!(bob_rx.recv().await, Some(ChannelEvent::Disconnected)));
        assert!(!relay.is_connected("bob"));
        let (tx, _rx) = mpsc::channel(1);
        let again = relay.channel().connect("bob-token", tx).await;
        assert!(matches!(again, Err(ChannelError::Unauthorized)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_room_is_retired() {
        let relay = relay();
        let (alice, _alice_rx) = connect(&relay, "alice-token", &[]).await;
        let (bob, mut bob_rx) = connect(&relay, "bob-token", &[SignalKind::Accepted]).await;

        // A late answer after the room already closed on a cancel.
        alice.publish("Ended", "room-1", payload("room-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(relay.active_rooms(), 0);
        bob.publish("Accepted", "room-1", payload("room-1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(relay.active_rooms(), 1);

        tokio::time::sleep(RelayConfig::default().room_idle_timeout).await;
        assert_eq!(relay.active_rooms(), 0);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_event_retires_room() {
        let relay = relay();
        let (alice, _alice_rx) = connect(&relay, "alice-token", &[]).await;
        let (_bob, mut bob_rx) = connect(&relay, "bob-token", &[SignalKind::Ended]).await;

        alice.publish("Ended", "room-1", payload("room-1")).await.unwrap();
        next_message(&mut bob_rx).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(relay.active_rooms(), 0);
    }
}
