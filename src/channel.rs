//! Signaling channel boundary.
//!
//! The channel is topic-addressed, at-most-once and unordered. This crate
//! never assumes more than that. Concrete transports (websocket, socket.io
//! bridge, the in-process [`crate::relay::MemoryChannel`]) implement
//! [`SignalingChannel`].

use crate::calls::payload::InboundSignal;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("authentication rejected")]
    Unauthorized,

    #[error("publish failed: {0}")]
    Publish(anyhow::Error),
}

/// An event produced by the channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel finished connecting.
    Connected,
    /// A message arrived on a subscribed topic.
    Message(InboundSignal),
    /// The connection was lost or closed. All session state must be reset.
    Disconnected,
}

/// Transport carrying signal events between parties.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the connection for the party identified by `auth_token`.
    ///
    /// Lifecycle events ([`ChannelEvent::Connected`] /
    /// [`ChannelEvent::Disconnected`]) are delivered to `events`.
    async fn connect(
        &self,
        auth_token: &str,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);

    /// Publish one event. Delivery is not confirmed.
    async fn publish(&self, topic: &str, room_id: &str, payload: Value)
    -> Result<(), ChannelError>;

    /// Route messages for `topic` into `handler` as [`ChannelEvent::Message`].
    async fn subscribe(
        &self,
        topic: &str,
        handler: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// A channel that records publishes and delivers nothing.
    #[derive(Default)]
    pub struct RecordingChannel {
        pub published: Mutex<Vec<(String, String, Value)>>,
        pub fail_publish: bool,
    }

    impl RecordingChannel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                fail_publish: true,
                ..Default::default()
            }
        }

        pub fn topics(&self) -> Vec<String> {
            self.published
                .lock()
                .map(|p| p.iter().map(|(t, _, _)| t.clone()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl SignalingChannel for RecordingChannel {
        async fn connect(
            &self,
            _auth_token: &str,
            events: mpsc::Sender<ChannelEvent>,
        ) -> Result<(), ChannelError> {
            let _ = events.send(ChannelEvent::Connected).await;
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn publish(
            &self,
            topic: &str,
            room_id: &str,
            payload: Value,
        ) -> Result<(), ChannelError> {
            if self.fail_publish {
                return Err(ChannelError::Publish(anyhow::anyhow!("socket closed")));
            }
            if let Ok(mut published) = self.published.lock() {
                published.push((topic.to_string(), room_id.to_string(), payload));
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _handler: mpsc::Sender<ChannelEvent>,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }
}
