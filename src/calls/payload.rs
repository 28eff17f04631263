//! Signal payload parsing and building.
//!
//! Inbound messages arrive from the channel as loosely typed JSON and are
//! validated here before any state machine sees them. Outbound events are
//! built with [`SignalEvent::new`] and serialized with [`SignalEvent::to_wire`].

use super::error::PayloadError;
use super::signaling::SignalKind;
use crate::types::call::{Party, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Call payload shared by every signal kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallData {
    pub room_id: RoomId,
    pub caller: Party,
    pub receiver: Party,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CallData {
    pub fn new(room_id: RoomId, caller: Party, receiver: Party) -> Self {
        Self {
            room_id,
            caller,
            receiver,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The participant that is not `party_id`.
    pub fn peer_of(&self, party_id: &str) -> Option<&Party> {
        if self.caller.id == party_id {
            Some(&self.receiver)
        } else if self.receiver.id == party_id {
            Some(&self.caller)
        } else {
            None
        }
    }
}

/// Escrow fields carried in [`CallData::data`] for escrow kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowDetails {
    pub amount: f64,
    pub item_title: String,
    #[serde(default)]
    pub item_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_session_id: Option<String>,
}

impl EscrowDetails {
    /// Check the request constraints: positive finite amount, non-empty title.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err("amount must be greater than zero");
        }
        if self.item_title.trim().is_empty() {
            return Err("item title must not be empty");
        }
        Ok(())
    }
}

/// Message as delivered by the channel, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub topic: String,
    pub room_id: String,
    pub payload: Value,
}

/// Validated signal event.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub kind: SignalKind,
    pub room_id: RoomId,
    pub payload: CallData,
}

impl SignalEvent {
    pub fn new(kind: SignalKind, payload: CallData) -> Self {
        Self {
            kind,
            room_id: payload.room_id.clone(),
            payload,
        }
    }

    /// Validate an inbound message.
    ///
    /// Checks, in order: recognized kind, non-empty room id, payload shape,
    /// envelope/payload room agreement, and for `EscrowRequested` the escrow
    /// fields.
    pub fn parse(raw: &InboundSignal) -> Result<Self, PayloadError> {
        let kind = SignalKind::from_topic(&raw.topic)
            .ok_or_else(|| PayloadError::UnknownKind(raw.topic.clone()))?;

        if raw.room_id.trim().is_empty() {
            return Err(PayloadError::MissingField("roomId"));
        }

        let object = raw
            .payload
            .as_object()
            .ok_or_else(|| PayloadError::Malformed("payload is not an object".to_string()))?;
        for field in ["caller", "receiver"] {
            if !object.contains_key(field) {
                return Err(PayloadError::MissingField(field));
            }
        }

        // Older peers omit roomId inside the payload; the envelope is authoritative.
        let mut payload_value = raw.payload.clone();
        if let Some(map) = payload_value.as_object_mut() {
            map.entry("roomId")
                .or_insert_with(|| Value::String(raw.room_id.clone()));
        }

        let payload: CallData = serde_json::from_value(payload_value)
            .map_err(|e| PayloadError::Malformed(e.to_string()))?;

        if payload.room_id.as_str() != raw.room_id {
            return Err(PayloadError::RoomMismatch {
                envelope: raw.room_id.clone(),
                payload: payload.room_id.to_string(),
            });
        }

        let event = Self {
            kind,
            room_id: payload.room_id.clone(),
            payload,
        };

        if kind == SignalKind::EscrowRequested {
            event.escrow_details()?;
        }

        Ok(event)
    }

    /// Escrow fields of this event, if present and well formed.
    pub fn escrow_details(&self) -> Result<EscrowDetails, PayloadError> {
        let data = self
            .payload
            .data
            .clone()
            .ok_or(PayloadError::MissingField("data"))?;
        let details: EscrowDetails =
            serde_json::from_value(data).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        details.validate().map_err(|e| PayloadError::Malformed(e.to_string()))?;
        Ok(details)
    }

    /// Serialize the payload for publishing.
    pub fn to_wire(&self) -> Value {
        // CallData has only string keys and JSON values, serialization cannot fail.
        serde_json::to_value(&self.payload).unwrap_or(Value::Null)
    }
}
