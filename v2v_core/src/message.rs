//! V2V message model: message types, ids and typed payloads.

use crate::spatial::{MessagePriority, SpatialSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::{Builder, Uuid};
use v2v_env::{V2vContext, VehicleId};

/// Default time-to-live in seconds.
pub const DEFAULT_TTL_SECS: u64 = 5;

/// Kinds of V2V traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SpatialData,
    EmergencyBroadcast,
    TrajectoryPrediction,
    CollisionWarning,
    LaneChangeRequest,
    IntersectionCoordination,
    Heartbeat,
    Acknowledgment,
}

/// Unique id assigned to every originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// A random (v4) id drawn from the context's entropy, so seeded runs
    /// replay with the same ids.
    pub fn generate<C: V2vContext + ?Sized>(ctx: &C) -> Self {
        let mut bytes = [0u8; 16];
        ctx.fill_random(&mut bytes);
        Self(Builder::from_random_bytes(bytes).into_uuid())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Spatial(SpatialSnapshot),
    Heartbeat { sent_at_ms: u64 },
    Acknowledgment { original_message_id: MessageId },
    Custom(serde_json::Value),
}

/// A single V2V message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2vMessage {
    pub message_id: MessageId,
    pub message_type: MessageType,
    pub sender_id: VehicleId,

    /// None means broadcast to every in-range peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<VehicleId>,

    pub priority: MessagePriority,
    pub timestamp_ms: u64,
    pub ttl_secs: u64,
    pub payload: Payload,
    pub encrypted: bool,
}

impl V2vMessage {
    /// Encrypted broadcast with normal priority and the default TTL,
    /// stamped with a fresh id and the context's current time.
    pub fn new<C: V2vContext + ?Sized>(
        ctx: &C,
        message_type: MessageType,
        sender_id: VehicleId,
        payload: Payload,
    ) -> Self {
        Self {
            message_id: MessageId::generate(ctx),
            message_type,
            sender_id,
            receiver_id: None,
            priority: MessagePriority::Normal,
            timestamp_ms: ctx.unix_millis(),
            ttl_secs: DEFAULT_TTL_SECS,
            payload,
            encrypted: true,
        }
    }

    pub fn with_receiver(mut self, receiver_id: VehicleId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Sends the message in clear.
    pub fn unencrypted(mut self) -> Self {
        self.encrypted = false;
        self
    }

    /// Milliseconds since the message was created (0 for future timestamps).
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    /// `now - timestamp > ttl`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.age_ms(now_ms) > self.ttl_secs.saturating_mul(1000)
    }

    /// Id of the message being acknowledged, if this is an acknowledgment.
    pub fn acknowledged_id(&self) -> Option<MessageId> {
        match self.payload {
            Payload::Acknowledgment { original_message_id } => Some(original_message_id),
            _ => None,
        }
    }
}
