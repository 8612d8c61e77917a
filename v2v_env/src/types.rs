//! Common types for the V2V environment abstraction.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a vehicle.
///
/// Vehicle ids are opaque strings assigned at onboarding; a random UUID v4
/// is used when the caller does not pick one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for VehicleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for VehicleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Transport-layer unit exchanged between vehicles.
///
/// The payload is opaque bytes; the receiving engine decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    /// Vehicle that put the frame on the air
    pub sender: VehicleId,

    /// The encoded frame bytes
    pub payload: Vec<u8>,

    /// Timestamp when the frame was created (sender's clock)
    pub timestamp_ms: u64,
}

impl WireFrame {
    /// Creates a new frame from payload bytes.
    pub fn new(sender: VehicleId, payload: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            sender,
            payload,
            timestamp_ms,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
