//! V2V Core - Authenticated, encrypted vehicle-to-vehicle spatial awareness
//!
//! Vehicles in communication range exchange position, velocity and driving
//! state over a lightweight single-hop broadcast protocol:
//! 1. **Identity**: Ed25519 key pair + self-signed certificate per vehicle
//! 2. **Security**: pairwise session keys, AES-256-GCM envelopes, signatures, revocation
//! 3. **Proximity**: shared range index with entered/exited/moved events
//! 4. **Protocol**: per-vehicle engine with dispatch, broadcast, heartbeat and cleanup loops
//!
//! All engines are generic over `v2v_env::V2vContext` (clock, entropy) and
//! `v2v_env::Transport` (deliver bytes to a peer).

pub mod config;
pub mod geometry;
pub mod identity;
pub mod message;
pub mod node;
pub mod protocol;
pub mod proximity;
pub mod security;
pub mod spatial;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export key types for convenience
pub use config::{ConfigError, V2vConfig};
pub use geometry::{Acceleration, Position, Velocity};
pub use identity::{IdentityError, IdentityManager, IdentitySummary, VehicleCertificate, VehicleIdentity};
pub use message::{MessageId, MessageType, Payload, V2vMessage};
pub use node::{NodeError, VehicleNode};
pub use protocol::{
    Frame, HandlerId, MessageHandler, MessageStats, ProtocolConfig, ProtocolEngine, ProtocolError,
    ProtocolStatistics,
};
pub use proximity::{
    CommunicationStatistics, ListenerId, ProximityConfig, ProximityEvent, ProximityEventKind,
    ProximityIndex, ProximityListener,
};
pub use security::{
    EncryptedEnvelope, SecurityConfig, SecurityError, SecurityManager, SecurityStatistics,
};
pub use spatial::{MessagePriority, SpatialSnapshot, Trajectory, TrajectoryPoint, VehicleState};
