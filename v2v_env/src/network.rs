//! Network transport abstraction for V2V engines.

use crate::error::EnvError;
use crate::types::{VehicleId, WireFrame};
use async_trait::async_trait;
use tracing::debug;

/// Abstraction for "deliver bytes to a peer".
///
/// The protocol engine calls `deliver` once per resolved target. Getting
/// the frame to the peer's engine (radio, UDP, in-memory channel) is the
/// implementation's job.
///
/// # Packet Flow
///
/// ```text
/// Vehicle A                  Transport                  Vehicle B
///   |                           |                          |
///   |-- deliver(B, frame) ----->|                          |
///   |                           |-- [latency/loss] ------->|
///   |                           |                          |-- receive_frame(frame)
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hands a frame to the transport for delivery to `target`.
    ///
    /// # Returns
    /// * `Ok(())` - Frame accepted for delivery
    /// * `Err(EnvError)` - Immediate failure (unknown peer, closed channel)
    ///
    /// # Note
    /// Success does not guarantee delivery.
    async fn deliver(&self, target: &VehicleId, frame: WireFrame) -> Result<(), EnvError>;

    /// Returns this vehicle's id.
    fn local_id(&self) -> &VehicleId;
}

/// Reference transport: records the call in the log and drops the frame.
#[derive(Debug, Clone)]
pub struct LoggingTransport {
    local_id: VehicleId,
}

impl LoggingTransport {
    pub fn new(local_id: VehicleId) -> Self {
        Self { local_id }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn deliver(&self, target: &VehicleId, frame: WireFrame) -> Result<(), EnvError> {
        debug!(
            from = %self.local_id,
            to = %target,
            bytes = frame.size(),
            "network send"
        );
        Ok(())
    }

    fn local_id(&self) -> &VehicleId {
        &self.local_id
    }
}

/// Fault-injection controls for simulated networks.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two vehicle sets.
    fn partition(&self, group_a: &[VehicleId], group_b: &[VehicleId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets packet loss probability for a directed link (0.0 - 1.0).
    fn set_link_loss(&self, from: &VehicleId, to: &VehicleId, loss_rate: f64);
}
