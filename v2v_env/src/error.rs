//! Transport-level failures.

use crate::types::VehicleId;
use thiserror::Error;

/// Why a frame could not be handed to a peer.
///
/// Only immediate failures are reported here; a frame lost on the air is
/// indistinguishable from a delivered one.
#[derive(Debug, Error)]
pub enum EnvError {
    /// No route to the target (unknown, detached or partitioned away)
    #[error("Vehicle {0} unreachable")]
    Unreachable(VehicleId),

    /// The target's inbound side has shut down
    #[error("Link to {0} closed")]
    LinkClosed(VehicleId),
}

impl EnvError {
    pub fn unreachable(vehicle: &VehicleId) -> Self {
        Self::Unreachable(vehicle.clone())
    }

    pub fn link_closed(vehicle: &VehicleId) -> Self {
        Self::LinkClosed(vehicle.clone())
    }
}
