//! One vehicle's V2V stack: identity, protocol engine and its view of the
//! shared security manager and proximity index.

use crate::identity::{IdentitySummary, VehicleIdentity};
use crate::message::{MessageType, V2vMessage};
use crate::protocol::{ProtocolConfig, ProtocolEngine, ProtocolError, ProtocolStatistics};
use crate::proximity::{CommunicationStatistics, ProximityIndex};
use crate::security::{SecurityError, SecurityManager, SecurityStatistics};
use crate::spatial::SpatialSnapshot;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use v2v_env::{Transport, V2vContext, VehicleId};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Identity {identity} does not match transport address {transport}")]
    IdentityMismatch { identity: VehicleId, transport: VehicleId },

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct VehicleNode<Ctx: V2vContext, Net: Transport> {
    ctx: Arc<Ctx>,
    identity: Arc<VehicleIdentity>,
    security: Arc<SecurityManager<Ctx>>,
    proximity: Arc<ProximityIndex<Ctx>>,
    engine: ProtocolEngine<Ctx, Net>,
}

impl<Ctx: V2vContext, Net: Transport> VehicleNode<Ctx, Net> {
    /// Registers the identity with the security manager and wires up the
    /// protocol engine with default logging handlers.
    pub fn new(
        identity: VehicleIdentity,
        ctx: Arc<Ctx>,
        transport: Arc<Net>,
        security: Arc<SecurityManager<Ctx>>,
        proximity: Arc<ProximityIndex<Ctx>>,
        config: ProtocolConfig,
    ) -> Result<Self, NodeError> {
        if transport.local_id() != &identity.vehicle_id {
            return Err(NodeError::IdentityMismatch {
                identity: identity.vehicle_id,
                transport: transport.local_id().clone(),
            });
        }

        let identity = security.register_vehicle(identity)?;
        let engine = ProtocolEngine::new(
            Arc::clone(&ctx),
            transport,
            Arc::clone(&security),
            Arc::clone(&proximity),
            config,
        );
        let node = Self {
            ctx,
            identity,
            security,
            proximity,
            engine,
        };
        node.register_default_handlers();
        Ok(node)
    }

    fn register_default_handlers(&self) {
        let me = self.identity.vehicle_id.clone();

        let id = me.clone();
        self.engine.register_message_handler(
            MessageType::SpatialData,
            Arc::new(move |m: &V2vMessage| -> anyhow::Result<()> {
                debug!(vehicle = %id, from = %m.sender_id, "spatial data received");
                Ok(())
            }),
        );

        let id = me.clone();
        self.engine.register_message_handler(
            MessageType::EmergencyBroadcast,
            Arc::new(move |m: &V2vMessage| -> anyhow::Result<()> {
                warn!(vehicle = %id, from = %m.sender_id, "emergency broadcast received");
                Ok(())
            }),
        );

        let id = me.clone();
        self.engine.register_message_handler(
            MessageType::CollisionWarning,
            Arc::new(move |m: &V2vMessage| -> anyhow::Result<()> {
                warn!(vehicle = %id, from = %m.sender_id, "collision warning received");
                Ok(())
            }),
        );

        let id = me.clone();
        self.engine.register_message_handler(
            MessageType::Heartbeat,
            Arc::new(move |m: &V2vMessage| -> anyhow::Result<()> {
                debug!(vehicle = %id, from = %m.sender_id, "heartbeat received");
                Ok(())
            }),
        );

        let id = me;
        self.engine.register_message_handler(
            MessageType::Acknowledgment,
            Arc::new(move |m: &V2vMessage| -> anyhow::Result<()> {
                debug!(vehicle = %id, from = %m.sender_id, acked = ?m.acknowledged_id(), "acknowledgment received");
                Ok(())
            }),
        );
    }

    pub fn vehicle_id(&self) -> &VehicleId {
        &self.identity.vehicle_id
    }

    pub fn identity(&self) -> &Arc<VehicleIdentity> {
        &self.identity
    }

    pub fn engine(&self) -> &ProtocolEngine<Ctx, Net> {
        &self.engine
    }

    /// Starts proximity monitoring (if nobody has yet) and the engine.
    ///
    /// Fails if the identity is no longer authorized, e.g. after `stop()`.
    pub async fn start(&self) -> Result<(), NodeError> {
        self.security.authorize(self.vehicle_id())?;
        self.proximity.start_monitoring();
        self.engine.start().await;
        info!(vehicle = %self.vehicle_id(), hash = %self.identity.vehicle_hash(), "vehicle node started");
        Ok(())
    }

    /// Stops the engine and revokes this vehicle's identity.
    pub async fn stop(&self) {
        self.engine.stop().await;
        self.security.revoke_vehicle(self.vehicle_id());
        info!(vehicle = %self.vehicle_id(), "vehicle node stopped");
    }

    pub fn update_spatial_snapshot(&self, snapshot: SpatialSnapshot) -> Result<(), NodeError> {
        Ok(self.engine.update_spatial_snapshot(snapshot)?)
    }

    pub fn identity_summary(&self) -> IdentitySummary {
        self.identity.summary(self.ctx.unix_millis())
    }

    pub fn protocol_statistics(&self) -> ProtocolStatistics {
        self.engine.get_statistics()
    }

    pub fn communication_statistics(&self) -> CommunicationStatistics {
        self.proximity.communication_statistics()
    }

    pub fn security_statistics(&self) -> SecurityStatistics {
        self.security.security_statistics()
    }
}
