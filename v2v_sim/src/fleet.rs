//! Multi-vehicle harness: N vehicle nodes on one shared security manager,
//! one shared proximity index and one simulated medium.

use crate::context::SimContext;
use crate::network::{SimNetwork, SimTransport};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use v2v_core::{
    Acceleration, NodeError, Position, ProtocolError, ProximityIndex, SecurityManager,
    SpatialSnapshot, V2vConfig, VehicleIdentity, VehicleNode, VehicleState, Velocity,
};
use v2v_env::{V2vContext, VehicleId};

pub type SimNode = VehicleNode<SimContext, SimTransport>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Vehicle {0} already in the fleet")]
    DuplicateVehicle(VehicleId),

    #[error("Vehicle {0} not in the fleet")]
    UnknownVehicle(VehicleId),

    #[error(transparent)]
    Node(#[from] NodeError),
}

pub struct Fleet {
    ctx: Arc<SimContext>,
    config: V2vConfig,
    network: SimNetwork,
    security: Arc<SecurityManager<SimContext>>,
    proximity: Arc<ProximityIndex<SimContext>>,
    nodes: BTreeMap<VehicleId, Arc<SimNode>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Fleet {
    pub fn new(seed: u64, config: V2vConfig) -> Self {
        let ctx = SimContext::shared(seed);
        let security = Arc::new(SecurityManager::new(Arc::clone(&ctx), config.security.clone()));
        let proximity = Arc::new(ProximityIndex::new(Arc::clone(&ctx), config.proximity.clone()));
        Self {
            ctx,
            network: SimNetwork::new(seed),
            config,
            security,
            proximity,
            nodes: BTreeMap::new(),
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Onboards a vehicle and starts pumping its inbound frames into its
    /// engine. Must be called inside a tokio runtime.
    pub fn add_vehicle(&mut self, name: &str) -> Result<Arc<SimNode>, FleetError> {
        let vehicle_id = VehicleId::new(name);
        if self.nodes.contains_key(&vehicle_id) {
            return Err(FleetError::DuplicateVehicle(vehicle_id));
        }

        let identity = VehicleIdentity::new(vehicle_id.clone(), self.ctx.unix_millis()).with_details(
            "SimMotors",
            "Testbed",
            2024,
            format!("SIM{:014}", self.nodes.len()),
        );
        let (transport, mut inbound) = self.network.attach(vehicle_id.clone());
        let node = Arc::new(VehicleNode::new(
            identity,
            Arc::clone(&self.ctx),
            Arc::new(transport),
            Arc::clone(&self.security),
            Arc::clone(&self.proximity),
            self.config.protocol.clone(),
        )?);

        let pump_node = Arc::clone(&node);
        let pump = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match pump_node.engine().receive_frame(frame).await {
                    Ok(_) | Err(ProtocolError::Duplicate(_)) => {}
                    Err(e) => debug!(vehicle = %pump_node.vehicle_id(), error = %e, "frame rejected"),
                }
            }
        });
        self.pumps.lock().push(pump);
        self.nodes.insert(vehicle_id, Arc::clone(&node));
        Ok(node)
    }

    pub async fn start_all(&self) -> Result<(), FleetError> {
        for node in self.nodes.values() {
            node.start().await?;
        }
        info!(vehicles = self.nodes.len(), "fleet started");
        Ok(())
    }

    /// Pushes a fresh sensor snapshot for `name` at the given coordinates.
    pub fn place(&self, name: &str, latitude: f64, longitude: f64) -> Result<(), FleetError> {
        self.place_with_state(name, latitude, longitude, VehicleState::Moving)
    }

    pub fn place_with_state(
        &self,
        name: &str,
        latitude: f64,
        longitude: f64,
        state: VehicleState,
    ) -> Result<(), FleetError> {
        let vehicle_id = VehicleId::new(name);
        let node = self
            .nodes
            .get(&vehicle_id)
            .ok_or_else(|| FleetError::UnknownVehicle(vehicle_id.clone()))?;
        let now_ms = self.ctx.unix_millis();
        let snapshot = SpatialSnapshot::new(
            vehicle_id,
            Position::new(latitude, longitude).at(now_ms),
            Velocity::new(10.0, 0.0).at(now_ms),
            Acceleration::default().at(now_ms),
            state,
            now_ms,
        );
        Ok(node.update_spatial_snapshot(snapshot)?)
    }

    pub fn node(&self, name: &str) -> Option<Arc<SimNode>> {
        self.nodes.get(&VehicleId::new(name)).cloned()
    }

    pub fn ctx(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn security(&self) -> &Arc<SecurityManager<SimContext>> {
        &self.security
    }

    pub fn proximity(&self) -> &Arc<ProximityIndex<SimContext>> {
        &self.proximity
    }

    /// Stops every node and the proximity monitor, then the frame pumps.
    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.stop().await;
        }
        self.proximity.stop_monitoring().await;

        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in pumps {
            pump.abort();
            let _ = pump.await;
        }
        info!("fleet shut down");
    }
}
