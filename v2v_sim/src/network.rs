//! Simulated broadcast medium with fault injection.
//!
//! Every attached vehicle gets a `SimTransport` (its outbound side) and an
//! unbounded receiver of `WireFrame`s (its inbound side). Partitions make
//! `deliver` fail with `Unreachable`; lossy links drop frames silently.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use v2v_env::{EnvError, NetworkController, Transport, VehicleId, WireFrame};

/// Delivery counters for the whole medium.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub lost: u64,
    pub unreachable: u64,
}

struct Medium {
    mailboxes: RwLock<HashMap<VehicleId, mpsc::UnboundedSender<WireFrame>>>,
    partitions: RwLock<Vec<(HashSet<VehicleId>, HashSet<VehicleId>)>>,
    link_loss: RwLock<HashMap<(VehicleId, VehicleId), f64>>,
    rng: Mutex<ChaCha8Rng>,
    stats: Mutex<NetworkStats>,
}

impl Medium {
    fn is_partitioned(&self, from: &VehicleId, to: &VehicleId) -> bool {
        self.partitions.read().iter().any(|(a, b)| {
            (a.contains(from) && b.contains(to)) || (b.contains(from) && a.contains(to))
        })
    }

    fn roll_loss(&self, from: &VehicleId, to: &VehicleId) -> bool {
        let rate = self
            .link_loss
            .read()
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0.0);
        rate > 0.0 && self.rng.lock().gen::<f64>() < rate
    }
}

/// Shared medium; cheap to clone.
#[derive(Clone)]
pub struct SimNetwork {
    medium: Arc<Medium>,
}

impl SimNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            medium: Arc::new(Medium {
                mailboxes: RwLock::new(HashMap::new()),
                partitions: RwLock::new(Vec::new()),
                link_loss: RwLock::new(HashMap::new()),
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
                stats: Mutex::new(NetworkStats::default()),
            }),
        }
    }

    /// Connects a vehicle, replacing any previous attachment.
    pub fn attach(&self, vehicle_id: VehicleId) -> (SimTransport, mpsc::UnboundedReceiver<WireFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.medium.mailboxes.write().insert(vehicle_id.clone(), tx);
        let transport = SimTransport {
            local_id: vehicle_id,
            medium: Arc::clone(&self.medium),
        };
        (transport, rx)
    }

    pub fn detach(&self, vehicle_id: &VehicleId) -> bool {
        self.medium.mailboxes.write().remove(vehicle_id).is_some()
    }

    pub fn stats(&self) -> NetworkStats {
        self.medium.stats.lock().clone()
    }
}

impl NetworkController for SimNetwork {
    fn partition(&self, group_a: &[VehicleId], group_b: &[VehicleId]) {
        self.medium.partitions.write().push((
            group_a.iter().cloned().collect(),
            group_b.iter().cloned().collect(),
        ));
    }

    fn heal_all(&self) {
        self.medium.partitions.write().clear();
    }

    fn set_link_loss(&self, from: &VehicleId, to: &VehicleId, loss_rate: f64) {
        self.medium
            .link_loss
            .write()
            .insert((from.clone(), to.clone()), loss_rate.clamp(0.0, 1.0));
    }
}

/// One vehicle's outbound side of the medium.
pub struct SimTransport {
    local_id: VehicleId,
    medium: Arc<Medium>,
}

#[async_trait]
impl Transport for SimTransport {
    async fn deliver(&self, target: &VehicleId, frame: WireFrame) -> Result<(), EnvError> {
        let medium = &self.medium;
        if medium.is_partitioned(&self.local_id, target) {
            medium.stats.lock().unreachable += 1;
            return Err(EnvError::unreachable(target));
        }
        if medium.roll_loss(&self.local_id, target) {
            trace!(from = %self.local_id, to = %target, "frame lost");
            medium.stats.lock().lost += 1;
            return Ok(());
        }

        let mailbox = medium.mailboxes.read().get(target).cloned();
        let Some(mailbox) = mailbox else {
            medium.stats.lock().unreachable += 1;
            return Err(EnvError::unreachable(target));
        };
        mailbox
            .send(frame)
            .map_err(|_| EnvError::link_closed(target))?;
        medium.stats.lock().delivered += 1;
        Ok(())
    }

    fn local_id(&self) -> &VehicleId {
        &self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(from: &str) -> WireFrame {
        WireFrame::new(VehicleId::new(from), vec![1, 2, 3], 0)
    }

    #[tokio::test]
    async fn test_delivery_between_attached_vehicles() {
        let network = SimNetwork::new(1);
        let (a, _rx_a) = network.attach(VehicleId::new("a"));
        let (_b, mut rx_b) = network.attach(VehicleId::new("b"));

        a.deliver(&VehicleId::new("b"), frame("a")).await.unwrap();
        let received = rx_b.recv().await.unwrap();
        assert_eq!(received.sender, VehicleId::new("a"));
        assert_eq!(network.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let network = SimNetwork::new(1);
        let (a, _rx_a) = network.attach(VehicleId::new("a"));
        let (_b, mut rx_b) = network.attach(VehicleId::new("b"));

        network.partition(&[VehicleId::new("a")], &[VehicleId::new("b")]);
        let err = a.deliver(&VehicleId::new("b"), frame("a")).await.unwrap_err();
        assert!(matches!(err, EnvError::Unreachable(_)));

        network.heal_all();
        a.deliver(&VehicleId::new("b"), frame("a")).await.unwrap();
        assert!(rx_b.recv().await.is_some());
        assert_eq!(network.stats().unreachable, 1);
    }

    #[tokio::test]
    async fn test_total_link_loss_drops_silently() {
        let network = SimNetwork::new(1);
        let (a, _rx_a) = network.attach(VehicleId::new("a"));
        let (_b, mut rx_b) = network.attach(VehicleId::new("b"));
        network.set_link_loss(&VehicleId::new("a"), &VehicleId::new("b"), 1.0);

        for _ in 0..10 {
            a.deliver(&VehicleId::new("b"), frame("a")).await.unwrap();
        }
        assert!(rx_b.try_recv().is_err());
        assert_eq!(network.stats().lost, 10);
    }

    #[tokio::test]
    async fn test_closed_mailbox_reports_link_closed() {
        let network = SimNetwork::new(1);
        let (a, _rx_a) = network.attach(VehicleId::new("a"));
        let (_b, rx_b) = network.attach(VehicleId::new("b"));
        drop(rx_b);

        let err = a.deliver(&VehicleId::new("b"), frame("a")).await.unwrap_err();
        assert!(matches!(err, EnvError::LinkClosed(ref id) if id.as_str() == "b"));
        assert_eq!(network.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_unknown_target_is_unreachable() {
        let network = SimNetwork::new(1);
        let (a, _rx_a) = network.attach(VehicleId::new("a"));
        assert!(a.deliver(&VehicleId::new("nobody"), frame("a")).await.is_err());

        network.attach(VehicleId::new("b"));
        assert!(network.detach(&VehicleId::new("b")));
        assert!(a.deliver(&VehicleId::new("b"), frame("a")).await.is_err());
    }
}
