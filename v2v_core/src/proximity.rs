//! The proximity index: who is within communication range of whom.
//!
//! One index is shared by every vehicle's engine. It keeps the latest
//! snapshot per vehicle plus a symmetric "nearby" set, and fans out
//! `entered` / `exited` / `moved` events to subscribed listeners.
//!
//! # Locking
//!
//! All table mutation happens under one `parking_lot::RwLock` that is never
//! held across an `.await` or while listeners run. Events are collected
//! under the lock and delivered after it is released, so a listener may
//! call back into the index.

use crate::geometry::Position;
use crate::spatial::SpatialSnapshot;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use v2v_env::{V2vContext, VehicleId};

/// Proximity index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Communication range; `distance <= max_range` means in range
    pub max_range_m: f64,

    /// Closest meaningful separation (reported, not enforced)
    pub min_range_m: f64,

    /// Purge sweep period
    pub update_interval_ms: u64,

    /// Vehicles unseen for longer than this are removed
    pub purge_delay_secs: u64,

    /// Displacement above which a `moved` event fires
    pub movement_threshold_m: f64,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            max_range_m: 1000.0,
            min_range_m: 10.0,
            update_interval_ms: 100,
            purge_delay_secs: 30,
            movement_threshold_m: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityEventKind {
    Entered,
    Exited,
    Moved,
}

/// A membership or movement change.
///
/// For `Entered`/`Exited`, `vehicle_id` is the subject and `observer_id`
/// is the vehicle whose nearby set changed. `Moved` has no observer and
/// carries the displacement in `distance_m`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    pub kind: ProximityEventKind,
    pub vehicle_id: VehicleId,
    pub observer_id: Option<VehicleId>,
    pub distance_m: f64,
    pub timestamp_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_position: Option<Position>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_position: Option<Position>,
}

impl ProximityEvent {
    fn membership(
        kind: ProximityEventKind,
        subject: &VehicleId,
        observer: &VehicleId,
        distance_m: f64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            kind,
            vehicle_id: subject.clone(),
            observer_id: Some(observer.clone()),
            distance_m,
            timestamp_ms,
            previous_position: None,
            current_position: None,
        }
    }

    /// True if this event changes `observer`'s view of its surroundings.
    pub fn is_observed_by(&self, observer: &VehicleId) -> bool {
        self.observer_id.as_ref() == Some(observer)
    }
}

/// Receives proximity events.
///
/// Errors and panics are logged and never reach other listeners.
pub trait ProximityListener: Send + Sync {
    fn on_event(&self, event: &ProximityEvent) -> anyhow::Result<()>;
}

impl<F> ProximityListener for F
where
    F: Fn(&ProximityEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &ProximityEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct TrackedVehicle {
    snapshot: SpatialSnapshot,
    last_seen_ms: u64,
    nearby: HashSet<VehicleId>,
}

struct Monitor {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Read-only snapshot for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationStatistics {
    pub total_vehicles: usize,

    /// Unordered in-range pairs
    pub active_connections: usize,

    pub max_range_m: f64,
    pub min_range_m: f64,
    pub update_interval_ms: u64,
    pub purge_delay_secs: u64,
    pub monitoring: bool,
}

pub struct ProximityIndex<Ctx: V2vContext> {
    ctx: Arc<Ctx>,
    config: ProximityConfig,
    vehicles: RwLock<HashMap<VehicleId, TrackedVehicle>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ProximityListener>)>>,
    next_listener_id: AtomicU64,
    monitor: Mutex<Option<Monitor>>,
}

impl<Ctx: V2vContext> ProximityIndex<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: ProximityConfig) -> Self {
        Self {
            ctx,
            config,
            vehicles: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn subscribe(&self, listener: Arc<dyn ProximityListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns false if the listener was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Upserts a vehicle's snapshot and emits the resulting events.
    pub fn update_position(&self, snapshot: SpatialSnapshot) {
        let events = self.apply_update(snapshot);
        self.notify(&events);
    }

    fn apply_update(&self, snapshot: SpatialSnapshot) -> Vec<ProximityEvent> {
        use ProximityEventKind::{Entered, Exited, Moved};

        let now_ms = self.ctx.unix_millis();
        let id = snapshot.vehicle_id.clone();
        let mut events = Vec::new();
        let mut vehicles = self.vehicles.write();

        let in_range: HashMap<VehicleId, f64> = vehicles
            .iter()
            .filter(|(other, _)| **other != id)
            .filter_map(|(other, tracked)| {
                let d = snapshot.position.distance_to(&tracked.snapshot.position);
                (d <= self.config.max_range_m).then(|| (other.clone(), d))
            })
            .collect();

        let (previous_position, previous_nearby) = match vehicles.get(&id) {
            Some(t) => (Some(t.snapshot.position.clone()), t.nearby.clone()),
            None => (None, HashSet::new()),
        };

        for (other, &d) in &in_range {
            if previous_nearby.contains(other) {
                continue;
            }
            if let Some(tracked) = vehicles.get_mut(other) {
                tracked.nearby.insert(id.clone());
            }
            events.push(ProximityEvent::membership(Entered, other, &id, d, now_ms));
            events.push(ProximityEvent::membership(Entered, &id, other, d, now_ms));
        }

        for other in previous_nearby.iter().filter(|o| !in_range.contains_key(*o)) {
            let mut d = f64::NAN;
            if let Some(tracked) = vehicles.get_mut(other) {
                tracked.nearby.remove(&id);
                d = snapshot.position.distance_to(&tracked.snapshot.position);
            }
            events.push(ProximityEvent::membership(Exited, other, &id, d, now_ms));
            events.push(ProximityEvent::membership(Exited, &id, other, d, now_ms));
        }

        if let Some(previous) = previous_position {
            let displacement = previous.distance_to(&snapshot.position);
            if displacement > self.config.movement_threshold_m {
                events.push(ProximityEvent {
                    kind: Moved,
                    vehicle_id: id.clone(),
                    observer_id: None,
                    distance_m: displacement,
                    timestamp_ms: now_ms,
                    previous_position: Some(previous),
                    current_position: Some(snapshot.position.clone()),
                });
            }
        }

        vehicles.insert(
            id,
            TrackedVehicle {
                snapshot,
                last_seen_ms: now_ms,
                nearby: in_range.into_keys().collect(),
            },
        );
        events
    }

    /// Drops a vehicle, emitting `exited` to every peer that had it in range.
    ///
    /// Returns false if the vehicle was not tracked.
    pub fn remove_vehicle(&self, vehicle_id: &VehicleId) -> bool {
        let now_ms = self.ctx.unix_millis();
        let mut events = Vec::new();
        {
            let mut vehicles = self.vehicles.write();
            let Some(removed) = vehicles.remove(vehicle_id) else {
                return false;
            };
            for peer in &removed.nearby {
                if let Some(tracked) = vehicles.get_mut(peer) {
                    tracked.nearby.remove(vehicle_id);
                    let d = removed.snapshot.position.distance_to(&tracked.snapshot.position);
                    events.push(ProximityEvent::membership(
                        ProximityEventKind::Exited,
                        vehicle_id,
                        peer,
                        d,
                        now_ms,
                    ));
                }
            }
        }
        debug!(vehicle = %vehicle_id, peers = events.len(), "removed vehicle from proximity index");
        self.notify(&events);
        true
    }

    /// Removes every vehicle unseen for longer than the purge delay.
    pub fn purge_stale(&self) -> usize {
        let now_ms = self.ctx.unix_millis();
        let max_idle_ms = self.config.purge_delay_secs.saturating_mul(1000);
        let stale: Vec<VehicleId> = self
            .vehicles
            .read()
            .iter()
            .filter(|(_, t)| now_ms.saturating_sub(t.last_seen_ms) > max_idle_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let purged = stale.iter().filter(|id| self.remove_vehicle(id)).count();
        if purged > 0 {
            info!(purged, "purged stale vehicles");
        }
        purged
    }

    fn notify(&self, events: &[ProximityEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn ProximityListener>> =
            self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();

        for event in events {
            for listener in &listeners {
                match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(vehicle = %event.vehicle_id, kind = ?event.kind, error = %e, "proximity listener failed")
                    }
                    Err(_) => {
                        error!(vehicle = %event.vehicle_id, kind = ?event.kind, "proximity listener panicked")
                    }
                }
            }
        }
    }

    pub fn get_nearby_vehicles(&self, vehicle_id: &VehicleId) -> Vec<VehicleId> {
        let mut nearby: Vec<VehicleId> = self
            .vehicles
            .read()
            .get(vehicle_id)
            .map(|t| t.nearby.iter().cloned().collect())
            .unwrap_or_default();
        nearby.sort();
        nearby
    }

    pub fn is_nearby(&self, a: &VehicleId, b: &VehicleId) -> bool {
        self.vehicles
            .read()
            .get(a)
            .map_or(false, |t| t.nearby.contains(b))
    }

    /// Distance in meters, if both vehicles are tracked.
    pub fn distance_between(&self, a: &VehicleId, b: &VehicleId) -> Option<f64> {
        let vehicles = self.vehicles.read();
        let pa = &vehicles.get(a)?.snapshot.position;
        let pb = &vehicles.get(b)?.snapshot.position;
        Some(pa.distance_to(pb))
    }

    pub fn snapshot_of(&self, vehicle_id: &VehicleId) -> Option<SpatialSnapshot> {
        self.vehicles.read().get(vehicle_id).map(|t| t.snapshot.clone())
    }

    pub fn tracked_vehicles(&self) -> Vec<VehicleId> {
        let mut ids: Vec<VehicleId> = self.vehicles.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn communication_statistics(&self) -> CommunicationStatistics {
        let vehicles = self.vehicles.read();
        let links: usize = vehicles.values().map(|t| t.nearby.len()).sum();
        CommunicationStatistics {
            total_vehicles: vehicles.len(),
            active_connections: links / 2,
            max_range_m: self.config.max_range_m,
            min_range_m: self.config.min_range_m,
            update_interval_ms: self.config.update_interval_ms,
            purge_delay_secs: self.config.purge_delay_secs,
            monitoring: self.is_monitoring(),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Starts the periodic purge sweep. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let index: Weak<Self> = Arc::downgrade(self);
        let ctx = Arc::clone(&self.ctx);
        let interval = Duration::from_millis(self.config.update_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ctx.sleep(interval) => {}
                }
                match index.upgrade() {
                    Some(index) => {
                        index.purge_stale();
                    }
                    None => break,
                }
            }
            debug!("proximity monitor stopped");
        });

        *monitor = Some(Monitor { shutdown_tx, handle });
        info!(interval_ms = interval.as_millis() as u64, "proximity monitoring started");
    }

    /// Stops the sweep and waits for it to finish. No-op if not running.
    pub async fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().take();
        let Some(monitor) = monitor else {
            return;
        };
        let _ = monitor.shutdown_tx.send(true);
        if let Err(e) = monitor.handle.await {
            error!(error = %e, "proximity monitor task failed");
        }
        info!("proximity monitoring stopped");
    }
}
