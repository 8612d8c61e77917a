//! The per-vehicle protocol engine.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start()--> Running --stop()--> Idle
//! ```
//!
//! While running the engine owns four loops:
//!
//! - **dispatch**: drains the inbound queue (FIFO), runs handlers, acknowledges
//! - **broadcast**: sends the current spatial snapshot every 100 ms
//! - **heartbeat**: sends a low-priority heartbeat every second
//! - **cleanup**: evicts old dedup entries and stale ack trackers every 30 s
//!
//! Every loop selects on the engine's `watch` shutdown signal at its
//! suspension point; `stop()` signals and then awaits all four before
//! returning. Receives blocked on a full inbound queue give up on the same
//! signal.

use crate::message::{MessageId, MessageType, Payload, V2vMessage};
use crate::proximity::{ListenerId, ProximityEvent, ProximityEventKind, ProximityIndex};
use crate::security::{EncryptedEnvelope, SecurityError, SecurityManager};
use crate::spatial::{MessagePriority, SpatialSnapshot};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use v2v_env::{EnvError, Transport, V2vContext, VehicleId, WireFrame};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Protocol engine for {0} is not running")]
    NotRunning(VehicleId),

    #[error("Duplicate message {0}")]
    Duplicate(MessageId),

    #[error("Snapshot for {snapshot} pushed into the engine of {engine}")]
    ForeignSnapshot { engine: VehicleId, snapshot: VehicleId },

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Transport(#[from] EnvError),
}

/// Protocol engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub broadcast_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub cleanup_interval_secs: u64,

    /// Dedup cache entries older than this are evicted
    pub dedup_retention_secs: u64,

    /// Pending-ack trackers older than this are dropped
    pub ack_timeout_secs: u64,

    /// TTL of messages the engine originates itself
    pub default_ttl_secs: u64,

    pub inbound_queue_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 100,
            heartbeat_interval_ms: 1_000,
            cleanup_interval_secs: 30,
            dedup_retention_secs: 300,
            ack_timeout_secs: 30,
            default_ttl_secs: crate::message::DEFAULT_TTL_SECS,
            inbound_queue_capacity: 1024,
        }
    }
}

/// What travels inside `WireFrame::payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum Frame {
    Sealed(EncryptedEnvelope),
    Plain(V2vMessage),
}

/// Application callback for one message type.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &V2vMessage) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&V2vMessage) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, message: &V2vMessage) -> anyhow::Result<()> {
        self(message)
    }
}

/// Handle returned by `register_message_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Per-engine message counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStats {
    /// Successful per-target deliveries
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub encryption_errors: u64,
    pub decryption_errors: u64,
    pub authentication_failures: u64,
    pub duplicates_suppressed: u64,
    pub last_activity_ms: Option<u64>,
}

/// Read-only snapshot for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStatistics {
    pub vehicle_id: VehicleId,
    pub running: bool,
    pub message_stats: MessageStats,
    pub routing_table_size: usize,
    pub message_cache_size: usize,
    pub pending_acks: usize,
}

struct Running {
    handles: Vec<JoinHandle<()>>,
    listener_id: ListenerId,
}

type HandlerTable = HashMap<MessageType, Vec<(HandlerId, Arc<dyn MessageHandler>)>>;

struct EngineInner<Ctx: V2vContext, Net: Transport> {
    vehicle_id: VehicleId,
    ctx: Arc<Ctx>,
    transport: Arc<Net>,
    security: Arc<SecurityManager<Ctx>>,
    proximity: Arc<ProximityIndex<Ctx>>,
    config: ProtocolConfig,

    handlers: RwLock<HandlerTable>,
    next_handler_id: AtomicU64,

    /// Liveness hint only; the protocol is single-hop
    routing_table: RwLock<HashSet<VehicleId>>,

    /// message id -> time first seen
    message_cache: Mutex<HashMap<MessageId, u64>>,

    /// message id -> time sent
    pending_acks: Mutex<HashMap<MessageId, u64>>,

    stats: Mutex<MessageStats>,
    current_snapshot: RwLock<Option<SpatialSnapshot>>,
    running: AtomicBool,

    /// `true` while stopped
    shutdown: watch::Sender<bool>,

    inbound_tx: mpsc::Sender<V2vMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<V2vMessage>>,
}

/// One vehicle's V2V protocol engine.
///
/// Generic over the context and transport so the same engine runs against
/// `TokioContext` and a real radio, or the simulation harness.
pub struct ProtocolEngine<Ctx: V2vContext, Net: Transport> {
    inner: Arc<EngineInner<Ctx, Net>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl<Ctx: V2vContext, Net: Transport> ProtocolEngine<Ctx, Net> {
    pub fn new(
        ctx: Arc<Ctx>,
        transport: Arc<Net>,
        security: Arc<SecurityManager<Ctx>>,
        proximity: Arc<ProximityIndex<Ctx>>,
        config: ProtocolConfig,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(true);
        let inner = EngineInner {
            vehicle_id: transport.local_id().clone(),
            ctx,
            transport,
            security,
            proximity,
            config,
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            routing_table: RwLock::new(HashSet::new()),
            message_cache: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            stats: Mutex::new(MessageStats::default()),
            current_snapshot: RwLock::new(None),
            running: AtomicBool::new(false),
            shutdown,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        };
        Self {
            inner: Arc::new(inner),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn vehicle_id(&self) -> &VehicleId {
        &self.inner.vehicle_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawns the four loops and subscribes to proximity events.
    /// No-op if already running.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return;
        }

        let listener_id = self.inner.proximity.subscribe(Arc::new(RoutingListener {
            engine: Arc::downgrade(&self.inner),
        }));

        self.inner.shutdown.send_replace(false);
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = &self.inner;
        let handles = vec![
            tokio::spawn(Arc::clone(inner).dispatch_loop(inner.shutdown.subscribe())),
            tokio::spawn(Arc::clone(inner).broadcast_loop(inner.shutdown.subscribe())),
            tokio::spawn(Arc::clone(inner).heartbeat_loop(inner.shutdown.subscribe())),
            tokio::spawn(Arc::clone(inner).cleanup_loop(inner.shutdown.subscribe())),
        ];

        *lifecycle = Some(Running {
            handles,
            listener_id,
        });
        info!(vehicle = %self.inner.vehicle_id, "V2V protocol started");
    }

    /// Cancels all loops and waits for them to finish. No-op if idle.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!(vehicle = %self.inner.vehicle_id, error = %e, "protocol loop failed");
            }
        }
        self.inner.proximity.unsubscribe(running.listener_id);
        info!(vehicle = %self.inner.vehicle_id, "V2V protocol stopped");
    }

    pub fn register_message_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .entry(message_type)
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns false if no such handler was registered.
    pub fn unregister_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// A message from this vehicle with the configured default TTL.
    pub fn new_message(&self, message_type: MessageType, payload: Payload) -> V2vMessage {
        V2vMessage::new(
            self.inner.ctx.as_ref(),
            message_type,
            self.inner.vehicle_id.clone(),
            payload,
        )
        .with_ttl(self.inner.config.default_ttl_secs)
    }

    /// Sends to `target`, else `message.receiver_id`, else every nearby peer.
    ///
    /// Returns `Ok(false)` when the message was dropped (expired, or no
    /// target in range accepted it).
    pub async fn send_message(
        &self,
        message: V2vMessage,
        target: Option<&VehicleId>,
    ) -> Result<bool, ProtocolError> {
        self.inner.send(message, target).await
    }

    /// Decodes a transport frame and hands it to the receive path.
    pub async fn receive_frame(&self, frame: WireFrame) -> Result<MessageId, ProtocolError> {
        self.inner.ensure_running()?;
        let decoded: Frame = serde_json::from_slice(&frame.payload).map_err(|e| {
            self.inner.stats.lock().decryption_errors += 1;
            ProtocolError::Codec(e.to_string())
        })?;
        match decoded {
            Frame::Sealed(envelope) => self.receive_message(envelope).await,
            Frame::Plain(message) => {
                let message = self.inner.check_plain(&frame.sender, message)?;
                self.inner.accept(message).await
            }
        }
    }

    /// Verifies, decrypts and enqueues an envelope for dispatch.
    ///
    /// Duplicates come back as `ProtocolError::Duplicate` and are not
    /// counted as errors.
    pub async fn receive_message(
        &self,
        envelope: EncryptedEnvelope,
    ) -> Result<MessageId, ProtocolError> {
        self.inner.ensure_running()?;
        let message = self.inner.open(&envelope)?;
        self.inner.accept(message).await
    }

    /// Stores the latest sensor snapshot for this vehicle and updates the
    /// proximity index.
    pub fn update_spatial_snapshot(&self, snapshot: SpatialSnapshot) -> Result<(), ProtocolError> {
        if snapshot.vehicle_id != self.inner.vehicle_id {
            return Err(ProtocolError::ForeignSnapshot {
                engine: self.inner.vehicle_id.clone(),
                snapshot: snapshot.vehicle_id,
            });
        }
        *self.inner.current_snapshot.write() = Some(snapshot.clone());
        self.inner.proximity.update_position(snapshot);
        Ok(())
    }

    pub fn current_snapshot(&self) -> Option<SpatialSnapshot> {
        self.inner.current_snapshot.read().clone()
    }

    pub fn routing_table(&self) -> Vec<VehicleId> {
        let mut peers: Vec<VehicleId> = self.inner.routing_table.read().iter().cloned().collect();
        peers.sort();
        peers
    }

    pub fn get_statistics(&self) -> ProtocolStatistics {
        ProtocolStatistics {
            vehicle_id: self.inner.vehicle_id.clone(),
            running: self.is_running(),
            message_stats: self.inner.stats.lock().clone(),
            routing_table_size: self.inner.routing_table.read().len(),
            message_cache_size: self.inner.message_cache.lock().len(),
            pending_acks: self.inner.pending_acks.lock().len(),
        }
    }
}

/// Keeps the routing table in step with the proximity index.
struct RoutingListener<Ctx: V2vContext, Net: Transport> {
    engine: Weak<EngineInner<Ctx, Net>>,
}

impl<Ctx: V2vContext, Net: Transport> crate::proximity::ProximityListener
    for RoutingListener<Ctx, Net>
{
    fn on_event(&self, event: &ProximityEvent) -> anyhow::Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        if !event.is_observed_by(&engine.vehicle_id) {
            return Ok(());
        }
        if event.kind == ProximityEventKind::Moved {
            return Ok(());
        }

        // Events may arrive out of order; the index is authoritative.
        let mut table = engine.routing_table.write();
        let in_range = engine.proximity.is_nearby(&engine.vehicle_id, &event.vehicle_id);
        if in_range {
            table.insert(event.vehicle_id.clone());
        } else {
            table.remove(&event.vehicle_id);
        }
        debug!(vehicle = %engine.vehicle_id, peer = %event.vehicle_id, kind = ?event.kind, in_range, "routing table updated");
        Ok(())
    }
}

impl<Ctx: V2vContext, Net: Transport> EngineInner<Ctx, Net> {
    fn ensure_running(&self) -> Result<(), ProtocolError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::NotRunning(self.vehicle_id.clone()))
        }
    }

    async fn send(
        &self,
        message: V2vMessage,
        target: Option<&VehicleId>,
    ) -> Result<bool, ProtocolError> {
        self.ensure_running()?;

        let now_ms = self.ctx.unix_millis();
        if message.is_expired(now_ms) {
            debug!(vehicle = %self.vehicle_id, message = %message.message_id, "dropping expired outbound message");
            self.stats.lock().messages_dropped += 1;
            return Ok(false);
        }
        self.message_cache.lock().insert(message.message_id, now_ms);

        let targets: Vec<VehicleId> = match target.or(message.receiver_id.as_ref()) {
            Some(t) => vec![t.clone()],
            None => self.proximity.get_nearby_vehicles(&self.vehicle_id),
        };

        let mut delivered = 0u64;
        for target in targets.iter().filter(|t| **t != self.vehicle_id) {
            if !self.proximity.is_nearby(&self.vehicle_id, target) {
                debug!(vehicle = %self.vehicle_id, target = %target, "target out of range");
                continue;
            }
            let frame = match self.seal(&message, target, now_ms) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(vehicle = %self.vehicle_id, target = %target, error = %e, "failed to seal message");
                    self.stats.lock().encryption_errors += 1;
                    continue;
                }
            };
            match self.transport.deliver(target, frame).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(vehicle = %self.vehicle_id, target = %target, error = %e, "delivery failed"),
            }
        }

        {
            let mut stats = self.stats.lock();
            if delivered > 0 {
                stats.messages_sent += delivered;
                stats.last_activity_ms = Some(now_ms);
            } else {
                stats.messages_dropped += 1;
            }
        }
        if delivered > 0 && message.message_type != MessageType::Acknowledgment {
            self.pending_acks.lock().insert(message.message_id, now_ms);
        }
        Ok(delivered > 0)
    }

    fn seal(
        &self,
        message: &V2vMessage,
        target: &VehicleId,
        now_ms: u64,
    ) -> Result<WireFrame, ProtocolError> {
        let frame = if message.encrypted {
            Frame::Sealed(self.security.encrypt_message(
                message,
                &self.vehicle_id,
                target,
                message.message_type,
                message.priority,
            )?)
        } else {
            Frame::Plain(message.clone())
        };
        let payload = serde_json::to_vec(&frame).map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(WireFrame::new(self.vehicle_id.clone(), payload, now_ms))
    }

    /// Decrypts an envelope, counting failures.
    fn open(&self, envelope: &EncryptedEnvelope) -> Result<V2vMessage, ProtocolError> {
        let result = self
            .security
            .decrypt_message::<V2vMessage>(envelope, &self.vehicle_id)
            .and_then(|message| {
                if message.sender_id == envelope.sender_id {
                    Ok(message)
                } else {
                    Err(SecurityError::Authorization {
                        vehicle_id: envelope.sender_id.clone(),
                        reason: format!("envelope carries a message from {}", message.sender_id),
                    })
                }
            });

        result.map_err(|e| {
            let mut stats = self.stats.lock();
            if e.is_authentication_failure() {
                stats.authentication_failures += 1;
            } else {
                stats.decryption_errors += 1;
            }
            warn!(vehicle = %self.vehicle_id, sender = %envelope.sender_id, error = %e, "rejected envelope");
            e.into()
        })
    }

    /// Clear-text messages carry no signature: the sender must match the
    /// frame's source and still be authorized.
    fn check_plain(
        &self,
        source: &VehicleId,
        message: V2vMessage,
    ) -> Result<V2vMessage, ProtocolError> {
        let verdict = if *source != message.sender_id {
            Err(SecurityError::Authorization {
                vehicle_id: source.clone(),
                reason: format!("frame carries a message from {}", message.sender_id),
            })
        } else {
            self.security.authorize(&message.sender_id).map(|_| ())
        };

        match verdict {
            Ok(()) => Ok(message),
            Err(e) => {
                self.stats.lock().authentication_failures += 1;
                warn!(vehicle = %self.vehicle_id, sender = %source, error = %e, "rejected plain message");
                Err(e.into())
            }
        }
    }

    /// Dedups, records and enqueues a received message.
    async fn accept(&self, message: V2vMessage) -> Result<MessageId, ProtocolError> {
        let now_ms = self.ctx.unix_millis();
        let id = message.message_id;
        {
            let mut cache = self.message_cache.lock();
            if cache.contains_key(&id) {
                drop(cache);
                self.stats.lock().duplicates_suppressed += 1;
                debug!(vehicle = %self.vehicle_id, message = %id, "duplicate message suppressed");
                return Err(ProtocolError::Duplicate(id));
            }
            cache.insert(id, now_ms);
        }

        if let Some(original) = message.acknowledged_id() {
            self.pending_acks.lock().remove(&original);
        }
        {
            let mut stats = self.stats.lock();
            stats.messages_received += 1;
            stats.last_activity_ms = Some(now_ms);
        }

        let mut stopping = self.shutdown.subscribe();
        tokio::select! {
            biased;
            sent = self.inbound_tx.send(message) => {
                sent.map_err(|_| ProtocolError::NotRunning(self.vehicle_id.clone()))?;
            }
            _ = async { let _ = stopping.wait_for(|stopped| *stopped).await; } => {
                self.stats.lock().messages_dropped += 1;
                debug!(vehicle = %self.vehicle_id, message = %id, "engine stopped while inbound queue was full");
                return Err(ProtocolError::NotRunning(self.vehicle_id.clone()));
            }
        }
        Ok(id)
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut inbound = self.inbound_rx.lock().await;
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = inbound.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.dispatch(message).await;
        }
        debug!(vehicle = %self.vehicle_id, "dispatch loop stopped");
    }

    async fn dispatch(&self, message: V2vMessage) {
        if message.is_expired(self.ctx.unix_millis()) {
            debug!(vehicle = %self.vehicle_id, message = %message.message_id, "dropping expired inbound message");
            self.stats.lock().messages_dropped += 1;
            return;
        }

        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .get(&message.message_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(vehicle = %self.vehicle_id, message_type = ?message.message_type, error = %e, "message handler failed")
                }
                Err(_) => {
                    error!(vehicle = %self.vehicle_id, message_type = ?message.message_type, "message handler panicked")
                }
            }
        }

        if message.message_type != MessageType::Acknowledgment {
            self.acknowledge(&message).await;
        }
    }

    async fn acknowledge(&self, original: &V2vMessage) {
        let ack = V2vMessage::new(
            self.ctx.as_ref(),
            MessageType::Acknowledgment,
            self.vehicle_id.clone(),
            Payload::Acknowledgment {
                original_message_id: original.message_id,
            },
        )
        .with_receiver(original.sender_id.clone())
        .with_priority(MessagePriority::Low)
        .with_ttl(self.config.default_ttl_secs);

        if let Err(e) = self.send(ack, Some(&original.sender_id)).await {
            debug!(vehicle = %self.vehicle_id, error = %e, "acknowledgment not sent");
        }
    }

    /// Sleeps for `period` unless shutdown is signalled first.
    /// Returns false on shutdown.
    async fn tick(&self, shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = self.ctx.sleep(period) => true,
        }
    }

    async fn broadcast_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.broadcast_interval_ms.max(1));
        while self.tick(&mut shutdown, period).await {
            let Some(snapshot) = self.current_snapshot.read().clone() else {
                continue;
            };
            let message = V2vMessage::new(
                self.ctx.as_ref(),
                MessageType::SpatialData,
                self.vehicle_id.clone(),
                Payload::Spatial(snapshot.clone()),
            )
            .with_priority(snapshot.priority())
            .with_ttl(self.config.default_ttl_secs);

            if let Err(e) = self.send(message, None).await {
                debug!(vehicle = %self.vehicle_id, error = %e, "spatial broadcast failed");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        while self.tick(&mut shutdown, period).await {
            let sent_at_ms = self.ctx.unix_millis();
            let message = V2vMessage::new(
                self.ctx.as_ref(),
                MessageType::Heartbeat,
                self.vehicle_id.clone(),
                Payload::Heartbeat { sent_at_ms },
            )
            .with_priority(MessagePriority::Low)
            .with_ttl(self.config.default_ttl_secs);

            if let Err(e) = self.send(message, None).await {
                debug!(vehicle = %self.vehicle_id, error = %e, "heartbeat failed");
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        while self.tick(&mut shutdown, period).await {
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        let now_ms = self.ctx.unix_millis();
        let retention_ms = self.config.dedup_retention_secs.saturating_mul(1000);
        let ack_timeout_ms = self.config.ack_timeout_secs.saturating_mul(1000);

        let evicted = {
            let mut cache = self.message_cache.lock();
            let before = cache.len();
            cache.retain(|_, seen| now_ms.saturating_sub(*seen) <= retention_ms);
            before - cache.len()
        };
        let timed_out = {
            let mut acks = self.pending_acks.lock();
            let before = acks.len();
            acks.retain(|_, sent| now_ms.saturating_sub(*sent) <= ack_timeout_ms);
            before - acks.len()
        };
        if evicted > 0 || timed_out > 0 {
            debug!(vehicle = %self.vehicle_id, evicted, timed_out, "protocol cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Acceleration, Position, Velocity};
    use crate::identity::VehicleIdentity;
    use crate::proximity::ProximityConfig;
    use crate::security::SecurityConfig;
    use crate::spatial::VehicleState;
    use crate::test_support::ManualContext;
    use async_trait::async_trait;

    /// Records every frame instead of delivering it.
    struct RecordingTransport {
        local_id: VehicleId,
        sent: Mutex<Vec<(VehicleId, WireFrame)>>,
    }

    impl RecordingTransport {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                local_id: VehicleId::new(id),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(VehicleId, WireFrame)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(&self, target: &VehicleId, frame: WireFrame) -> Result<(), EnvError> {
            self.sent.lock().push((target.clone(), frame));
            Ok(())
        }

        fn local_id(&self) -> &VehicleId {
            &self.local_id
        }
    }

    type Engine = ProtocolEngine<ManualContext, RecordingTransport>;

    struct Pair {
        ctx: Arc<ManualContext>,
        security: Arc<SecurityManager<ManualContext>>,
        a: Engine,
        b: Engine,
        net_a: Arc<RecordingTransport>,
        net_b: Arc<RecordingTransport>,
    }

    fn quiet_config() -> ProtocolConfig {
        ProtocolConfig {
            broadcast_interval_ms: 3_600_000,
            heartbeat_interval_ms: 3_600_000,
            cleanup_interval_secs: 3_600,
            ..Default::default()
        }
    }

    fn snapshot(id: &str, lat: f64, lon: f64) -> SpatialSnapshot {
        SpatialSnapshot::new(
            VehicleId::new(id),
            Position::new(lat, lon),
            Velocity::new(13.0, 90.0),
            Acceleration::default(),
            VehicleState::Moving,
            0,
        )
    }

    fn id(name: &str) -> VehicleId {
        VehicleId::new(name)
    }

    async fn pair(config: ProtocolConfig) -> Pair {
        let ctx = ManualContext::new(11);
        let security = Arc::new(SecurityManager::new(
            Arc::clone(&ctx),
            SecurityConfig {
                kdf_iterations: 1_000,
                ..Default::default()
            },
        ));
        let proximity = Arc::new(ProximityIndex::new(Arc::clone(&ctx), ProximityConfig::default()));
        for name in ["a", "b"] {
            security
                .register_vehicle(VehicleIdentity::new(id(name), ctx.unix_millis()))
                .unwrap();
        }

        let net_a = RecordingTransport::new("a");
        let net_b = RecordingTransport::new("b");
        let a = ProtocolEngine::new(
            Arc::clone(&ctx),
            Arc::clone(&net_a),
            Arc::clone(&security),
            Arc::clone(&proximity),
            config.clone(),
        );
        let b = ProtocolEngine::new(
            Arc::clone(&ctx),
            Arc::clone(&net_b),
            Arc::clone(&security),
            Arc::clone(&proximity),
            config,
        );
        a.start().await;
        b.start().await;
        a.update_spatial_snapshot(snapshot("a", 37.7749, -122.4194)).unwrap();
        b.update_spatial_snapshot(snapshot("b", 37.7759, -122.4184)).unwrap();

        Pair {
            ctx,
            security,
            a,
            b,
            net_a,
            net_b,
        }
    }

    fn recorder(engine: &Engine, message_type: MessageType) -> Arc<Mutex<Vec<V2vMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.register_message_handler(
            message_type,
            Arc::new(move |m: &V2vMessage| -> anyhow::Result<()> {
                sink.lock().push(m.clone());
                Ok(())
            }),
        );
        seen
    }

    fn custom(engine: &Engine, value: serde_json::Value) -> V2vMessage {
        engine.new_message(MessageType::CollisionWarning, Payload::Custom(value))
    }

    /// Lets spawned loops drain their queues.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_start_fails_fast() {
        let ctx = ManualContext::new(1);
        let security = Arc::new(SecurityManager::new(Arc::clone(&ctx), SecurityConfig::default()));
        let proximity = Arc::new(ProximityIndex::new(Arc::clone(&ctx), ProximityConfig::default()));
        let engine = ProtocolEngine::new(
            Arc::clone(&ctx),
            RecordingTransport::new("a"),
            security,
            proximity,
            quiet_config(),
        );

        let message = engine.new_message(MessageType::Heartbeat, Payload::Heartbeat { sent_at_ms: 0 });
        assert!(matches!(
            engine.send_message(message, None).await,
            Err(ProtocolError::NotRunning(_))
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let p = pair(quiet_config()).await;
        p.a.start().await;
        assert!(p.a.is_running());

        p.a.stop().await;
        p.a.stop().await;
        assert!(!p.a.is_running());
        assert!(!p.a.get_statistics().running);

        let frame = WireFrame::new(id("b"), b"{}".to_vec(), 0);
        assert!(matches!(
            p.a.receive_frame(frame).await,
            Err(ProtocolError::NotRunning(_))
        ));

        // Restart picks the inbound queue back up
        p.a.start().await;
        let seen = recorder(&p.a, MessageType::CollisionWarning);
        p.b.send_message(custom(&p.b, serde_json::json!({"n": 1})), Some(&id("a"))).await.unwrap();
        for (_, frame) in p.net_b.take() {
            p.a.receive_frame(frame).await.unwrap();
        }
        settle().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_round_trip_and_acknowledgment() {
        let p = pair(quiet_config()).await;
        let seen = recorder(&p.b, MessageType::CollisionWarning);

        let message = custom(&p.a, serde_json::json!({"risk": 0.8}));
        let message_id = message.message_id;
        assert!(p.a.send_message(message, Some(&id("b"))).await.unwrap());
        assert_eq!(p.a.get_statistics().pending_acks, 1);

        let frames = p.net_a.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, id("b"));
        let decoded: Frame = serde_json::from_slice(&frames[0].1.payload).unwrap();
        assert!(matches!(decoded, Frame::Sealed(_)));

        let accepted = p.b.receive_frame(frames[0].1.clone()).await.unwrap();
        assert_eq!(accepted, message_id);
        settle().await;

        let received = seen.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, Payload::Custom(serde_json::json!({"risk": 0.8})));
        assert_eq!(received[0].sender_id, id("a"));

        // B acknowledged; delivering the ack clears A's tracker
        let acks = p.net_b.take();
        assert_eq!(acks.len(), 1);
        p.a.receive_frame(acks[0].1.clone()).await.unwrap();
        settle().await;
        assert_eq!(p.a.get_statistics().pending_acks, 0);
        assert!(p.net_a.take().is_empty(), "acks are never acknowledged");

        let stats = p.b.get_statistics().message_stats;
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_is_dispatched_once() {
        let p = pair(quiet_config()).await;
        let seen = recorder(&p.b, MessageType::CollisionWarning);

        let message = custom(&p.a, serde_json::json!("once"));
        p.a.send_message(message.clone(), Some(&id("b"))).await.unwrap();
        p.a.send_message(message, Some(&id("b"))).await.unwrap();

        let frames = p.net_a.take();
        assert_eq!(frames.len(), 2);
        p.b.receive_frame(frames[0].1.clone()).await.unwrap();
        assert!(matches!(
            p.b.receive_frame(frames[1].1.clone()).await,
            Err(ProtocolError::Duplicate(_))
        ));
        settle().await;

        assert_eq!(seen.lock().len(), 1);
        let stats = p.b.get_statistics().message_stats;
        assert_eq!(stats.duplicates_suppressed, 1);
        assert_eq!(stats.decryption_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_dropped_on_send() {
        let p = pair(quiet_config()).await;
        let now = p.ctx.unix_millis();
        let mut message = custom(&p.a, serde_json::json!(null)).with_ttl(5);
        message.timestamp_ms = now - 10_000;

        assert!(!p.a.send_message(message, Some(&id("b"))).await.unwrap());
        assert!(p.net_a.take().is_empty());
        assert_eq!(p.a.get_statistics().message_stats.messages_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_dropped_on_dispatch() {
        let p = pair(quiet_config()).await;
        let seen = recorder(&p.b, MessageType::CollisionWarning);

        let mut message = custom(&p.a, serde_json::json!(null)).with_ttl(5).unencrypted();
        message.timestamp_ms = p.ctx.unix_millis() - 10_000;
        let payload = serde_json::to_vec(&Frame::Plain(message)).unwrap();

        p.b.receive_frame(WireFrame::new(id("a"), payload, 0)).await.unwrap();
        settle().await;

        assert!(seen.lock().is_empty());
        assert!(p.net_b.take().is_empty(), "expired messages are not acknowledged");
        assert_eq!(p.b.get_statistics().message_stats.messages_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_messages_are_accepted() {
        let p = pair(quiet_config()).await;
        let seen = recorder(&p.b, MessageType::LaneChangeRequest);

        let message = p
            .a
            .new_message(MessageType::LaneChangeRequest, Payload::Custom(serde_json::json!({"lane": 2})))
            .unencrypted();
        p.a.send_message(message, Some(&id("b"))).await.unwrap();

        let frames = p.net_a.take();
        let decoded: Frame = serde_json::from_slice(&frames[0].1.payload).unwrap();
        assert!(matches!(decoded, Frame::Plain(_)));

        p.b.receive_frame(frames[0].1.clone()).await.unwrap();
        settle().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_skips_out_of_range_and_self() {
        let p = pair(quiet_config()).await;

        let ghost = custom(&p.a, serde_json::json!(1));
        assert!(!p.a.send_message(ghost, Some(&id("ghost"))).await.unwrap());
        let to_self = custom(&p.a, serde_json::json!(2));
        assert!(!p.a.send_message(to_self, Some(&id("a"))).await.unwrap());

        let broadcast = custom(&p.a, serde_json::json!(3));
        assert!(p.a.send_message(broadcast, None).await.unwrap());

        let frames = p.net_a.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, id("b"));
        let stats = p.a.get_statistics().message_stats;
        assert_eq!(stats.messages_dropped, 2);
        assert_eq!(stats.messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_sender_counts_authentication_failure() {
        let p = pair(quiet_config()).await;
        p.a.send_message(custom(&p.a, serde_json::json!(1)), Some(&id("b"))).await.unwrap();
        let frames = p.net_a.take();

        p.security.revoke_vehicle(&id("a"));
        let result = p.b.receive_frame(frames[0].1.clone()).await;
        assert!(matches!(
            result,
            Err(ProtocolError::Security(SecurityError::Authorization { .. }))
        ));

        // Revoked senders cannot originate encrypted traffic either
        p.a.send_message(custom(&p.a, serde_json::json!(2)), Some(&id("b"))).await.unwrap();
        assert_eq!(p.a.get_statistics().message_stats.encryption_errors, 1);

        let stats = p.b.get_statistics().message_stats;
        assert_eq!(stats.authentication_failures, 1);
        assert_eq!(stats.messages_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_frame_is_a_counted_error() {
        let p = pair(quiet_config()).await;
        let result = p.b.receive_frame(WireFrame::new(id("a"), b"not json".to_vec(), 0)).await;

        assert!(matches!(result, Err(ProtocolError::Codec(_))));
        assert_eq!(p.b.get_statistics().message_stats.decryption_errors, 1);
        assert!(p.b.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handlers_do_not_stop_dispatch() {
        let p = pair(quiet_config()).await;
        p.b.register_message_handler(
            MessageType::CollisionWarning,
            Arc::new(|_: &V2vMessage| -> anyhow::Result<()> { anyhow::bail!("handler error") }),
        );
        let panicking = p.b.register_message_handler(
            MessageType::CollisionWarning,
            Arc::new(|_: &V2vMessage| -> anyhow::Result<()> { panic!("handler panic") }),
        );
        let seen = recorder(&p.b, MessageType::CollisionWarning);

        for n in 0..3 {
            p.a.send_message(custom(&p.a, serde_json::json!(n)), Some(&id("b"))).await.unwrap();
        }
        for (_, frame) in p.net_a.take() {
            p.b.receive_frame(frame).await.unwrap();
        }
        settle().await;

        let order: Vec<Payload> = seen.lock().iter().map(|m| m.payload.clone()).collect();
        assert_eq!(
            order,
            (0..3).map(|n| Payload::Custom(serde_json::json!(n))).collect::<Vec<_>>()
        );
        assert!(p.b.unregister_message_handler(panicking));
        assert!(!p.b.unregister_message_handler(panicking));
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_table_follows_proximity() {
        let p = pair(quiet_config()).await;
        assert_eq!(p.a.routing_table(), vec![id("b")]);
        assert_eq!(p.b.routing_table(), vec![id("a")]);

        // B drives ~11 km away
        p.b.update_spatial_snapshot(snapshot("b", 37.8759, -122.4184)).unwrap();
        assert!(p.a.routing_table().is_empty());
        assert!(p.b.routing_table().is_empty());

        p.a.stop().await;
        p.b.update_spatial_snapshot(snapshot("b", 37.7759, -122.4184)).unwrap();
        assert!(p.a.routing_table().is_empty(), "stopped engines are unsubscribed");
        assert_eq!(p.b.routing_table(), vec![id("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_table_survives_reentrant_updates() {
        let ctx = ManualContext::new(13);
        let security = Arc::new(SecurityManager::new(
            Arc::clone(&ctx),
            SecurityConfig {
                kdf_iterations: 1_000,
                ..Default::default()
            },
        ));
        let proximity = Arc::new(ProximityIndex::new(Arc::clone(&ctx), ProximityConfig::default()));
        security
            .register_vehicle(VehicleIdentity::new(id("a"), ctx.unix_millis()))
            .unwrap();

        // The first time b is seen entering, it is immediately moved away
        let index = Arc::downgrade(&proximity);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        proximity.subscribe(Arc::new(move |e: &ProximityEvent| -> anyhow::Result<()> {
            if e.kind == ProximityEventKind::Entered
                && e.vehicle_id == id("b")
                && !flag.swap(true, Ordering::SeqCst)
            {
                if let Some(index) = index.upgrade() {
                    index.update_position(snapshot("b", 37.8759, -122.4184));
                }
            }
            Ok(())
        }));

        let a = ProtocolEngine::new(
            Arc::clone(&ctx),
            RecordingTransport::new("a"),
            security,
            Arc::clone(&proximity),
            quiet_config(),
        );
        a.start().await;
        a.update_spatial_snapshot(snapshot("a", 37.7749, -122.4194)).unwrap();
        proximity.update_position(snapshot("b", 37.7759, -122.4184));

        assert!(fired.load(Ordering::SeqCst));
        assert!(proximity.get_nearby_vehicles(&id("a")).is_empty());
        assert!(a.routing_table().is_empty());
        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_frames_require_an_authorized_sender() {
        let p = pair(quiet_config()).await;
        let seen = recorder(&p.b, MessageType::EmergencyBroadcast);
        let plain = |source: &str, sender: &str| {
            let mut message = p
                .a
                .new_message(MessageType::EmergencyBroadcast, Payload::Custom(serde_json::json!({"brake": true})))
                .unencrypted();
            message.sender_id = id(sender);
            WireFrame::new(id(source), serde_json::to_vec(&Frame::Plain(message)).unwrap(), 0)
        };

        // Source address does not match the claimed sender
        assert!(matches!(
            p.b.receive_frame(plain("ghost", "a")).await,
            Err(ProtocolError::Security(SecurityError::Authorization { .. }))
        ));
        // Never registered
        assert!(matches!(
            p.b.receive_frame(plain("ghost", "ghost")).await,
            Err(ProtocolError::Security(SecurityError::Authorization { .. }))
        ));
        // Revoked
        p.security.revoke_vehicle(&id("a"));
        assert!(matches!(
            p.b.receive_frame(plain("a", "a")).await,
            Err(ProtocolError::Security(SecurityError::Authorization { .. }))
        ));
        settle().await;

        assert!(seen.lock().is_empty());
        assert!(p.net_b.take().is_empty(), "rejected messages are not acknowledged");
        let stats = p.b.get_statistics().message_stats;
        assert_eq!(stats.authentication_failures, 3);
        assert_eq!(stats.messages_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_receive_blocked_on_full_queue() {
        let p = pair(ProtocolConfig {
            inbound_queue_capacity: 1,
            ..quiet_config()
        })
        .await;
        let plain = |n: i32| {
            let message = custom(&p.a, serde_json::json!(n)).unencrypted();
            WireFrame::new(id("a"), serde_json::to_vec(&Frame::Plain(message)).unwrap(), 0)
        };

        // Fills the queue; the dispatch loop has not run yet
        p.b.receive_frame(plain(1)).await.unwrap();

        let (blocked, ()) = tokio::join!(p.b.receive_frame(plain(2)), p.b.stop());
        assert!(matches!(blocked, Err(ProtocolError::NotRunning(_))));
        assert!(!p.b.is_running());
        assert_eq!(p.b.get_statistics().message_stats.messages_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_snapshot_is_rejected() {
        let p = pair(quiet_config()).await;
        assert!(matches!(
            p.a.update_spatial_snapshot(snapshot("b", 0.0, 0.0)),
            Err(ProtocolError::ForeignSnapshot { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_cache_and_stale_acks() {
        let p = pair(quiet_config()).await;
        p.a.send_message(custom(&p.a, serde_json::json!(1)), Some(&id("b"))).await.unwrap();
        let stats = p.a.get_statistics();
        assert_eq!(stats.message_cache_size, 1);
        assert_eq!(stats.pending_acks, 1);

        p.ctx.advance(Duration::from_secs(31));
        p.a.inner.cleanup();
        let stats = p.a.get_statistics();
        assert_eq!(stats.message_cache_size, 1);
        assert_eq!(stats.pending_acks, 0);

        p.ctx.advance(Duration::from_secs(270));
        p.a.inner.cleanup();
        assert_eq!(p.a.get_statistics().message_cache_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_broadcast_and_heartbeat() {
        let p = pair(ProtocolConfig::default()).await;
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        p.a.stop().await;
        p.b.stop().await;

        let mut spatial = 0;
        let mut heartbeats = 0;
        for (target, frame) in p.net_a.take() {
            assert_eq!(target, id("b"));
            let Frame::Sealed(envelope) = serde_json::from_slice::<Frame>(&frame.payload).unwrap() else {
                panic!("expected sealed frame");
            };
            match envelope.message_type {
                MessageType::SpatialData => {
                    assert_eq!(envelope.priority, MessagePriority::Normal);
                    spatial += 1;
                }
                MessageType::Heartbeat => {
                    assert_eq!(envelope.priority, MessagePriority::Low);
                    heartbeats += 1;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(spatial >= 9, "spatial broadcasts: {spatial}");
        assert_eq!(heartbeats, 1);

        // Nothing runs after stop
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(p.net_a.take().is_empty());
    }
}
