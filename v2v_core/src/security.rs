//! The security manager: session keys, authenticated encryption, signing
//! and revocation.
//!
//! Session keys are derived deterministically from the (unordered) vehicle
//! pair and a coarse time bucket, so two engines racing on first use derive
//! the same key. This is not a key-agreement protocol: anyone who knows
//! both vehicle ids can compute the key.

use crate::identity::{IdentityError, IdentityManager, VehicleIdentity};
use crate::message::MessageType;
use crate::spatial::MessagePriority;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Verifier};
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use v2v_env::{V2vContext, VehicleId};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Security errors
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Vehicle {vehicle_id} not authorized: {reason}")]
    Authorization { vehicle_id: VehicleId, reason: String },

    #[error("Message expired: age {age_ms}ms exceeds {max_age_ms}ms")]
    ExpiredMessage { age_ms: u64, max_age_ms: u64 },

    #[error("Invalid signature from {0}")]
    SignatureInvalid(VehicleId),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Certificate expired for vehicle {0}")]
    CertificateExpired(VehicleId),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SecurityError {
    fn unauthorized(vehicle_id: &VehicleId, reason: &str) -> Self {
        Self::Authorization {
            vehicle_id: vehicle_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Failures caused by who the peer is rather than by the message bytes.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::Authorization { .. } | Self::SignatureInvalid(_) | Self::CertificateExpired(_)
        )
    }
}

impl From<IdentityError> for SecurityError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::CertificateExpired(id) => Self::CertificateExpired(id),
            IdentityError::MissingKeyPair(id) => Self::unauthorized(&id, "no key pair"),
            IdentityError::CertificateInvalid { vehicle_id, reason } => {
                Self::Authorization { vehicle_id, reason }
            }
            IdentityError::Serialization(msg) => Self::Serialization(msg),
        }
    }
}

/// Security manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Envelopes older than this are rejected
    pub max_message_age_secs: u64,

    /// Session keys older than this are regenerated
    pub max_key_age_secs: u64,

    /// Width of the time bucket fed into key derivation
    pub key_rotation_interval_secs: u64,

    pub kdf_iterations: u32,
    pub kdf_salt: String,

    pub require_timestamp: bool,
    pub require_signature: bool,

    pub encryption_algorithm: String,
    pub signature_algorithm: String,
    pub key_derivation: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_message_age_secs: 300,
            max_key_age_secs: 86_400,
            key_rotation_interval_secs: 3_600,
            kdf_iterations: 100_000,
            kdf_salt: "v2v_salt".to_string(),
            require_timestamp: true,
            require_signature: true,
            encryption_algorithm: "AES-256-GCM".to_string(),
            signature_algorithm: "Ed25519".to_string(),
            key_derivation: "PBKDF2-HMAC-SHA256".to_string(),
        }
    }
}

/// Wire unit exchanged between vehicles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub signature: Vec<u8>,
    pub sender_id: VehicleId,
    pub timestamp_ms: u64,
    pub message_type: MessageType,
    pub priority: MessagePriority,
}

/// The envelope fields covered by the sender's signature.
#[derive(Serialize)]
struct SignedFields<'a> {
    ciphertext: &'a [u8],
    nonce: &'a [u8],
    sender_id: &'a VehicleId,
    timestamp_ms: u64,
    message_type: MessageType,
    priority: MessagePriority,
}

impl<'a> SignedFields<'a> {
    fn of(envelope: &'a EncryptedEnvelope) -> Self {
        Self {
            ciphertext: &envelope.ciphertext,
            nonce: &envelope.nonce,
            sender_id: &envelope.sender_id,
            timestamp_ms: envelope.timestamp_ms,
            message_type: envelope.message_type,
            priority: envelope.priority,
        }
    }

    fn digest(&self) -> Result<[u8; 32], SecurityError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| SecurityError::Serialization(e.to_string()))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(&bytes));
        Ok(digest)
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey {
    key: [u8; 32],
    created_at_ms: u64,
}

/// Unordered vehicle pair, smaller id first.
type PairKey = (VehicleId, VehicleId);

fn pair_key(a: &VehicleId, b: &VehicleId) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Read-only snapshot for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityStatistics {
    pub registered_vehicles: usize,
    pub revoked_vehicles: usize,
    pub active_session_keys: usize,
    pub encryption_algorithm: String,
    pub signature_algorithm: String,
    pub key_derivation: String,
    pub max_message_age_secs: u64,
    pub key_rotation_interval_secs: u64,
}

/// Shared by every vehicle's engine.
pub struct SecurityManager<Ctx: V2vContext> {
    ctx: Arc<Ctx>,
    config: SecurityConfig,
    identities: IdentityManager,
    session_keys: Mutex<HashMap<PairKey, SessionKey>>,
}

impl<Ctx: V2vContext> SecurityManager<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: SecurityConfig) -> Self {
        Self {
            ctx,
            config,
            identities: IdentityManager::new(),
            session_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn identities(&self) -> &IdentityManager {
        &self.identities
    }

    /// Stores the identity, issuing a certificate if it has none.
    ///
    /// Re-registering a vehicle id replaces the stored identity. Existing
    /// session keys and revocation status are untouched.
    pub fn register_vehicle(
        &self,
        identity: VehicleIdentity,
    ) -> Result<Arc<VehicleIdentity>, SecurityError> {
        Ok(self.identities.register(identity, self.ctx.as_ref())?)
    }

    /// Revokes the vehicle and purges every session key it is part of.
    ///
    /// Returns false if the vehicle was never registered.
    pub fn revoke_vehicle(&self, vehicle_id: &VehicleId) -> bool {
        if !self.identities.revoke(vehicle_id) {
            return false;
        }
        let purged = {
            let mut keys = self.session_keys.lock();
            let before = keys.len();
            keys.retain(|(a, b), _| a != vehicle_id && b != vehicle_id);
            before - keys.len()
        };
        info!(vehicle = %vehicle_id, purged_keys = purged, "revoked vehicle");
        true
    }

    pub fn identity(&self, vehicle_id: &VehicleId) -> Option<Arc<VehicleIdentity>> {
        self.identities.get(vehicle_id)
    }

    pub fn is_authorized(&self, vehicle_id: &VehicleId) -> bool {
        self.authorize(vehicle_id).is_ok()
    }

    /// Like `is_authorized`, but says why not.
    pub fn authorize(&self, vehicle_id: &VehicleId) -> Result<Arc<VehicleIdentity>, SecurityError> {
        let identity = self
            .identities
            .get(vehicle_id)
            .ok_or_else(|| SecurityError::unauthorized(vehicle_id, "not registered"))?;
        if self.identities.is_revoked(vehicle_id) {
            return Err(SecurityError::unauthorized(vehicle_id, "revoked"));
        }
        if !identity.is_certificate_valid(self.ctx.unix_millis()) {
            return Err(SecurityError::unauthorized(vehicle_id, "certificate expired"));
        }
        Ok(identity)
    }

    /// Encrypts and signs `payload` for `receiver`.
    pub fn encrypt_message<T: Serialize>(
        &self,
        payload: &T,
        sender: &VehicleId,
        receiver: &VehicleId,
        message_type: MessageType,
        priority: MessagePriority,
    ) -> Result<EncryptedEnvelope, SecurityError> {
        let identity = self.authorize(sender)?;
        let cipher = self.session_cipher(sender, receiver)?;

        let plaintext =
            serde_json::to_vec(payload).map_err(|e| SecurityError::Serialization(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        self.ctx.fill_random(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        let mut envelope = EncryptedEnvelope {
            ciphertext,
            nonce: nonce.to_vec(),
            signature: Vec::new(),
            sender_id: sender.clone(),
            timestamp_ms: self.ctx.unix_millis(),
            message_type,
            priority,
        };
        let digest = SignedFields::of(&envelope).digest()?;
        envelope.signature = identity.sign(&digest)?.to_bytes().to_vec();

        debug!(from = %sender, to = %receiver, ?message_type, bytes = envelope.ciphertext.len(), "sealed envelope");
        Ok(envelope)
    }

    /// Verifies and decrypts an envelope addressed to `receiver`.
    pub fn decrypt_message<T: DeserializeOwned>(
        &self,
        envelope: &EncryptedEnvelope,
        receiver: &VehicleId,
    ) -> Result<T, SecurityError> {
        self.authorize(receiver)?;

        if self.config.require_timestamp {
            let age_ms = self.ctx.unix_millis().saturating_sub(envelope.timestamp_ms);
            let max_age_ms = self.config.max_message_age_secs.saturating_mul(1000);
            if age_ms > max_age_ms {
                return Err(SecurityError::ExpiredMessage { age_ms, max_age_ms });
            }
        }

        let sender = self.authorize(&envelope.sender_id)?;
        if self.config.require_signature {
            self.verify_signature(envelope, &sender)?;
        }

        if envelope.nonce.len() != NONCE_LEN {
            return Err(SecurityError::Decryption(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                envelope.nonce.len()
            )));
        }
        let cipher = self.session_cipher(&envelope.sender_id, receiver)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;

        serde_json::from_slice(&plaintext).map_err(|e| SecurityError::Serialization(e.to_string()))
    }

    fn verify_signature(
        &self,
        envelope: &EncryptedEnvelope,
        sender: &VehicleIdentity,
    ) -> Result<(), SecurityError> {
        let invalid = || SecurityError::SignatureInvalid(envelope.sender_id.clone());

        let public_key = sender
            .certificate()
            .map(|c| c.public_key)
            .ok_or_else(invalid)?;
        let signature = Signature::from_slice(&envelope.signature).map_err(|_| invalid())?;
        let digest = SignedFields::of(envelope).digest()?;

        public_key.verify(&digest, &signature).map_err(|_| {
            warn!(sender = %envelope.sender_id, "signature verification failed");
            invalid()
        })
    }

    /// AEAD cipher for the pair, deriving or regenerating the key as needed.
    fn session_cipher(&self, a: &VehicleId, b: &VehicleId) -> Result<Aes256Gcm, SecurityError> {
        self.authorize(a)?;
        self.authorize(b)?;

        let pair = pair_key(a, b);
        let now_ms = self.ctx.unix_millis();
        let max_age_ms = self.config.max_key_age_secs.saturating_mul(1000);

        {
            let keys = self.session_keys.lock();
            if let Some(existing) = keys.get(&pair) {
                if now_ms.saturating_sub(existing.created_at_ms) <= max_age_ms {
                    return Aes256Gcm::new_from_slice(&existing.key)
                        .map_err(|e| SecurityError::Encryption(e.to_string()));
                }
            }
        }

        // Derive outside the lock (PBKDF2 is slow)
        let key = self.derive_key(&pair, now_ms);
        self.install_key(pair, key, now_ms)
    }

    /// Stores a freshly derived key unless a racing caller already stored a
    /// fresh one, which then wins: its key may already be in use.
    fn install_key(
        &self,
        pair: PairKey,
        key: SessionKey,
        now_ms: u64,
    ) -> Result<Aes256Gcm, SecurityError> {
        let max_age_ms = self.config.max_key_age_secs.saturating_mul(1000);
        let mut keys = self.session_keys.lock();

        let stale = keys
            .get(&pair)
            .map_or(true, |existing| now_ms.saturating_sub(existing.created_at_ms) > max_age_ms);
        if stale {
            debug!(a = %pair.0, b = %pair.1, "derived session key");
            keys.insert(pair.clone(), key);
        }

        let stored = keys
            .get(&pair)
            .ok_or_else(|| SecurityError::Encryption("session key missing".to_string()))?;
        Aes256Gcm::new_from_slice(&stored.key).map_err(|e| SecurityError::Encryption(e.to_string()))
    }

    fn derive_key(&self, (a, b): &PairKey, now_ms: u64) -> SessionKey {
        let bucket = (now_ms / 1000) / self.config.key_rotation_interval_secs.max(1);
        let input = format!("{a}:{b}:{bucket}");

        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            input.as_bytes(),
            self.config.kdf_salt.as_bytes(),
            self.config.kdf_iterations.max(1),
            &mut key,
        );
        SessionKey {
            key,
            created_at_ms: now_ms,
        }
    }

    /// Drops session keys older than `max_key_age`. Returns how many.
    pub fn cleanup_expired_keys(&self) -> usize {
        let now_ms = self.ctx.unix_millis();
        let max_age_ms = self.config.max_key_age_secs.saturating_mul(1000);

        let mut keys = self.session_keys.lock();
        let before = keys.len();
        keys.retain(|_, k| now_ms.saturating_sub(k.created_at_ms) <= max_age_ms);
        let removed = before - keys.len();
        if removed > 0 {
            info!(removed, "cleaned up expired session keys");
        }
        removed
    }

    pub fn session_key_count(&self) -> usize {
        self.session_keys.lock().len()
    }

    pub fn security_statistics(&self) -> SecurityStatistics {
        SecurityStatistics {
            registered_vehicles: self.identities.registered_count(),
            revoked_vehicles: self.identities.revoked_count(),
            active_session_keys: self.session_key_count(),
            encryption_algorithm: self.config.encryption_algorithm.clone(),
            signature_algorithm: self.config.signature_algorithm.clone(),
            key_derivation: self.config.key_derivation.clone(),
            max_message_age_secs: self.config.max_message_age_secs,
            key_rotation_interval_secs: self.config.key_rotation_interval_secs,
        }
    }
}
