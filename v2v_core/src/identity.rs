//! Vehicle identity, key pair and self-signed certificate management.
//!
//! Every vehicle carries an Ed25519 signing key bound to a self-signed
//! certificate. The `IdentityManager` is the registry of known identities
//! plus an independent revocation set; a vehicle is authorized iff it is
//! registered, not revoked and its certificate has not expired.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use v2v_env::{V2vContext, VehicleId};

/// Default certificate lifetime: 365 days.
pub const CERTIFICATE_VALIDITY_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Identity and certificate errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("No key pair for vehicle {0}")]
    MissingKeyPair(VehicleId),

    #[error("Certificate expired for vehicle {0}")]
    CertificateExpired(VehicleId),

    #[error("Invalid certificate for vehicle {vehicle_id}: {reason}")]
    CertificateInvalid { vehicle_id: VehicleId, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Named capability flags advertised by a vehicle.
pub type Capabilities = BTreeMap<String, bool>;

/// Capability set assumed when the manufacturer does not provide one.
pub fn default_capabilities() -> Capabilities {
    [
        "v2v_communication",
        "emergency_broadcast",
        "trajectory_prediction",
        "collision_avoidance",
        "lane_change_coordination",
        "intersection_management",
    ]
    .into_iter()
    .map(|name| (name.to_string(), true))
    .collect()
}

/// Self-signed certificate binding a vehicle to its public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleCertificate {
    pub serial: u64,

    /// `Vehicle-{id}`
    pub subject: String,

    /// Manufacturer
    pub organization: String,

    /// `vehicle-{id}.local`
    pub dns_name: String,

    #[serde(with = "verifying_key_serde")]
    pub public_key: VerifyingKey,

    pub not_before_ms: u64,
    pub not_after_ms: u64,

    /// Ed25519 signature over the to-be-signed fields
    #[serde(with = "signature_serde")]
    pub signature: Signature,
}

/// Certificate fields covered by the self-signature.
#[derive(Serialize)]
struct TbsCertificate<'a> {
    serial: u64,
    subject: &'a str,
    organization: &'a str,
    dns_name: &'a str,
    public_key: [u8; 32],
    not_before_ms: u64,
    not_after_ms: u64,
}

impl TbsCertificate<'_> {
    fn to_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        serde_json::to_vec(self).map_err(|e| IdentityError::Serialization(e.to_string()))
    }
}

impl VehicleCertificate {
    fn tbs(&self) -> TbsCertificate<'_> {
        TbsCertificate {
            serial: self.serial,
            subject: &self.subject,
            organization: &self.organization,
            dns_name: &self.dns_name,
            public_key: self.public_key.to_bytes(),
            not_before_ms: self.not_before_ms,
            not_after_ms: self.not_after_ms,
        }
    }

    /// Checks the signature against the embedded public key.
    pub fn verify_self_signature(&self) -> bool {
        match self.tbs().to_bytes() {
            Ok(bytes) => self.public_key.verify(&bytes, &self.signature).is_ok(),
            Err(_) => false,
        }
    }
}

/// A vehicle's identity and authentication material.
#[derive(Debug, Clone)]
pub struct VehicleIdentity {
    pub vehicle_id: VehicleId,
    pub manufacturer: String,
    pub model: String,
    pub year: u16,

    /// Vehicle Identification Number
    pub vin: String,

    pub capabilities: Capabilities,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,

    signing_key: Option<SigningKey>,
    certificate: Option<VehicleCertificate>,
}

impl VehicleIdentity {
    /// Creates an identity with the default capability set, expiring one
    /// year after `created_at_ms`. No key pair or certificate yet.
    pub fn new(vehicle_id: VehicleId, created_at_ms: u64) -> Self {
        Self {
            vehicle_id,
            manufacturer: String::new(),
            model: String::new(),
            year: 0,
            vin: String::new(),
            capabilities: default_capabilities(),
            created_at_ms,
            expires_at_ms: created_at_ms.saturating_add(CERTIFICATE_VALIDITY_MS),
            signing_key: None,
            certificate: None,
        }
    }

    pub fn with_details(
        mut self,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        year: u16,
        vin: impl Into<String>,
    ) -> Self {
        self.manufacturer = manufacturer.into();
        self.model = model.into();
        self.year = year;
        self.vin = vin.into();
        self
    }

    /// Replaces the capability set; an empty set falls back to the defaults.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        if !capabilities.is_empty() {
            self.capabilities = capabilities;
        }
        self
    }

    pub fn with_expiry(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = expires_at_ms;
        self
    }

    /// Generates the signing key pair.
    pub fn generate_key_pair<C: V2vContext + ?Sized>(&mut self, ctx: &C) {
        let key = ctx.derive_signing_key(self.seed_extension());
        self.signing_key = Some(key);
    }

    /// Issues a self-signed certificate valid until `expires_at_ms`,
    /// generating the key pair first if needed.
    pub fn create_self_signed_certificate<C: V2vContext + ?Sized>(
        &mut self,
        ctx: &C,
    ) -> Result<(), IdentityError> {
        if self.signing_key.is_none() {
            self.generate_key_pair(ctx);
        }
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| IdentityError::MissingKeyPair(self.vehicle_id.clone()))?;

        let mut serial = [0u8; 8];
        ctx.fill_random(&mut serial);

        let subject = format!("Vehicle-{}", self.vehicle_id);
        let dns_name = format!("vehicle-{}.local", self.vehicle_id);
        let public_key = signing_key.verifying_key();
        let not_before_ms = ctx.unix_millis();

        let tbs = TbsCertificate {
            serial: u64::from_le_bytes(serial),
            subject: &subject,
            organization: &self.manufacturer,
            dns_name: &dns_name,
            public_key: public_key.to_bytes(),
            not_before_ms,
            not_after_ms: self.expires_at_ms,
        };
        let signature = signing_key.sign(&tbs.to_bytes()?);

        self.certificate = Some(VehicleCertificate {
            serial: tbs.serial,
            subject,
            organization: self.manufacturer.clone(),
            dns_name,
            public_key,
            not_before_ms,
            not_after_ms: self.expires_at_ms,
            signature,
        });
        Ok(())
    }

    pub fn certificate(&self) -> Option<&VehicleCertificate> {
        self.certificate.as_ref()
    }

    pub fn has_key_pair(&self) -> bool {
        self.signing_key.is_some()
    }

    pub fn public_key(&self) -> Option<VerifyingKey> {
        self.signing_key.as_ref().map(|k| k.verifying_key())
    }

    /// True iff a certificate exists and `now_ms < expires_at_ms`.
    pub fn is_certificate_valid(&self, now_ms: u64) -> bool {
        self.certificate.is_some() && now_ms < self.expires_at_ms
    }

    /// Full certificate check: present, self-signed by our key, unexpired.
    pub fn verify_certificate(&self, now_ms: u64) -> Result<(), IdentityError> {
        let invalid = |reason: &str| IdentityError::CertificateInvalid {
            vehicle_id: self.vehicle_id.clone(),
            reason: reason.to_string(),
        };

        let cert = self.certificate.as_ref().ok_or_else(|| invalid("no certificate"))?;
        if Some(cert.public_key) != self.public_key() {
            return Err(invalid("certificate does not match key pair"));
        }
        if !cert.verify_self_signature() {
            return Err(invalid("bad self-signature"));
        }
        if now_ms >= self.expires_at_ms {
            return Err(IdentityError::CertificateExpired(self.vehicle_id.clone()));
        }
        Ok(())
    }

    /// Signs `message` with the vehicle's private key.
    pub fn sign(&self, message: &[u8]) -> Result<Signature, IdentityError> {
        self.signing_key
            .as_ref()
            .map(|k| k.sign(message))
            .ok_or_else(|| IdentityError::MissingKeyPair(self.vehicle_id.clone()))
    }

    /// Short stable fingerprint for logs (not a security primitive).
    pub fn vehicle_hash(&self) -> String {
        let data = format!(
            "{}:{}:{}:{}",
            self.vehicle_id, self.vin, self.manufacturer, self.model
        );
        let digest = Sha256::digest(data.as_bytes());
        hex::encode(&digest[..8])
    }

    pub fn summary(&self, now_ms: u64) -> IdentitySummary {
        IdentitySummary {
            vehicle_id: self.vehicle_id.clone(),
            vehicle_hash: self.vehicle_hash(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            year: self.year,
            vin: self.vin.clone(),
            capabilities: self.capabilities.clone(),
            created_at_ms: self.created_at_ms,
            expires_at_ms: self.expires_at_ms,
            is_valid: self.is_certificate_valid(now_ms),
        }
    }

    fn seed_extension(&self) -> u64 {
        let digest = Sha256::digest(self.vehicle_id.as_str().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}

/// Serializable public view of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub vehicle_id: VehicleId,
    pub vehicle_hash: String,
    pub manufacturer: String,
    pub model: String,
    pub year: u16,
    pub vin: String,
    pub capabilities: Capabilities,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub is_valid: bool,
}

/// Registry of vehicle identities with an independent revocation set.
#[derive(Default)]
pub struct IdentityManager {
    vehicles: RwLock<HashMap<VehicleId, Arc<VehicleIdentity>>>,
    revoked: RwLock<HashSet<VehicleId>>,
}

impl IdentityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an identity, issuing its certificate if it has none.
    ///
    /// Registering the same vehicle id again replaces the stored identity;
    /// revocation status is kept.
    pub fn register<C: V2vContext + ?Sized>(
        &self,
        mut identity: VehicleIdentity,
        ctx: &C,
    ) -> Result<Arc<VehicleIdentity>, IdentityError> {
        if identity.certificate.is_none() || identity.signing_key.is_none() {
            identity.create_self_signed_certificate(ctx)?;
        }
        identity.verify_certificate(ctx.unix_millis())?;

        let identity = Arc::new(identity);
        self.vehicles
            .write()
            .insert(identity.vehicle_id.clone(), Arc::clone(&identity));
        info!(vehicle = %identity.vehicle_id, hash = %identity.vehicle_hash(), "registered vehicle identity");
        Ok(identity)
    }

    pub fn get(&self, vehicle_id: &VehicleId) -> Option<Arc<VehicleIdentity>> {
        self.vehicles.read().get(vehicle_id).cloned()
    }

    pub fn is_registered(&self, vehicle_id: &VehicleId) -> bool {
        self.vehicles.read().contains_key(vehicle_id)
    }

    /// Revokes a known vehicle. Returns false for unknown ids.
    pub fn revoke(&self, vehicle_id: &VehicleId) -> bool {
        if !self.is_registered(vehicle_id) {
            return false;
        }
        self.revoked.write().insert(vehicle_id.clone());
        true
    }

    pub fn is_revoked(&self, vehicle_id: &VehicleId) -> bool {
        self.revoked.read().contains(vehicle_id)
    }

    /// Registered, not revoked and holding an unexpired certificate.
    pub fn validate(&self, vehicle_id: &VehicleId, now_ms: u64) -> bool {
        match self.get(vehicle_id) {
            Some(identity) => !self.is_revoked(vehicle_id) && identity.is_certificate_valid(now_ms),
            None => false,
        }
    }

    /// Every currently valid vehicle except `except`.
    pub fn authorized_peers(&self, except: &VehicleId, now_ms: u64) -> Vec<VehicleId> {
        let ids: Vec<VehicleId> = self.vehicles.read().keys().cloned().collect();
        ids.into_iter()
            .filter(|id| id != except && self.validate(id, now_ms))
            .collect()
    }

    pub fn registered_count(&self) -> usize {
        self.vehicles.read().len()
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.read().len()
    }
}

mod signature_serde {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(sig: &Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        sig.to_bytes().to_vec().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Expected 64 bytes for signature"))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

mod verifying_key_serde {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: [u8; 32] = Deserialize::deserialize(deserializer)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v2v_env::TokioContext;

    fn test_identity(ctx: &TokioContext) -> VehicleIdentity {
        VehicleIdentity::new(VehicleId::new("test_vehicle_001"), ctx.unix_millis()).with_details(
            "Test Manufacturer",
            "Test Model",
            2024,
            "TESTVIN1234567890",
        )
    }

    #[test]
    fn test_new_identity_has_no_certificate() {
        let ctx = TokioContext::new();
        let identity = test_identity(&ctx);

        assert!(!identity.has_key_pair());
        assert!(!identity.is_certificate_valid(ctx.unix_millis()));
        assert_eq!(identity.capabilities, default_capabilities());
        assert_eq!(identity.expires_at_ms - identity.created_at_ms, CERTIFICATE_VALIDITY_MS);
    }

    #[test]
    fn test_certificate_valid_until_expiry() {
        let ctx = TokioContext::new();
        let mut identity = test_identity(&ctx);
        identity.create_self_signed_certificate(&ctx).unwrap();

        let now = ctx.unix_millis();
        assert!(identity.has_key_pair());
        assert!(identity.is_certificate_valid(now));
        assert!(identity.verify_certificate(now).is_ok());
        assert!(!identity.is_certificate_valid(identity.expires_at_ms));
        assert!(matches!(
            identity.verify_certificate(identity.expires_at_ms),
            Err(IdentityError::CertificateExpired(_))
        ));
    }

    #[test]
    fn test_certificate_names_vehicle() {
        let ctx = TokioContext::new();
        let mut identity = test_identity(&ctx);
        identity.create_self_signed_certificate(&ctx).unwrap();

        let cert = identity.certificate().unwrap();
        assert_eq!(cert.subject, "Vehicle-test_vehicle_001");
        assert_eq!(cert.dns_name, "vehicle-test_vehicle_001.local");
        assert_eq!(cert.organization, "Test Manufacturer");
        assert_eq!(cert.not_after_ms, identity.expires_at_ms);
        assert!(cert.verify_self_signature());
    }

    #[test]
    fn test_tampered_certificate_fails_verification() {
        let ctx = TokioContext::new();
        let mut identity = test_identity(&ctx);
        identity.create_self_signed_certificate(&ctx).unwrap();

        let mut cert = identity.certificate().unwrap().clone();
        cert.not_after_ms += 1;
        assert!(!cert.verify_self_signature());
    }

    #[test]
    fn test_certificate_serde_roundtrip_keeps_signature_valid() {
        let ctx = TokioContext::new();
        let mut identity = test_identity(&ctx);
        identity.create_self_signed_certificate(&ctx).unwrap();

        let json = serde_json::to_string(identity.certificate().unwrap()).unwrap();
        let decoded: VehicleCertificate = serde_json::from_str(&json).unwrap();
        assert!(decoded.verify_self_signature());
    }

    #[test]
    fn test_vehicle_hash_is_stable_hex() {
        let ctx = TokioContext::new();
        let identity = test_identity(&ctx);
        let hash = identity.vehicle_hash();

        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, identity.clone().vehicle_hash());
    }

    #[test]
    fn test_identity_manager_validation_and_revocation() {
        let ctx = TokioContext::new();
        let manager = IdentityManager::new();
        let id = VehicleId::new("test_vehicle_001");

        assert!(!manager.validate(&id, ctx.unix_millis()));
        manager.register(test_identity(&ctx), &ctx).unwrap();
        assert!(manager.validate(&id, ctx.unix_millis()));

        assert!(manager.revoke(&id));
        assert!(manager.is_revoked(&id));
        assert!(!manager.validate(&id, ctx.unix_millis()));
        assert!(!manager.revoke(&VehicleId::new("unknown")));
    }

    #[test]
    fn test_register_rejects_expired_identity() {
        let ctx = TokioContext::new();
        let manager = IdentityManager::new();
        let identity = test_identity(&ctx).with_expiry(1);

        assert!(matches!(
            manager.register(identity, &ctx),
            Err(IdentityError::CertificateExpired(_))
        ));
    }

    #[test]
    fn test_authorized_peers_excludes_self_and_revoked() {
        let ctx = TokioContext::new();
        let manager = IdentityManager::new();
        for name in ["a", "b", "c"] {
            manager
                .register(VehicleIdentity::new(VehicleId::new(name), ctx.unix_millis()), &ctx)
                .unwrap();
        }
        manager.revoke(&VehicleId::new("c"));

        let peers = manager.authorized_peers(&VehicleId::new("a"), ctx.unix_millis());
        assert_eq!(peers, vec![VehicleId::new("b")]);
    }
}
