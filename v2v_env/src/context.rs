//! Core environment context trait for V2V engines.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for environment interaction.
///
/// Every engine reads wall-clock time, sleeps and draws entropy through this
/// trait, so the same code runs in production and under the deterministic
/// harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `OsRng`
/// - **Simulation**: `v2v_sim::SimContext` - virtual wall clock, `ChaCha8Rng(seed)`
#[async_trait]
pub trait V2vContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for message, key and certificate
    /// timestamps.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as Unix milliseconds.
    fn unix_millis(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Suspends execution for the given duration.
    ///
    /// This is the suspension point of every scheduled loop, so it must be
    /// cancellable (dropping the future aborts the wait).
    async fn sleep(&self, duration: Duration);

    /// Fills `dest` with random bytes (nonces, serial numbers).
    fn fill_random(&self, dest: &mut [u8]);

    /// Generates a signing key for a vehicle identity.
    ///
    /// The simulation implementation combines the global seed with
    /// `seed_extension` so keys are unique per vehicle but reproducible.
    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey;

    /// Returns the context's seed (0 when not seeded).
    fn seed(&self) -> u64;
}
