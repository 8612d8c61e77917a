//! Simulation context implementing V2vContext for deterministic testing.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use v2v_env::V2vContext;

/// Simulation context backed by a virtual wall clock and a seeded RNG.
///
/// - Wall clock = fixed epoch + tokio clock elapsed + manual offset. Under
///   `#[tokio::test(start_paused = true)]` the tokio clock only moves when
///   every task is idle, so scheduled loops run in virtual time.
/// - `advance_time` jumps the wall clock without waking sleepers (message
///   and key ageing).
/// - All entropy comes from a ChaCha8 RNG seeded with `seed`.
pub struct SimContext {
    seed: u64,
    start: tokio::time::Instant,
    offset_ms: AtomicU64,
    rng: Mutex<ChaCha8Rng>,
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: tokio::time::Instant::now(),
            offset_ms: AtomicU64::new(0),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Moves the wall clock forward by `duration`.
    pub fn advance_time(&self, duration: Duration) {
        self.offset_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl V2vContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed() + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn fill_random(&self, dest: &mut [u8]) {
        self.rng.lock().fill_bytes(dest);
    }

    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey {
        // Combine master seed with extension for deterministic key
        let combined_seed = self.seed.wrapping_mul(0x517cc1b727220a95) ^ seed_extension;
        let mut key_rng = ChaCha8Rng::seed_from_u64(combined_seed);
        SigningKey::generate(&mut key_rng)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
