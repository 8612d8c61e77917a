//! Controllable clock for unit tests.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use v2v_env::V2vContext;

/// Wall clock = fixed epoch + tokio clock elapsed + manual offset.
///
/// Sleeping goes through `tokio::time`, so `start_paused` tests control it.
pub(crate) struct ManualContext {
    epoch: SystemTime,
    start: tokio::time::Instant,
    offset_ms: AtomicU64,
    seed: u64,
    rng: Mutex<StdRng>,
}

impl ManualContext {
    pub(crate) fn new(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            // 2024-01-01T00:00:00Z
            epoch: SystemTime::UNIX_EPOCH + Duration::from_secs(1_704_067_200),
            start: tokio::time::Instant::now(),
            offset_ms: AtomicU64::new(0),
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Jumps the wall clock forward without waking any sleeper.
    pub(crate) fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl V2vContext for ManualContext {
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
        let mut rng = StdRng::seed_from_u64(self.seed ^ seed_extension);
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        SigningKey::from_bytes(&secret)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
