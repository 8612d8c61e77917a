//! V2V Deterministic Simulation Harness
//!
//! Runs whole fleets of `VehicleNode`s inside one process with every source
//! of non-determinism under control:
//! - **Time**: tokio's pausable clock plus a manual wall-clock offset
//! - **Network**: in-memory medium with partitions and per-link loss
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Usage
//!
//! ```ignore
//! use v2v_sim::Fleet;
//!
//! #[tokio::test(start_paused = true)]
//! async fn two_cars() {
//!     let mut fleet = Fleet::new(42, V2vConfig::default());
//!     fleet.add_vehicle("car_1")?;
//!     fleet.add_vehicle("car_2")?;
//!     fleet.start_all().await?;
//!     fleet.place("car_1", 37.7749, -122.4194)?;
//!     fleet.place("car_2", 37.7759, -122.4184)?;
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     fleet.shutdown().await;
//! }
//! ```

mod context;
mod fleet;
mod network;

pub use context::SimContext;
pub use fleet::{Fleet, FleetError, SimNode};
pub use network::{NetworkStats, SimNetwork, SimTransport};

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber honouring `RUST_LOG` (default `info`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
