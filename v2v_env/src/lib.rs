//! V2V Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the V2V protocol engine
//! run against the real world (tokio clock, OS entropy, a radio stack) or
//! against a deterministic harness (virtual clock, seeded RNG, in-memory
//! router).
//!
//! # Intercepted I/O
//!
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Randomness (`fill_random()`, `derive_signing_key()`)
//! - Network (`Transport::deliver()`)
//!
//! # Example
//!
//! ```ignore
//! use v2v_env::{V2vContext, Transport, WireFrame};
//!
//! async fn beacon<Ctx: V2vContext, Net: Transport>(ctx: &Ctx, net: &Net, peer: &VehicleId) {
//!     loop {
//!         let frame = WireFrame::new(net.local_id().clone(), b"hello".to_vec(), ctx.unix_millis());
//!         let _ = net.deliver(peer, frame).await;
//!         ctx.sleep(Duration::from_millis(100)).await;
//!     }
//! }
//! ```

mod context;
mod error;
mod network;
mod tokio_impl;
mod types;

pub use context::V2vContext;
pub use error::EnvError;
pub use network::{LoggingTransport, NetworkController, Transport};
pub use tokio_impl::TokioContext;
pub use types::{VehicleId, WireFrame};
