//! Metering
//!
//! Bills pay-per-minute sessions in fixed blocks against the token ledger.
//!
//! # Architecture
//!
//! The scheduler runs as a periodic background task (every 30 seconds by
//! default):
//!
//! 1. **Enumerate**: Collect active sessions with a full block elapsed
//! 2. **Lock**: Skip sessions whose previous tick is still in flight
//! 3. **Charge**: Transfer one block from payer to payee with the session update
//! 4. **Terminate**: End sessions whose payer cannot cover the next block
//!
//! # Example
//!
//! ```no_run
//! use metering::{Config, MeteringScheduler};
//! use std::sync::Arc;
//! use token_ledger::{AccountId, Ledger, NoopSink};
//!
//! #[tokio::main]
//! async fn main() -> metering::Result<()> {
//!     let config = Config::default();
//!     let ledger = Arc::new(Ledger::open(config.ledger)?);
//!     let scheduler = MeteringScheduler::new(ledger, config.metering, Arc::new(NoopSink))?;
//!
//!     let session = scheduler
//!         .start_metering(AccountId::new("fan"), AccountId::new("creator"), 20)
//!         .await?;
//!     let outcome = scheduler.meter_tick(&session.session_id).await?;
//!     println!("charged: {}, ended: {}", outcome.charged, outcome.session_ended);
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod error;
pub mod config;
pub mod scheduler;

// Re-exports
pub use config::{Config, MeteringConfig};
pub use error::{Error, Result};
pub use scheduler::MeteringScheduler;
pub use types::{TickOutcome, TickSummary};
