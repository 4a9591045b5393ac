// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # SOD Engine
//!
//! The serving half of SOD: everything between "a metric arrived" and
//! "its verdict is durable and, if it was an outlier, on its way out".
//!
//! - [`metric`]: the persisted models ([`metric::Metric`],
//!   [`metric::Alert`]) and their stable JSON encoding.
//! - [`store`]: per-entity buckets over the embedded `redb` engine.
//! - [`executor`]: the write-back buffer batching metric persistence.
//! - [`retention`]: periodic size/TTL sweeps over the store.
//! - [`queue`]: per-entity FIFO delivery to worker pools.
//! - [`dispatcher`]: the manager tying predictors, queues, persistence
//!   and alerting together, including recovery and graceful shutdown.
//! - [`alert`]: batched, persisted, rate-limited outlier notification.
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use sod_engine::alert::AlertManager;
//! use sod_engine::config::{AlertConfig, EngineConfig};
//! use sod_engine::dispatcher::Dispatcher;
//! use sod_engine::store::Store;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn wire() -> sod_engine::error::Result<()> {
//! let store = Store::open("sod.redb")?;
//! let (shutdown_tx, _shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let notifier = AlertManager::new(store.alerts(), AlertConfig::default())?;
//! let dispatcher = Dispatcher::new(
//!     &store,
//!     sod::LofConfig::default(),
//!     notifier,
//!     shutdown_tx,
//!     EngineConfig::default(),
//! )?;
//!
//! let cancel = CancellationToken::new();
//! dispatcher.clone().run(cancel.clone()).await?;
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod http;
pub mod metric;
pub mod queue;
pub mod retention;
pub mod store;

// Re-exports for convenient access
pub use alert::AlertManager;
pub use config::{AlertConfig, EngineConfig, Target};
pub use dispatcher::{Dispatcher, ShutdownTx};
pub use error::{EngineError, Result};
pub use metric::{Alert, Metric, Status};
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
