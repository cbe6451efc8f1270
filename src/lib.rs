#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! tipwatch: a chain-tip following balance watcher for Bitcoin full nodes.
//!
//! ## What you implement
//! - [`ChainSource`]: raw blocks by height, best height, genesis bytes.
//! - Optionally [`WatchHooks`]: observe readiness, added blocks, reorgs and matches.
//!
//! [`FileStore`] (one JSON record per address) and [`SqliteStore`] are
//! provided as [`RecordStore`] backends.
//!
//! ## What the service does
//! - Restores the watch list and running total from the record store, or
//!   seeds the store with the configured default addresses.
//! - On every `tip` notification, walks the node's chain forward from the
//!   local tip, validating each parent hash and rewinding to a common
//!   ancestor on reorg.
//! - Matches every input of every block transaction, and of every loose
//!   `tx` notification, against the watch list and accumulates the value.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use tipwatch::prelude::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct MyNode;
//! #[async_trait]
//! impl ChainSource for MyNode {
//!     fn network(&self) -> bitcoin::Network { bitcoin::Network::Regtest }
//!     async fn genesis_block(&self) -> anyhow::Result<Vec<u8>> { todo!() }
//!     async fn best_height(&self) -> anyhow::Result<u32> { Ok(0) }
//!     async fn get_block(&self, _h: u32) -> anyhow::Result<Vec<u8>> { todo!() }
//! }
//!
//! async fn run(events: tokio::sync::mpsc::Receiver<ChainEvent>) -> anyhow::Result<()> {
//!     let config = WatchConfig::load("watch.json")?;
//!     let store = FileStore::create(&config.data_dir).await?;
//!     let service = Arc::new(WatchService::new(config, MyNode, store));
//!     service.start().await?;
//!     service.run(events).await?;
//!     Ok(())
//! }
//! ```

/// Fixture bootstrap from the record store.
pub mod bootstrap;

/// Node-facing traits and the notification type.
pub mod chain_source;

/// Watcher configuration.
pub mod config;

/// Height-by-height catch-up with reorg handling.
pub mod engine;

/// Error taxonomy.
pub mod error;

/// Observer callbacks.
pub mod hooks;

/// Transaction decoding, input address resolution and matching.
pub mod matcher;

/// Lifecycle controller and public service surface.
pub mod service;

/// Tip, watch list and running totals.
pub mod state;

/// Persistence layer (trait, file and SQLite implementations).
pub mod store;

// Public re-exports
pub use chain_source::{ChainEvent, ChainSource};
pub use config::WatchConfig;
pub use engine::{SyncEngine, SyncOutcome};
pub use error::WatchError;
pub use hooks::WatchHooks;
pub use matcher::{TransactionInput, TxMatch};
pub use service::{Lifecycle, LifecycleState, WatchService};
pub use state::{Tip, WatchList, WatchSnapshot, WatchState};
pub use store::{file_store::FileStore, Record, RecordContent, RecordStore};
#[cfg(feature = "store-sqlite")]
pub use store::sqlite_store::SqliteStore;

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        ChainEvent, ChainSource, FileStore, Lifecycle, RecordStore, TransactionInput,
        WatchConfig, WatchHooks, WatchService,
    };
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteStore;
}
