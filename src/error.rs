//! Error taxonomy for the watcher core.
use std::time::Duration;

use bitcoin::BlockHash;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the sync engine, bootstrap and lifecycle controller.
///
/// Collaborator traits ([`ChainSource`](crate::ChainSource),
/// [`RecordStore`](crate::RecordStore)) return `anyhow::Result`; the core
/// wraps those failures here so the host can tell a timeout from a decode
/// failure from an unresolved reorg.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Fixture bootstrap failed; the service never becomes ready.
    #[error("fixture bootstrap failed: {0}")]
    Bootstrap(#[source] BoxError),

    /// The chain source failed to deliver the block at `height`.
    #[error("fetch block at height {height} failed: {source}")]
    Fetch {
        /// Height that was requested.
        height: u32,
        /// Underlying source error.
        #[source]
        source: BoxError,
    },

    /// The chain source did not answer within the configured bound.
    #[error("fetch block at height {height} timed out after {after:?}")]
    FetchTimeout {
        /// Height that was requested.
        height: u32,
        /// Configured fetch timeout.
        after: Duration,
    },

    /// Raw block bytes did not decode.
    #[error("decode block at height {height}: {source}")]
    Decode {
        /// Height of the undecodable block.
        height: u32,
        /// Consensus decoding error.
        #[source]
        source: bitcoin::consensus::encode::Error,
    },

    /// A chain source query (best height, genesis) failed.
    #[error("chain source query failed: {0}")]
    Source(#[source] BoxError),

    /// Too many consecutive parent-hash mismatches without progress.
    #[error("unresolved reorg at height {height} after {attempts} consecutive mismatches")]
    UnresolvedReorg {
        /// Height whose parent never matched the local tip.
        height: u32,
        /// Number of mismatches observed.
        attempts: u32,
    },

    /// No common ancestor within the retained chain history.
    #[error("no common ancestor within {searched} blocks of tip {tip}")]
    ReorgTooDeep {
        /// Local tip hash when the search started.
        tip: BlockHash,
        /// How many local blocks were compared.
        searched: u32,
    },

    /// Lifecycle misuse, e.g. starting twice.
    #[error("invalid lifecycle state: {0}")]
    InvalidState(String),
}

impl WatchError {
    pub(crate) fn bootstrap(err: anyhow::Error) -> Self {
        Self::Bootstrap(err.into())
    }

    pub(crate) fn source(err: anyhow::Error) -> Self {
        Self::Source(err.into())
    }

    /// True for errors that mean the engine cannot keep following the chain.
    pub fn is_fatal_sync(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. }
                | Self::FetchTimeout { .. }
                | Self::Decode { .. }
                | Self::Source(_)
                | Self::UnresolvedReorg { .. }
                | Self::ReorgTooDeep { .. }
        )
    }
}
