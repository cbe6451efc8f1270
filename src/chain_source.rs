//! Abstractions over the full node that feeds the watcher.
use async_trait::async_trait;
use bitcoin::{Network, OutPoint, TxOut};

use crate::matcher::TransactionInput;

/// Notifications delivered by the node subscription.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// The node's best tip moved; re-check [`ChainSource::best_height`].
    Tip,
    /// A transaction was seen, typically before it is confirmed.
    Tx(TransactionInput),
}

/// Block and chain-height provider backed by a full node.
///
/// The subscription half (`tip`/`tx` notifications) is a channel of
/// [`ChainEvent`] handed to [`WatchService::run`](crate::WatchService::run).
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Network the node runs on; used to encode resolved addresses.
    fn network(&self) -> Network;

    /// Raw consensus-encoded genesis block.
    async fn genesis_block(&self) -> anyhow::Result<Vec<u8>>;

    /// Current best height as seen by the node.
    async fn best_height(&self) -> anyhow::Result<u32>;

    /// Raw consensus-encoded block at `height` on the node's best chain.
    async fn get_block(&self, height: u32) -> anyhow::Result<Vec<u8>>;

    /// Whether the node is shutting down. Catch-up stops when this flips.
    fn is_stopping(&self) -> bool {
        false
    }

    /// (Optional) the output spent by `outpoint`, needed to value an input.
    /// Nodes without a transaction index return `None`.
    async fn get_prevout(&self, _outpoint: OutPoint) -> anyhow::Result<Option<TxOut>> {
        Ok(None)
    }
}
