//! Observer glue: receive lifecycle, block and match notifications.
use async_trait::async_trait;
use bitcoin::Block;

use crate::{
    matcher::{InputMatch, TxMatch},
    state::Tip,
};

#[async_trait]
/// Callbacks fired by [`WatchService`](crate::WatchService). Every method
/// defaults to a no-op, so implementors pick the events they care about.
///
/// A failing hook is logged and does not interrupt syncing.
pub trait WatchHooks: Send + Sync {
    /// Fired once, when bootstrap finished and the tip is set to genesis.
    async fn on_ready(&self, _genesis: Tip) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired for every block accepted onto the local chain, before its
    /// transactions are matched.
    async fn on_block_added(&self, _height: u32, _block: &Block) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired after the tip was rewound from `from` to the common ancestor `to`.
    async fn on_reorg(&self, _from: Tip, _to: Tip) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired for every input that spent from a watched address.
    async fn on_match(&self, _hit: &InputMatch) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registered observers, in registration order.
pub type HookSet = [std::sync::Arc<dyn WatchHooks>];

/// Log (never propagate) a hook failure.
pub(crate) fn log_failure(event: &'static str, res: anyhow::Result<()>) {
    if let Err(e) = res {
        tracing::warn!(event, "watch hook failed: {e:#}");
    }
}

/// Fire `on_match` on every hook for every matched input of `outcome`.
pub(crate) async fn notify_matches(hooks: &HookSet, outcome: &TxMatch) {
    for hit in &outcome.matches {
        for hook in hooks {
            log_failure("match", hook.on_match(hit).await);
        }
    }
}
