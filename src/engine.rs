//! Chain-tip follower:
//! 1) walk the node's best chain height by height from the local tip,
//! 2) accept blocks whose parent is the local tip and match their txs,
//! 3) on a parent mismatch, search back for a common ancestor and rewind.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bitcoin::{consensus, Block, OutPoint};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    chain_source::ChainSource,
    config::WatchConfig,
    error::WatchError,
    hooks::{log_failure, notify_matches, HookSet},
    matcher::{process_transaction, PrevoutMap, TransactionInput},
    state::{Tip, WatchState},
};

/// How a catch-up call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another catch-up was running, the source is stopping, or there is no tip yet.
    Skipped,
    /// Local tip reached the source's best height.
    CaughtUp {
        /// Tip after the loop.
        tip: Tip,
        /// Blocks accepted by this call.
        accepted: u32,
    },
    /// The source started stopping mid-loop.
    Interrupted {
        /// Tip when the loop stopped.
        tip: Tip,
        /// Blocks accepted by this call.
        accepted: u32,
    },
}

/// Clears the in-progress flag when the catch-up loop exits, on any path.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Core engine. `C` = chain source.
pub struct SyncEngine<C: ?Sized> {
    chain: Arc<C>,
    state: Arc<Mutex<WatchState>>,
    fetch_timeout: Duration,
    max_reorg_depth: u32,
    max_reorg_retries: u32,
    syncing: AtomicBool,
}

impl<C> SyncEngine<C>
where
    C: ChainSource + ?Sized,
{
    /// Create an engine over a chain source and the shared watch state.
    pub fn new(chain: Arc<C>, state: Arc<Mutex<WatchState>>, config: &WatchConfig) -> Self {
        Self {
            chain,
            state,
            fetch_timeout: config.fetch_timeout(),
            max_reorg_depth: config.max_reorg_depth,
            max_reorg_retries: config.max_reorg_retries,
            syncing: AtomicBool::new(false),
        }
    }

    /// Whether a catch-up loop is currently running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Advance the local tip to the source's best height.
    ///
    /// At most one loop runs at a time: a call made while another is in
    /// progress returns [`SyncOutcome::Skipped`] immediately.
    ///
    /// # Errors
    /// Returns an error if a block cannot be fetched in time or decoded,
    /// the source cannot report its height, no common ancestor exists
    /// within the retained history, or parent-hash mismatches persist for
    /// more than `max_reorg_retries` consecutive attempts. Nothing is
    /// retried internally.
    pub async fn catch_up(&self, hooks: &HookSet) -> Result<SyncOutcome, WatchError> {
        if self.chain.is_stopping() {
            return Ok(SyncOutcome::Skipped);
        }
        let Some(_guard) = SyncGuard::acquire(&self.syncing) else {
            debug!("catch-up already in progress");
            return Ok(SyncOutcome::Skipped);
        };
        let Some(mut tip) = self.state.lock().await.tip() else {
            debug!("no tip yet, nothing to sync from");
            return Ok(SyncOutcome::Skipped);
        };

        let mut accepted = 0u32;
        let mut mismatches = 0u32;

        loop {
            if self.chain.is_stopping() {
                return Ok(SyncOutcome::Interrupted { tip, accepted });
            }
            let best = self.chain.best_height().await.map_err(WatchError::source)?;
            if tip.height >= best {
                break;
            }

            let next = tip.height + 1;
            let block = self.fetch_block(next).await?;

            if block.header.prev_blockhash == tip.hash {
                mismatches = 0;
                tip = self.accept(next, block, hooks).await?;
                accepted += 1;
                continue;
            }

            mismatches += 1;
            warn!(
                height = next,
                tip = %tip.hash,
                parent = %block.header.prev_blockhash,
                attempt = mismatches,
                "reorg detected, block does not extend current tip"
            );
            if mismatches > self.max_reorg_retries {
                return Err(WatchError::UnresolvedReorg {
                    height: next,
                    attempts: mismatches,
                });
            }
            tip = self.rewind(tip, hooks).await?;
        }

        Ok(SyncOutcome::CaughtUp { tip, accepted })
    }

    /// Fetch and decode the block at `height`, bounded by the fetch timeout.
    async fn fetch_block(&self, height: u32) -> Result<Block, WatchError> {
        let raw = timeout(self.fetch_timeout, self.chain.get_block(height))
            .await
            .map_err(|_| WatchError::FetchTimeout {
                height,
                after: self.fetch_timeout,
            })?
            .map_err(|e| WatchError::Fetch {
                height,
                source: e.into(),
            })?;
        consensus::encode::deserialize(&raw).map_err(|source| WatchError::Decode { height, source })
    }

    /// Make `block` the new tip, notify observers, then match its transactions.
    async fn accept(&self, height: u32, block: Block, hooks: &HookSet) -> Result<Tip, WatchError> {
        let tip = Tip {
            height,
            hash: block.block_hash(),
        };
        self.state.lock().await.push_tip(tip);
        info!(height, hash = %tip.hash, "chain added block to main chain");

        for hook in hooks {
            log_failure("addblock", hook.on_block_added(height, &block).await);
        }

        self.handle_block(tip, &block, hooks).await?;
        Ok(tip)
    }

    /// Match every transaction in block order and record what the block credited.
    async fn handle_block(
        &self,
        tip: Tip,
        block: &Block,
        hooks: &HookSet,
    ) -> Result<(), WatchError> {
        let mut local = PrevoutMap::new();
        let mut amount = 0u64;
        let mut hits = 0u64;
        let mut txids = Vec::new();

        for tx in &block.txdata {
            let input = TransactionInput::Decoded(tx.clone());
            let chain = self.chain.as_ref();
            let (tx, outcome) = process_transaction(chain, &self.state, input, Some(&local))
                .await
                .map_err(|source| WatchError::Decode {
                    height: tip.height,
                    source,
                })?;

            notify_matches(hooks, &outcome).await;
            if !outcome.matches.is_empty() {
                amount = amount.saturating_add(outcome.amount());
                hits = hits.saturating_add(outcome.matches.len() as u64);
                txids.push(outcome.txid);
            }

            let txid = outcome.txid;
            for (vout, out) in tx.output.into_iter().enumerate() {
                local.insert(OutPoint::new(txid, vout as u32), out);
            }
        }

        self.state.lock().await.credit_block(
            tip.height,
            i64::try_from(amount).unwrap_or(i64::MAX),
            hits,
            txids,
        );
        info!(
            height = tip.height,
            hash = %tip.hash,
            txs = block.txdata.len(),
            matched = amount,
            "block number {} found: {}",
            tip.height,
            tip.hash
        );
        Ok(())
    }

    /// Find the newest remembered block the source still agrees with and
    /// rewind the local chain to it. Genesis always counts as common.
    async fn rewind(&self, tip: Tip, hooks: &HookSet) -> Result<Tip, WatchError> {
        let candidates = self.state.lock().await.recent_tips();
        let mut searched = 0u32;

        for candidate in candidates.into_iter().take(self.max_reorg_depth as usize + 1) {
            searched += 1;
            let common = candidate.height == 0
                || self.fetch_block(candidate.height).await?.block_hash() == candidate.hash;
            if !common {
                continue;
            }

            if candidate != tip {
                let undone = self.state.lock().await.rewind_to(candidate);
                warn!(
                    from = tip.height,
                    to = candidate.height,
                    disconnected = undone.disconnected,
                    amount = undone.amount,
                    "rewound to common ancestor {}",
                    candidate.hash
                );
                for hook in hooks {
                    log_failure("reorg", hook.on_reorg(tip, candidate).await);
                }
            }
            return Ok(candidate);
        }

        Err(WatchError::ReorgTooDeep {
            tip: tip.hash,
            searched,
        })
    }
}
