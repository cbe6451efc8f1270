//! Lifecycle controller: bootstrap, readiness and the event loop that
//! feeds `tip` and `tx` notifications into the engine and matcher.
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{consensus, Block};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::{JoinError, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    bootstrap::load_fixtures,
    chain_source::{ChainEvent, ChainSource},
    config::WatchConfig,
    engine::{SyncEngine, SyncOutcome},
    error::WatchError,
    hooks::{log_failure, notify_matches, WatchHooks},
    matcher::{process_transaction, TransactionInput, TxMatch},
    state::{Tip, WatchList, WatchSnapshot, WatchState},
    store::RecordStore,
};

/// Where a [`WatchService`] is in its life.
///
/// Syncing is not a state of its own: each `tip` event re-enters the
/// catch-up loop from `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not started.
    Created,
    /// Bootstrap in progress, or bootstrap failed.
    Loading,
    /// Tip set to genesis; events are processed.
    Ready,
    /// `stop` was called.
    Stopped,
}

/// Start/stop capability exposed to the host.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Bring the component up. Called once.
    async fn start(&self) -> Result<(), WatchError>;

    /// Shut down and invoke `callback` when done.
    fn stop<F>(&self, callback: F)
    where
        F: FnOnce() + Send;
}

/// Chain-tip following balance watcher.
///
/// `C` = chain source, `R` = record store.
pub struct WatchService<C, R> {
    config: Arc<WatchConfig>,
    chain: Arc<C>,
    store: R,
    state: Arc<Mutex<WatchState>>,
    engine: SyncEngine<C>,
    hooks: Vec<Arc<dyn WatchHooks>>,
    lifecycle: watch::Sender<LifecycleState>,
}

impl<C, R> WatchService<C, R>
where
    C: ChainSource + 'static,
    R: RecordStore + 'static,
{
    /// Create a service. Nothing is loaded until [`Lifecycle::start`].
    pub fn new(config: WatchConfig, chain: C, store: R) -> Self {
        let chain = Arc::new(chain);
        let state = Arc::new(Mutex::new(WatchState::new(
            WatchList::new(),
            config.max_reorg_depth as usize + 1,
            config.dedup_txids,
        )));
        let engine = SyncEngine::new(chain.clone(), state.clone(), &config);
        let (lifecycle, _) = watch::channel(LifecycleState::Created);
        Self {
            config: Arc::new(config),
            chain,
            store,
            state,
            engine,
            hooks: Vec::new(),
            lifecycle,
        }
    }

    /// Register an observer. Hooks fire in registration order.
    pub fn with_hooks(mut self, hooks: impl WatchHooks + 'static) -> Self {
        self.hooks.push(Arc::new(hooks));
        self
    }

    /// Services this one needs from the host.
    pub fn dependencies(&self) -> &'static [&'static str] {
        &["bitcoind"]
    }

    /// RPC methods exposed to the host. None.
    pub fn api_methods(&self) -> &'static [&'static str] {
        &[]
    }

    /// Bus events published to the host. None.
    pub fn publish_events(&self) -> &'static [&'static str] {
        &[]
    }

    /// The configuration this service runs with.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// The chain source.
    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Receiver that observes every lifecycle transition.
    pub fn lifecycle_updates(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Copy of tip, counters and watch list.
    pub async fn snapshot(&self) -> WatchSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Log the cumulative total as a diagnostic summary.
    pub async fn log_summary(&self) {
        self.state.lock().await.log_summary();
    }

    /// Run one catch-up pass, as a `tip` event would.
    pub async fn catch_up(&self) -> Result<SyncOutcome, WatchError> {
        self.engine.catch_up(&self.hooks).await
    }

    /// Match a transaction seen outside of a block.
    ///
    /// Undecodable input is logged and dropped.
    pub async fn handle_tx(&self, input: TransactionInput) -> Option<TxMatch> {
        match process_transaction(self.chain.as_ref(), &self.state, input, None).await {
            Ok((_, outcome)) => {
                notify_matches(&self.hooks, &outcome).await;
                Some(outcome)
            }
            Err(e) => {
                warn!("dropping undecodable transaction: {e}");
                None
            }
        }
    }

    async fn genesis_tip(&self) -> Result<Tip, WatchError> {
        let raw = self
            .chain
            .genesis_block()
            .await
            .map_err(WatchError::source)?;
        let block: Block = consensus::encode::deserialize(&raw)
            .map_err(|source| WatchError::Decode { height: 0, source })?;
        Ok(Tip {
            height: 0,
            hash: block.block_hash(),
        })
    }

    /// Consume node notifications until the channel closes or the service
    /// is stopped.
    ///
    /// `tx` events are matched inline. `tip` events spawn a catch-up pass
    /// so transactions keep flowing while blocks are fetched; overlapping
    /// passes are no-ops. Once the service is stopped, catch-up passes
    /// still in flight are aborted.
    ///
    /// # Errors
    /// Returns [`WatchError::InvalidState`] unless the service is ready, and
    /// the first fatal sync error otherwise, after logging the summary.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChainEvent>,
    ) -> Result<(), WatchError> {
        let mut lifecycle = self.lifecycle.subscribe();
        let state = *lifecycle.borrow_and_update();
        if state != LifecycleState::Ready {
            return Err(WatchError::InvalidState(format!("run called while {state:?}")));
        }

        let mut syncs: JoinSet<Result<SyncOutcome, WatchError>> = JoinSet::new();
        let mut stopped = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChainEvent::Tx(tx)) => {
                        self.handle_tx(tx).await;
                    }
                    Some(ChainEvent::Tip) => {
                        if self.chain.is_stopping() {
                            debug!("tip event ignored, chain source is stopping");
                            continue;
                        }
                        let svc = Arc::clone(&self);
                        syncs.spawn(async move { svc.catch_up().await });
                    }
                    None => break,
                },
                Some(joined) = syncs.join_next(), if !syncs.is_empty() => {
                    self.on_sync_finished(joined).await?;
                }
                Ok(()) = lifecycle.changed() => {
                    if *lifecycle.borrow_and_update() == LifecycleState::Stopped {
                        stopped = true;
                        break;
                    }
                }
            }
        }

        // a closed channel lets in-flight catch-ups finish, a stop abandons them
        if stopped && !syncs.is_empty() {
            debug!(pending = syncs.len(), "aborting catch-up after stop");
            syncs.abort_all();
        }
        while let Some(joined) = syncs.join_next().await {
            self.on_sync_finished(joined).await?;
        }
        Ok(())
    }

    async fn on_sync_finished(
        &self,
        joined: Result<Result<SyncOutcome, WatchError>, JoinError>,
    ) -> Result<(), WatchError> {
        match joined {
            Ok(Ok(outcome)) => {
                debug!(?outcome, "catch-up finished");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("have to stop, error found while syncing: {e}");
                self.log_summary().await;
                Err(e)
            }
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(_) => {
                debug!("catch-up cancelled");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<C, R> Lifecycle for WatchService<C, R>
where
    C: ChainSource + 'static,
    R: RecordStore + 'static,
{
    /// Load or seed fixtures, set the tip to genesis and become ready.
    ///
    /// Failures are fatal: the service stays in `Loading` and never
    /// becomes ready. A `stop` that lands while loading wins: `start`
    /// returns [`WatchError::InvalidState`] and `on_ready` never fires.
    async fn start(&self) -> Result<(), WatchError> {
        let claimed = self.lifecycle.send_if_modified(|s| {
            if *s == LifecycleState::Created {
                *s = LifecycleState::Loading;
                true
            } else {
                false
            }
        });
        if !claimed {
            let state = self.lifecycle();
            return Err(WatchError::InvalidState(format!("start called while {state:?}")));
        }
        if self.chain.network() != self.config.network {
            let e = anyhow::anyhow!(
                "chain source runs on {}, configured for {}",
                self.chain.network(),
                self.config.network
            );
            error!("{e}");
            return Err(WatchError::bootstrap(e));
        }
        info!(data_dir = %self.config.data_dir.display(), "loading fixtures");

        let boot = match load_fixtures(&self.store, &self.config.default_watch_list).await {
            Ok(boot) => boot,
            Err(e) => {
                error!("fixture bootstrap failed: {e:#}");
                return Err(WatchError::bootstrap(e));
            }
        };
        let genesis = match self.genesis_tip().await {
            Ok(tip) => tip,
            Err(e) => {
                error!("cannot read genesis block: {e}");
                return Err(e);
            }
        };

        let (watched, total_amount) = {
            let mut state = self.state.lock().await;
            state.restore(boot.watch_list, boot.total_amount);
            state.reset_to_genesis(genesis);
            (state.watch_list().len(), state.total_amount())
        };
        let ready = self.lifecycle.send_if_modified(|s| {
            if *s == LifecycleState::Loading {
                *s = LifecycleState::Ready;
                true
            } else {
                false
            }
        });
        if !ready {
            let state = self.lifecycle();
            warn!(?state, "service left loading before bootstrap finished");
            return Err(WatchError::InvalidState(format!(
                "bootstrap finished while {state:?}"
            )));
        }
        info!(watched, total_amount, genesis = %genesis.hash, "watch service ready");

        for hook in &self.hooks {
            log_failure("ready", hook.on_ready(genesis).await);
        }
        Ok(())
    }

    fn stop<F>(&self, callback: F)
    where
        F: FnOnce() + Send,
    {
        self.lifecycle.send_replace(LifecycleState::Stopped);
        info!("watch service stopped");
        callback();
    }
}
