//! In-memory watcher state: current tip, watch list and running totals.
use std::collections::{HashSet, VecDeque};

use bitcoin::{BlockHash, Txid};

/// The block currently believed to be the head of the chain.
///
/// Replaced, never mutated, whenever a block is accepted or the chain is
/// rewound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tip {
    /// Height assigned locally (genesis is 0).
    pub height: u32,
    /// Header hash.
    pub hash: BlockHash,
}

/// Watched addresses: unique, insertion ordered, O(1) membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    order: Vec<String>,
    members: HashSet<String>,
}

impl WatchList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `address`; returns `false` if it was already present.
    pub fn insert(&mut self, address: impl Into<String>) -> bool {
        let address = address.into();
        if self.members.contains(&address) {
            return false;
        }
        self.members.insert(address.clone());
        self.order.push(address);
        true
    }

    /// Exact string membership.
    pub fn contains(&self, address: &str) -> bool {
        self.members.contains(address)
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Addresses in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}

impl<S: Into<String>> FromIterator<S> for WatchList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = Self::new();
        for a in iter {
            list.insert(a);
        }
        list
    }
}

/// What a single accepted block contributed, kept so a rewind can undo it.
#[derive(Debug, Clone)]
struct ChainLink {
    tip: Tip,
    credited: i64,
    hits: u64,
    txids: Vec<Txid>,
}

impl ChainLink {
    fn new(tip: Tip) -> Self {
        Self {
            tip,
            credited: 0,
            hits: 0,
            txids: Vec::new(),
        }
    }
}

/// Totals removed by [`WatchState::rewind_to`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rewind {
    /// Blocks disconnected from the local chain.
    pub disconnected: u32,
    /// Amount those blocks had credited.
    pub amount: i64,
    /// Hits those blocks had counted.
    pub hits: u64,
}

/// Point-in-time copy of the counters, for hosts and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSnapshot {
    /// Current tip, if the service is ready.
    pub tip: Option<Tip>,
    /// Cumulative matched amount in satoshis.
    pub total_amount: i64,
    /// Number of matched inputs.
    pub hits: u64,
    /// Watched addresses, insertion ordered.
    pub watch_list: Vec<String>,
}

/// Tip, watch list and counters. Mutated only by the matcher and the sync
/// engine, always behind a single mutex.
#[derive(Debug)]
pub struct WatchState {
    tip: Option<Tip>,
    watch_list: WatchList,
    total_amount: i64,
    hits: u64,
    recent: VecDeque<ChainLink>,
    history_limit: usize,
    credited: Option<HashSet<Txid>>,
}

impl WatchState {
    /// Fresh state with no tip. `history_limit` bounds how many accepted
    /// blocks are remembered for rewinds; `dedup` enables crediting each
    /// txid at most once.
    pub fn new(watch_list: WatchList, history_limit: usize, dedup: bool) -> Self {
        Self {
            tip: None,
            watch_list,
            total_amount: 0,
            hits: 0,
            recent: VecDeque::new(),
            history_limit: history_limit.max(1),
            credited: dedup.then(HashSet::new),
        }
    }

    /// Current tip, `None` until the service is ready.
    pub fn tip(&self) -> Option<Tip> {
        self.tip
    }

    /// Watched addresses.
    pub fn watch_list(&self) -> &WatchList {
        &self.watch_list
    }

    /// Cumulative matched amount.
    pub fn total_amount(&self) -> i64 {
        self.total_amount
    }

    /// Matched-input counter.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Replace watch list and amount with what bootstrap loaded.
    pub(crate) fn restore(&mut self, watch_list: WatchList, total_amount: i64) {
        self.watch_list = watch_list;
        self.total_amount = total_amount;
    }

    /// Forget the local chain and start over at `genesis`.
    pub(crate) fn reset_to_genesis(&mut self, genesis: Tip) {
        self.recent.clear();
        self.recent.push_back(ChainLink::new(genesis));
        self.tip = Some(genesis);
    }

    /// Adopt `tip` as the new head. Caller guarantees it extends the old one.
    pub(crate) fn push_tip(&mut self, tip: Tip) {
        self.recent.push_back(ChainLink::new(tip));
        while self.recent.len() > self.history_limit {
            self.recent.pop_front();
        }
        self.tip = Some(tip);
    }

    /// Remember what the block at `height` credited, for a later rewind.
    pub(crate) fn credit_block(&mut self, height: u32, amount: i64, hits: u64, txids: Vec<Txid>) {
        let link = self
            .recent
            .iter_mut()
            .rev()
            .find(|l| l.tip.height == height);
        if let Some(link) = link {
            link.credited = link.credited.saturating_add(amount);
            link.hits += hits;
            link.txids.extend(txids);
        }
    }

    /// Remembered tips, newest first.
    pub fn recent_tips(&self) -> Vec<Tip> {
        self.recent.iter().rev().map(|l| l.tip).collect()
    }

    /// Drop every remembered block above `ancestor`, subtract what they
    /// credited and make `ancestor` the tip.
    pub(crate) fn rewind_to(&mut self, ancestor: Tip) -> Rewind {
        let mut undone = Rewind::default();
        while let Some(link) = self.recent.back() {
            if link.tip.height <= ancestor.height {
                break;
            }
            let Some(link) = self.recent.pop_back() else {
                break;
            };
            undone.disconnected += 1;
            undone.amount = undone.amount.saturating_add(link.credited);
            undone.hits += link.hits;
            if let Some(seen) = self.credited.as_mut() {
                for txid in &link.txids {
                    seen.remove(txid);
                }
            }
        }
        self.total_amount = self.total_amount.saturating_sub(undone.amount);
        self.hits = self.hits.saturating_sub(undone.hits);
        self.tip = Some(ancestor);
        undone
    }

    pub(crate) fn record_hit(&mut self, amount: u64) {
        self.hits += 1;
        self.total_amount = self
            .total_amount
            .saturating_add(i64::try_from(amount).unwrap_or(i64::MAX));
    }

    /// Whether `txid` was already credited. Always false without dedup.
    pub(crate) fn is_credited(&self, txid: &Txid) -> bool {
        self.credited.as_ref().is_some_and(|s| s.contains(txid))
    }

    pub(crate) fn mark_credited(&mut self, txid: Txid) {
        if let Some(seen) = self.credited.as_mut() {
            seen.insert(txid);
        }
    }

    /// Heuristic "probably done": at least as many hits as watched addresses.
    pub fn hits_cover_watch_list(&self) -> bool {
        self.hits >= self.watch_list.len() as u64
    }

    /// Log the cumulative total as a diagnostic summary.
    pub fn log_summary(&self) {
        tracing::info!(
            total_amount = self.total_amount,
            hits = self.hits,
            watched = self.watch_list.len(),
            "current total amount: {} satoshis",
            self.total_amount
        );
    }

    /// Copy of the counters.
    pub fn snapshot(&self) -> WatchSnapshot {
        WatchSnapshot {
            tip: self.tip,
            total_amount: self.total_amount,
            hits: self.hits,
            watch_list: self.watch_list.iter().cloned().collect(),
        }
    }
}
