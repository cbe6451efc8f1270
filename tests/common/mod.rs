#![allow(dead_code)]
//! Shared in-memory collaborators and block builders for integration tests.
use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    block::{Header as BlockHeader, Version as BlockVersion},
    blockdata::constants::genesis_block,
    consensus,
    hash_types::TxMerkleNode,
    hashes::Hash,
    pow::CompactTarget,
    script::{Builder, PushBytesBuf},
    secp256k1::{Secp256k1, SecretKey},
    transaction::Version,
    Address, Amount, Block, BlockHash, Network, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use tipwatch::{
    matcher::InputMatch, ChainSource, Lifecycle, Record, RecordContent, RecordStore, Tip,
    WatchConfig, WatchHooks, WatchService,
};
use tokio::sync::Semaphore;

pub const NETWORK: Network = Network::Regtest;

// ------- Chain source -------

#[derive(Default)]
struct ChainInner {
    blocks: Mutex<Vec<Block>>,
    best: Mutex<Option<u32>>,
    stopping: AtomicBool,
    fetches: Mutex<Vec<u32>>,
    prevouts: Mutex<HashMap<OutPoint, TxOut>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    fail_at: Mutex<Option<u32>>,
    garbage_at: Mutex<Option<u32>>,
}

/// Node stub: `blocks[h]` is the block at height `h`, genesis included.
#[derive(Clone, Default)]
pub struct MemChain(Arc<ChainInner>);

impl MemChain {
    pub fn new() -> Self {
        let chain = Self::default();
        chain.0.blocks.lock().unwrap().push(genesis());
        chain
    }

    pub fn genesis_tip(&self) -> Tip {
        Tip {
            height: 0,
            hash: genesis().block_hash(),
        }
    }

    pub fn tip_at(&self, height: u32) -> Tip {
        Tip {
            height,
            hash: self.block_at(height).block_hash(),
        }
    }

    pub fn block_at(&self, height: u32) -> Block {
        self.0.blocks.lock().unwrap()[height as usize].clone()
    }

    pub fn height(&self) -> u32 {
        self.0.blocks.lock().unwrap().len() as u32 - 1
    }

    /// Append a block as given (its parent is not checked).
    pub fn push(&self, block: Block) {
        self.0.blocks.lock().unwrap().push(block);
    }

    /// Append a child of the current top carrying `txs`.
    pub fn extend_with(&self, txs: Vec<Transaction>) -> Block {
        let parent = self.block_at(self.height()).block_hash();
        let salt = self.height() + 1;
        let block = child(parent, txs, salt);
        self.push(block.clone());
        block
    }

    pub fn extend_empty(&self, n: u32) {
        for _ in 0..n {
            self.extend_with(vec![]);
        }
    }

    /// Drop everything from `height` up and grow a fork of `n` blocks there.
    pub fn fork_at(&self, height: u32, n: u32, salt: u32) {
        self.0.blocks.lock().unwrap().truncate(height as usize);
        for i in 0..n {
            let parent = self.block_at(self.height()).block_hash();
            self.push(child(parent, vec![], salt + i));
        }
    }

    pub fn set_best(&self, best: Option<u32>) {
        *self.0.best.lock().unwrap() = best;
    }

    pub fn set_stopping(&self, stopping: bool) {
        self.0.stopping.store(stopping, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> Vec<u32> {
        self.0.fetches.lock().unwrap().clone()
    }

    pub fn add_prevout(&self, outpoint: OutPoint, out: TxOut) {
        self.0.prevouts.lock().unwrap().insert(outpoint, out);
    }

    /// Make every `get_block` wait for a permit.
    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.0.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_at(&self, height: u32) {
        *self.0.fail_at.lock().unwrap() = Some(height);
    }

    pub fn garbage_at(&self, height: u32) {
        *self.0.garbage_at.lock().unwrap() = Some(height);
    }
}

#[async_trait]
impl ChainSource for MemChain {
    fn network(&self) -> Network {
        NETWORK
    }

    async fn genesis_block(&self) -> anyhow::Result<Vec<u8>> {
        Ok(consensus::serialize(&genesis()))
    }

    async fn best_height(&self) -> anyhow::Result<u32> {
        let top = self.height();
        Ok(self.0.best.lock().unwrap().unwrap_or(top))
    }

    async fn get_block(&self, height: u32) -> anyhow::Result<Vec<u8>> {
        self.0.fetches.lock().unwrap().push(height);
        let gate = self.0.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        if *self.0.fail_at.lock().unwrap() == Some(height) {
            anyhow::bail!("node unavailable");
        }
        if *self.0.garbage_at.lock().unwrap() == Some(height) {
            return Ok(vec![0xff, 0x00, 0x01]);
        }
        let blocks = self.0.blocks.lock().unwrap();
        let block = blocks
            .get(height as usize)
            .ok_or_else(|| anyhow::anyhow!("no block at height {height}"))?;
        Ok(consensus::serialize(block))
    }

    fn is_stopping(&self) -> bool {
        self.0.stopping.load(Ordering::SeqCst)
    }

    async fn get_prevout(&self, outpoint: OutPoint) -> anyhow::Result<Option<TxOut>> {
        Ok(self.0.prevouts.lock().unwrap().get(&outpoint).cloned())
    }
}

// ------- Record store -------

#[derive(Default)]
struct StoreInner {
    records: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// In-memory record store holding serialized bodies, like the file store.
#[derive(Clone, Default)]
pub struct MemStore(Arc<StoreInner>);

impl MemStore {
    pub fn with_raw(entries: &[(&str, &str)]) -> Self {
        let store = Self::default();
        {
            let mut records = store.0.records.lock().unwrap();
            for (name, body) in entries {
                records.insert(name.to_string(), body.to_string());
            }
        }
        store
    }

    pub fn failing_writes() -> Self {
        let store = Self::default();
        store.0.fail_writes.store(true, Ordering::SeqCst);
        store
    }

    /// Make every `list` wait for a permit.
    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.0.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn names(&self) -> Vec<String> {
        self.0.records.lock().unwrap().keys().cloned().collect()
    }

    pub fn body(&self, name: &str) -> Option<String> {
        self.0.records.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl RecordStore for MemStore {
    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let gate = self.0.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        Ok(self
            .names()
            .into_iter()
            .filter(|n| !n.starts_with('.'))
            .collect())
    }

    async fn read(&self, name: &str) -> anyhow::Result<RecordContent> {
        let body = self
            .body(name)
            .ok_or_else(|| anyhow::anyhow!("no record {name}"))?;
        Ok(RecordContent::from_text(body))
    }

    async fn write(&self, name: &str, record: &Record) -> anyhow::Result<()> {
        if self.0.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        let body = serde_json::to_string_pretty(record)?;
        self.0.records.lock().unwrap().insert(name.to_owned(), body);
        Ok(())
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        self.0
            .records
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no record {name}"))
    }
}

// ------- Hooks -------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Ready(Tip),
    Block(u32, BlockHash),
    Reorg(Tip, Tip),
    Match(usize, u64),
}

/// Records every hook call in order.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Seen>>>);

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.0.lock().unwrap().clone()
    }

    pub fn blocks(&self) -> Vec<u32> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Block(h, _) => Some(h),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl WatchHooks for Recorder {
    async fn on_ready(&self, genesis: Tip) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(Seen::Ready(genesis));
        Ok(())
    }

    async fn on_block_added(&self, height: u32, block: &Block) -> anyhow::Result<()> {
        self.0
            .lock()
            .unwrap()
            .push(Seen::Block(height, block.block_hash()));
        Ok(())
    }

    async fn on_reorg(&self, from: Tip, to: Tip) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(Seen::Reorg(from, to));
        Ok(())
    }

    async fn on_match(&self, hit: &InputMatch) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(Seen::Match(hit.vin, hit.value));
        Ok(())
    }
}

// ------- Builders -------

pub fn genesis() -> Block {
    genesis_block(NETWORK)
}

fn coinbase(salt: u32) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_int(salt as i64 + 1).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// A block on top of `parent`; `salt` keeps sibling hashes distinct.
pub fn child(parent: BlockHash, mut txs: Vec<Transaction>, salt: u32) -> Block {
    txs.insert(0, coinbase(salt));
    Block {
        header: BlockHeader {
            version: BlockVersion::from_consensus(2),
            prev_blockhash: parent,
            merkle_root: TxMerkleNode::all_zeros(),
            time: salt,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: salt,
        },
        txdata: txs,
    }
}

pub fn key(byte: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    PublicKey::new(sk.public_key(&secp))
}

pub fn p2pkh(pk: &PublicKey) -> Address {
    Address::p2pkh(pk.pubkey_hash(), NETWORK)
}

pub fn outpoint(byte: u8, vout: u32) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([byte; 32]), vout)
}

/// A transaction spending `prev` with a P2PKH scriptSig for `pk`.
pub fn spend(pk: &PublicKey, prev: OutPoint) -> Transaction {
    let sig = PushBytesBuf::try_from(vec![0x30; 71]).unwrap();
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev,
            script_sig: Builder::new().push_slice(&sig).push_key(pk).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// A transaction paying `value` to `pk`'s P2PKH address.
pub fn pay_to(pk: &PublicKey, value: u64, funding: OutPoint) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2pkh(pk).script_pubkey(),
        }],
    }
}

pub fn config(watch: &[String]) -> WatchConfig {
    WatchConfig::default().with_watch_list(watch.iter().cloned())
}

/// Started service over an empty store, recording nothing.
pub async fn started(
    chain: MemChain,
    config: WatchConfig,
) -> anyhow::Result<Arc<WatchService<MemChain, MemStore>>> {
    ready_service(chain, MemStore::default(), config, Recorder::default()).await
}

/// Started service over the given collaborators.
pub async fn ready_service(
    chain: MemChain,
    store: MemStore,
    config: WatchConfig,
    hooks: Recorder,
) -> anyhow::Result<Arc<WatchService<MemChain, MemStore>>> {
    let service = WatchService::new(config, chain, store).with_hooks(hooks);
    service.start().await?;
    Ok(Arc::new(service))
}
