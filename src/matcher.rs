//! Transaction matching: decode, resolve each input to an address and
//! credit inputs that spend from watched addresses.
use std::collections::HashMap;

use bitcoin::{
    consensus::{self, encode},
    script::Instruction,
    Address, CompressedPublicKey, Network, OutPoint, PublicKey, Script, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{chain_source::ChainSource, state::WatchState};

/// A transaction as it arrives: raw bytes from the node, or already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionInput {
    /// Consensus-encoded bytes.
    Raw(Vec<u8>),
    /// A decoded transaction.
    Decoded(Transaction),
}

impl TransactionInput {
    /// Raw input from a hex string, as most node RPCs deliver it.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self::Raw(hex::decode(s.trim())?))
    }

    /// Decode into the canonical [`Transaction`].
    pub fn decode(self) -> Result<Transaction, encode::Error> {
        match self {
            Self::Raw(bytes) => consensus::deserialize(&bytes),
            Self::Decoded(tx) => Ok(tx),
        }
    }
}

impl From<Transaction> for TransactionInput {
    fn from(tx: Transaction) -> Self {
        Self::Decoded(tx)
    }
}

impl From<Vec<u8>> for TransactionInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes)
    }
}

/// One input, reduced to what matching needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchInput {
    /// Position in the transaction's input list.
    pub vin: usize,
    /// Address the input spends from, when resolvable.
    pub address: Option<String>,
    /// Value of the linked output, when known.
    pub value: Option<u64>,
}

/// Canonical, decoded transaction ready for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTx {
    /// Transaction id.
    pub txid: Txid,
    /// Inputs in order.
    pub inputs: Vec<WatchInput>,
}

/// One input that spent from a watched address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputMatch {
    /// Spending transaction.
    pub txid: Txid,
    /// Input index.
    pub vin: usize,
    /// Watched address.
    pub address: String,
    /// Credited amount in satoshis.
    pub value: u64,
}

/// Result of matching one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMatch {
    /// Transaction id.
    pub txid: Txid,
    /// Matched inputs, in input order.
    pub matches: Vec<InputMatch>,
    /// Skipped because the txid was already credited (dedup only).
    pub duplicate: bool,
    /// Hits reached the watch list size after this transaction, so the
    /// diagnostic summary was logged.
    pub covers_watch_list: bool,
}

impl TxMatch {
    /// Sum credited by this transaction.
    pub fn amount(&self) -> u64 {
        self.matches
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.value))
    }
}

/// Outputs created earlier in the same block, keyed by outpoint.
pub type PrevoutMap = HashMap<OutPoint, TxOut>;

/// Resolve the address an input spends from.
///
/// The spending script is tried first: a `<sig> <pubkey>` scriptSig is
/// P2PKH, any other push-only scriptSig is P2SH of its last push (this
/// covers P2SH-wrapped segwit), and an empty scriptSig falls back to the
/// witness (P2WPKH for `<sig> <compressed key>`, otherwise P2WSH of the
/// witness script). When that fails, the linked output's scriptPubKey is
/// used.
pub fn resolve_input_address(
    txin: &TxIn,
    prevout: Option<&TxOut>,
    network: Network,
) -> Option<Address> {
    spending_script_address(txin, network)
        .or_else(|| prevout.and_then(|o| Address::from_script(&o.script_pubkey, network).ok()))
}

fn spending_script_address(txin: &TxIn, network: Network) -> Option<Address> {
    if !txin.script_sig.is_empty() {
        return script_sig_address(&txin.script_sig, network);
    }
    witness_address(&txin.witness, network)
}

fn script_sig_address(script_sig: &Script, network: Network) -> Option<Address> {
    let pushes = script_sig
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::PushBytes(p)) => Some(p.as_bytes()),
            _ => None,
        })
        .collect::<Option<Vec<&[u8]>>>()?;

    if let [_sig, key] = pushes.as_slice() {
        if let Ok(pk) = PublicKey::from_slice(key) {
            return Some(Address::p2pkh(pk.pubkey_hash(), network));
        }
    }

    let redeem = pushes.last().filter(|b| !b.is_empty())?;
    Address::p2sh(Script::from_bytes(redeem), network).ok()
}

fn witness_address(witness: &Witness, network: Network) -> Option<Address> {
    // A lone element is a taproot key-path signature: nothing to resolve.
    if witness.len() < 2 {
        return None;
    }
    let last = witness.last()?;
    if witness.len() == 2 {
        if let Ok(pk) = CompressedPublicKey::from_slice(last) {
            return Some(Address::p2wpkh(&pk, network));
        }
    }
    Some(Address::p2wsh(Script::from_bytes(last), network))
}

/// Decode `input` once and link every input to its address and value.
///
/// Prevouts are looked up in `local` first (outputs created earlier in the
/// same block), then asked from the chain source. A failed lookup only
/// leaves that input unvalued.
pub async fn prepare_transaction<C>(
    input: TransactionInput,
    chain: &C,
    local: Option<&PrevoutMap>,
) -> Result<(Transaction, WatchTx), encode::Error>
where
    C: ChainSource + ?Sized,
{
    let tx = input.decode()?;
    let txid = tx.compute_txid();
    let network = chain.network();

    let mut inputs = Vec::with_capacity(tx.input.len());
    for (vin, txin) in tx.input.iter().enumerate() {
        if txin.previous_output.is_null() {
            // coinbase
            inputs.push(WatchInput {
                vin,
                address: None,
                value: None,
            });
            continue;
        }

        let prevout = match local.and_then(|m| m.get(&txin.previous_output)) {
            Some(out) => Some(out.clone()),
            None => match chain.get_prevout(txin.previous_output).await {
                Ok(out) => out,
                Err(e) => {
                    warn!(%txid, vin, "prevout lookup failed: {e:#}");
                    None
                }
            },
        };

        inputs.push(WatchInput {
            vin,
            address: resolve_input_address(txin, prevout.as_ref(), network).map(|a| a.to_string()),
            value: prevout.map(|o| o.value.to_sat()),
        });
    }

    Ok((tx, WatchTx { txid, inputs }))
}

/// Credit every input of `tx` that spends from a watched address.
///
/// Inputs without a resolvable address, or without a linked output, are
/// skipped. After every transaction, duplicates included, the diagnostic
/// summary is logged once the hit count covers the watch list.
pub fn match_transaction(state: &mut WatchState, tx: &WatchTx) -> TxMatch {
    debug!(txid = %tx.txid, inputs = tx.inputs.len(), "transaction found");

    if state.is_credited(&tx.txid) {
        debug!(txid = %tx.txid, "transaction already credited, skipping");
        return TxMatch {
            txid: tx.txid,
            matches: Vec::new(),
            duplicate: true,
            covers_watch_list: log_summary_if_covered(state),
        };
    }

    let mut matches = Vec::new();
    for input in &tx.inputs {
        let Some(address) = input.address.as_deref() else {
            continue;
        };
        if !state.watch_list().contains(address) {
            continue;
        }
        let Some(value) = input.value else {
            debug!(
                txid = %tx.txid,
                vin = input.vin,
                address,
                "watched input has no linked output"
            );
            continue;
        };

        state.record_hit(value);
        info!(
            txid = %tx.txid,
            vin = input.vin,
            address,
            amount = value,
            "got some coins: {value} satoshis"
        );
        matches.push(InputMatch {
            txid: tx.txid,
            vin: input.vin,
            address: address.to_owned(),
            value,
        });
    }

    if !matches.is_empty() {
        state.mark_credited(tx.txid);
    }
    TxMatch {
        txid: tx.txid,
        matches,
        duplicate: false,
        covers_watch_list: log_summary_if_covered(state),
    }
}

fn log_summary_if_covered(state: &WatchState) -> bool {
    let covered = state.hits_cover_watch_list();
    if covered {
        state.log_summary();
    }
    covered
}

/// Prepare and match in one step, holding the state lock only while matching.
pub(crate) async fn process_transaction<C>(
    chain: &C,
    state: &Mutex<WatchState>,
    input: TransactionInput,
    local: Option<&PrevoutMap>,
) -> Result<(Transaction, TxMatch), encode::Error>
where
    C: ChainSource + ?Sized,
{
    let (tx, prepared) = prepare_transaction(input, chain, local).await?;
    let outcome = match_transaction(&mut *state.lock().await, &prepared);
    Ok((tx, outcome))
}
