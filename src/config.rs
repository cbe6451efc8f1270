//! Watcher configuration.
use std::{path::Path, path::PathBuf, time::Duration};

use anyhow::Context;
use bitcoin::Network;
use serde::{Deserialize, Serialize};

/// Options handed to [`WatchService`](crate::WatchService) by the host.
///
/// Every field has a default, so a partial JSON document (or `{}`) is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WatchConfig {
    /// Root directory of the per-address record store.
    pub data_dir: PathBuf,
    /// Network used to encode addresses resolved from spending scripts.
    pub network: Network,
    /// Addresses seeded into an empty store on first start.
    pub default_watch_list: Vec<String>,
    /// Upper bound on a single block fetch.
    pub fetch_timeout_secs: u64,
    /// How many accepted blocks are remembered for ancestor search.
    pub max_reorg_depth: u32,
    /// Consecutive parent-hash mismatches tolerated before giving up.
    pub max_reorg_retries: u32,
    /// Credit each transaction id at most once across the `tx` and block paths.
    pub dedup_txids: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            network: Network::Regtest,
            default_watch_list: Vec::new(),
            fetch_timeout_secs: 30,
            max_reorg_depth: 100,
            max_reorg_retries: 3,
            dedup_txids: false,
        }
    }
}

impl WatchConfig {
    /// Parse a JSON document.
    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        serde_json::from_str(s).context("parse watcher config")
    }

    /// Read and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Builder-style override of the default watch list.
    pub fn with_watch_list<I, A>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.default_watch_list = addrs.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style override of the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Per-fetch timeout as a [`Duration`].
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = WatchConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, WatchConfig::default());
        assert_eq!(cfg.fetch_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn kebab_case_fields_override_defaults() {
        let cfg = WatchConfig::from_json_str(
            r#"{
                "data-dir": "/tmp/watch",
                "network": "testnet",
                "default-watch-list": ["2Mxs1sYMGh2dR5tHBLCMnhdjMim8Kvn88wW"],
                "max-reorg-retries": 7,
                "dedup-txids": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/watch"));
        assert_eq!(cfg.network, Network::Testnet);
        assert_eq!(cfg.default_watch_list.len(), 1);
        assert_eq!(cfg.max_reorg_retries, 7);
        assert!(cfg.dedup_txids);
        assert_eq!(cfg.max_reorg_depth, 100);
    }
}
