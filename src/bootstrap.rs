//! Fixture bootstrap: restore the watch list and running total from the
//! record store, or seed the store on first run.
use anyhow::Context;
use futures::future::try_join_all;
use tracing::info;

use crate::{
    state::WatchList,
    store::{Record, RecordContent, RecordStore},
};

/// What bootstrap loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    /// Watched addresses.
    pub watch_list: WatchList,
    /// Sum of every numeric sub-value across the stored records.
    pub total_amount: i64,
    /// True when the store was empty and the defaults were written.
    pub seeded: bool,
}

/// Load the watch list from `store`.
///
/// A populated store wins: its record names become the watch list and
/// their numeric sub-values are summed. An empty store is seeded with one
/// empty record per default address. Reads and writes fan out
/// concurrently; the first failure aborts bootstrap.
pub async fn load_fixtures<R>(store: &R, defaults: &[String]) -> anyhow::Result<Bootstrap>
where
    R: RecordStore + ?Sized,
{
    let names = store.list().await.context("list address records")?;

    if !names.is_empty() {
        let contents = try_join_all(names.iter().map(|name| async move {
            store
                .read(name)
                .await
                .with_context(|| format!("read record {name}"))
        }))
        .await?;

        let total_amount = contents
            .iter()
            .map(RecordContent::numeric_sum)
            .fold(0i64, i64::saturating_add);

        info!(records = names.len(), total_amount, "restored watch list from store");
        return Ok(Bootstrap {
            watch_list: names.into_iter().collect(),
            total_amount,
            seeded: false,
        });
    }

    let watch_list: WatchList = defaults.iter().cloned().collect();
    let empty = Record::new();
    try_join_all(watch_list.iter().map(|address| {
        let empty = &empty;
        async move {
            store
                .write(address, empty)
                .await
                .with_context(|| format!("seed record {address}"))
        }
    }))
    .await?;

    info!(records = watch_list.len(), "seeded empty store with default watch list");
    Ok(Bootstrap {
        watch_list,
        total_amount: 0,
        seeded: true,
    })
}
