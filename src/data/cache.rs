//! The per-rank cache of a dataset read in bulk.
use crate::context::Context;
use crate::data::source::verify_lengths;
use crate::data::{Column, DataSource};
use crate::error::PoolError;
use crate::scatter::distribute;
use deepsize::DeepSizeOf;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// The rank that reads the dataset in bulk
const ROOT: usize = 0;

/// This rank's share of a dataset that was read with
/// [`DataSource::read_all`]. A cache without columns means the source has no
/// bulk read and must be read in batches instead.
#[derive(Debug, Default)]
pub struct DataCache {
    columns: Vec<String>,
    data: HashMap<String, Arc<Column>>,
    local_size: usize,
    total_size: usize,
}

/// What the root found when it tried the bulk read
#[derive(Debug, Serialize, Deserialize)]
enum BulkOutcome {
    Read,
    Unsupported,
    Failed(String),
}

/// What the root found when it checked the shape of the bulk data
#[derive(Debug, Serialize, Deserialize)]
enum Verified {
    Rows(usize),
    NoData,
    Mismatch(String),
}

impl DataCache {
    /// An empty cache
    pub fn empty() -> Self {
        DataCache::default()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The names of the cached columns
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// This rank's share of the column `name`
    pub fn get(&self, name: &str) -> Option<&Arc<Column>> {
        self.data.get(name)
    }

    /// The number of rows cached on this rank
    pub fn local_size(&self) -> usize {
        self.local_size
    }

    /// The number of rows cached on all ranks together
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// The memory held by the cached columns, in bytes
    pub fn deep_size(&self) -> usize {
        self.data.values().map(|c| Column::deep_size_of(c)).sum()
    }

    /// Builds the cache of `source` on every rank of `ctx`. This is a
    /// collective.
    ///
    /// 1. The root rank tries [`DataSource::read_all`].
    /// 2. The outcome is broadcast. A source without bulk read gives every
    ///    rank an empty cache; a failed read fails every rank.
    /// 3. The root broadcasts the column names and the number of rows, after
    ///    checking that there is data and that all columns have the same
    ///    number of rows.
    /// 4. Each column is distributed so that every rank holds a contiguous,
    ///    balanced share of the rows.
    pub async fn build(
        ctx: &Context,
        source: &dyn DataSource,
    ) -> Result<DataCache, PoolError> {
        let comm = ctx.comm();
        let is_root = comm.rank() == ROOT;

        let mut bulk = None;
        let outcome = if is_root {
            Some(match source.read_all() {
                Ok(data) => {
                    bulk = Some(data);
                    BulkOutcome::Read
                }
                Err(PoolError::NotSupported) => BulkOutcome::Unsupported,
                Err(e) => BulkOutcome::Failed(e.to_string()),
            })
        } else {
            None
        };
        match comm.broadcast(outcome, ROOT).await? {
            BulkOutcome::Read => (),
            BulkOutcome::Unsupported => {
                debug!("data source has no bulk read, using an empty cache");
                return Ok(DataCache::empty());
            }
            BulkOutcome::Failed(msg) => return Err(PoolError::ReadFailure(msg)),
        }

        let (names, mut arrays): (Vec<String>, Vec<Column>) =
            bulk.unwrap_or_default().into_iter().unzip();
        let columns = comm.broadcast(is_root.then(|| names), ROOT).await?;

        let verified = if is_root {
            let refs: Vec<&Column> = arrays.iter().collect();
            Some(match verify_lengths(&refs) {
                Ok(rows) => Verified::Rows(rows),
                Err(PoolError::NoData) => Verified::NoData,
                Err(e) => Verified::Mismatch(e.to_string()),
            })
        } else {
            None
        };
        let total_size = match comm.broadcast(verified, ROOT).await? {
            Verified::Rows(rows) => rows,
            Verified::NoData => return Err(PoolError::NoData),
            Verified::Mismatch(msg) => return Err(PoolError::ProtocolViolation(msg)),
        };

        // the root hands its arrays out front to back
        arrays.reverse();
        let mut data = HashMap::with_capacity(columns.len());
        let mut local_sizes = Vec::with_capacity(columns.len());
        for name in &columns {
            let share = distribute(comm, arrays.pop(), ROOT).await?;
            local_sizes.push(share.len());
            data.insert(name.clone(), Arc::new(share));
        }
        let local_size = local_sizes.first().copied().unwrap_or(0);
        if local_sizes.iter().any(|s| *s != local_size) {
            return Err(PoolError::ProtocolViolation(format!(
                "distributing data resulted in uneven lengths between columns: {:?}",
                local_sizes
            )));
        }

        let cache = DataCache {
            columns,
            data,
            local_size,
            total_size,
        };
        info!(
            "cached columns {:?}: {} of {} rows on this rank, {} bytes",
            cache.columns,
            local_size,
            total_size,
            cache.deep_size()
        );
        Ok(cache)
    }
}
