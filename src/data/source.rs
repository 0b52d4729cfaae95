//! The `DataSource` trait: the two ways a dataset can be read.
use crate::context::Context;
use crate::data::Column;
use crate::error::PoolError;
use futures::stream::{self, BoxStream};
use std::collections::BTreeMap;

/// Every column of a dataset, by name
pub type ColumnMap = BTreeMap<String, Column>;

/// One batch of a streaming read: an entry per requested column, in request
/// order, `None` where the source does not provide the column.
pub type RawBatch = Vec<Option<Column>>;

/// The batches of a streaming read
pub type RawBatchStream<'a> = BoxStream<'a, Result<RawBatch, PoolError>>;

/// A dataset that the ranks of a group read together.
///
/// A source implements one of two read strategies:
/// - [`read_all`](DataSource::read_all) reads the whole dataset on a single
///   rank. The data is then spread over the group and cached, and repeated
///   reads are served from the cache. Meant for small datasets.
/// - [`read_batches`](DataSource::read_batches) is a collective read in which
///   each rank produces its own section of the data, batch by batch. Nothing
///   is cached. Meant for datasets too large for one rank.
///
/// A source that implements neither cannot be read. When both are
/// implemented they must agree on the columns they provide.
pub trait DataSource: Send + Sync {
    /// Reads every column of the dataset at once. Only called on the root
    /// rank of the group.
    ///
    /// Return `Err(PoolError::NotSupported)` if the source has no bulk read,
    /// which makes readers fall back to [`read_batches`]. Any other error
    /// is fatal for the whole group.
    ///
    /// [`read_batches`]: DataSource::read_batches
    fn read_all(&self) -> Result<ColumnMap, PoolError> {
        Err(PoolError::NotSupported)
    }

    /// Reads `columns` collectively, as a finite stream of batches that can
    /// not be restarted. Every rank of `ctx`'s communicator is called, and
    /// every rank must advance its stream in lock-step with the others: the
    /// batches of different ranks belong together and producing one may
    /// involve collective operations.
    ///
    /// If `full` is set, batching is disabled and each rank reads its whole
    /// section at once.
    fn read_batches<'a>(
        &'a self,
        ctx: &'a Context,
        columns: &'a [String],
        full: bool,
    ) -> RawBatchStream<'a> {
        let _ = (ctx, columns, full);
        Box::pin(stream::once(async { Err(PoolError::NotSupported) }))
    }
}

/// Checks that a read produced data and that every column of it has the
/// same number of rows, returning that number.
pub(crate) fn verify_lengths(columns: &[&Column]) -> Result<usize, PoolError> {
    let first = columns.first().ok_or(PoolError::NoData)?;
    let len = first.len();
    if columns.iter().any(|c| c.len() != len) {
        let lengths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
        return Err(PoolError::ProtocolViolation(format!(
            "column length mismatch in read: {:?}",
            lengths
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_needs_equal_lengths() {
        let a = Column::from(vec![1.0, 2.0]);
        let b = Column::from(vec![true, false]);
        let c = Column::from(vec![3i64]);
        assert_eq!(verify_lengths(&[&a, &b]).unwrap(), 2);
        assert!(matches!(
            verify_lengths(&[&a, &c]),
            Err(PoolError::ProtocolViolation(_))
        ));
        assert!(matches!(verify_lengths(&[]), Err(PoolError::NoData)));
    }
}
