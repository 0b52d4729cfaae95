//! Distributes an array held by one rank evenly across a communicator.
use crate::comm::Communicator;
use crate::data::Column;
use crate::error::PoolError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::Range;

/// An array that can be cut into contiguous shares
pub trait Partition: Serialize + DeserializeOwned + Sized {
    /// The number of rows
    fn rows(&self) -> usize;

    /// A copy of the rows in `rows`
    fn share(&self, rows: Range<usize>) -> Self;
}

impl Partition for Column {
    fn rows(&self) -> usize {
        self.len()
    }

    fn share(&self, rows: Range<usize>) -> Self {
        self.slice(rows)
    }
}

impl<T: Serialize + DeserializeOwned + Clone> Partition for Vec<T> {
    fn rows(&self) -> usize {
        self.len()
    }

    fn share(&self, rows: Range<usize>) -> Self {
        self[rows].to_vec()
    }
}

/// The number of rows each of `parts` ranks holds when `total` rows are
/// balanced between them. Shares differ by at most one row; the lower ranks
/// hold the extra rows.
pub fn balanced_counts(total: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let extra = total % parts;
    (0..parts)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

/// Gives every member of `comm` its contiguous share of the array held by
/// `root`, sized by [`balanced_counts`].
///
/// This is a collective: every member must call it for every array being
/// distributed. Only the array passed by `root` is used, the other members
/// usually pass `None`.
pub async fn distribute<A: Partition + Send>(
    comm: &Communicator,
    array: Option<A>,
    root: usize,
) -> Result<A, PoolError> {
    let shares = if comm.rank() == root {
        let array = array.ok_or_else(|| {
            PoolError::ProtocolViolation("distribute root has no array".to_string())
        })?;
        let mut start = 0;
        let shares: Vec<A> = balanced_counts(array.rows(), comm.size())
            .into_iter()
            .map(|count| {
                let share = array.share(start..start + count);
                start += count;
                share
            })
            .collect();
        Some(shares)
    } else {
        None
    };
    comm.scatter(shares, root).await
}
