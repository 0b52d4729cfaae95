//! Reading sessions on a dataset.
use crate::data::source::verify_lengths;
use crate::data::{Column, ColumnView, DataCache, DataSourceHandle, Scalar};
use crate::error::PoolError;
use async_stream::try_stream;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::ops::Index;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Default values of columns, used for columns the data source does not have
pub type Defaults = HashMap<String, Scalar>;

/// The batches handed out by [`DataStream::read`]
pub type BatchStream<'a> = BoxStream<'a, Result<Batch, PoolError>>;

/// One batch of a read: a column per requested name, all of the same length.
#[derive(Debug, Clone)]
pub struct Batch {
    names: Vec<String>,
    columns: Vec<ColumnView>,
    len: usize,
}

impl Batch {
    /// The number of rows of every column
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The column called `name`, if it was requested
    pub fn column(&self, name: &str) -> Option<&ColumnView> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The columns, in the order they were requested
    pub fn into_columns(self) -> Vec<ColumnView> {
        self.columns
    }
}

impl Index<usize> for Batch {
    type Output = ColumnView;

    fn index(&self, idx: usize) -> &ColumnView {
        &self.columns[idx]
    }
}

/// A reading session on a [`DataSourceHandle`], created by
/// [`DataSourceHandle::open`].
///
/// While open, a stream keeps the handle's cache alive. Columns the data
/// source does not provide are filled in from the stream's defaults. Close
/// the stream with [`close`](DataStream::close), or drop it.
///
/// ## Lock-step reads
/// Reading is collective. Every rank of the handle's group must call
/// [`read`](DataStream::read) with the same columns, and must then advance
/// the returned stream batch for batch together with the other ranks, until
/// it ends. A rank that stops early, or skips a batch, leaves the others
/// blocked for good.
pub struct DataStream {
    handle: DataSourceHandle,
    /// `None` once the stream is closed
    session: Mutex<Option<Arc<DataCache>>>,
    defaults: Defaults,
    nread: AtomicUsize,
}

impl DataStream {
    pub(crate) fn new(
        handle: DataSourceHandle,
        cache: Arc<DataCache>,
        defaults: Defaults,
    ) -> Self {
        let nread = if cache.is_empty() {
            0
        } else {
            cache.total_size()
        };
        DataStream {
            handle,
            session: Mutex::new(Some(cache)),
            defaults,
            nread: AtomicUsize::new(nread),
        }
    }

    /// Reads `columns`, as a stream of batches.
    ///
    /// A cached dataset is read as a single batch holding this rank's share
    /// of the cache. Otherwise the data source is read collectively batch by
    /// batch, or in a single batch per rank if `full` is set. See the
    /// type-level docs on advancing the stream in lock-step.
    ///
    /// ## Errors
    /// - `PoolError::StreamClosed` if the stream was closed
    /// - `PoolError::MissingColumn` for a column that is neither read nor
    ///   has a default
    /// - `PoolError::ProtocolViolation` if the columns of a batch differ in
    ///   length on any rank, in which case every rank fails
    /// - `PoolError::NoData` if the source provides none of the columns
    pub fn read<S: AsRef<str>>(
        &self,
        columns: &[S],
        full: bool,
    ) -> Result<BatchStream<'_>, PoolError> {
        let cache = self.cache()?;
        let columns: Vec<String> = columns.iter().map(|c| c.as_ref().to_string()).collect();

        if !cache.is_empty() {
            let raw: Vec<Option<Arc<Column>>> =
                columns.iter().map(|c| cache.get(c).cloned()).collect();
            let batch = self.blend(columns, raw, cache.columns(), cache.local_size());
            return Ok(Box::pin(futures::stream::once(async move { batch })));
        }

        self.nread.store(0, Ordering::SeqCst);
        let ctx = self.handle.context();
        let source = self.handle.source();
        Ok(Box::pin(try_stream! {
            let mut batches = source.read_batches(ctx, &columns, full);
            while let Some(raw) = batches.next().await {
                let local = match &raw {
                    Ok(raw) => {
                        let present: Vec<&Column> = raw.iter().flatten().collect();
                        match verify_lengths(&present) {
                            Ok(size) => BatchCheck::Rows(size as u64),
                            Err(PoolError::NoData) => BatchCheck::Empty,
                            Err(_) => BatchCheck::Mismatch,
                        }
                    }
                    Err(_) => BatchCheck::Failed,
                };
                // every rank must take the same decision on this batch
                let totals = ctx
                    .comm()
                    .all_reduce(local.counts(), |a, b| {
                        (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3 + b.3)
                    })
                    .await?;

                let raw = raw?;
                let size = local.decide(totals)?;
                self.nread.fetch_add(totals.0 as usize, Ordering::SeqCst);

                let present: Vec<String> = columns
                    .iter()
                    .zip(&raw)
                    .filter(|(_, c)| c.is_some())
                    .map(|(name, _)| name.clone())
                    .collect();
                let raw = raw.into_iter().map(|c| c.map(Arc::new)).collect();
                yield self.blend(columns.clone(), raw, &present, size)?;
            }
        }))
    }

    /// Replaces the absent columns of a batch by their defaults.
    fn blend(
        &self,
        names: Vec<String>,
        raw: Vec<Option<Arc<Column>>>,
        present: &[String],
        len: usize,
    ) -> Result<Batch, PoolError> {
        let mut columns = Vec::with_capacity(names.len());
        for (name, data) in names.iter().zip(raw) {
            let view = match (data, self.defaults.get(name)) {
                (Some(data), _) => ColumnView::Data(data),
                (None, Some(value)) => ColumnView::Repeated {
                    value: value.clone(),
                    len,
                },
                (None, None) => {
                    let valid: BTreeSet<String> = present
                        .iter()
                        .chain(self.defaults.keys())
                        .cloned()
                        .collect();
                    return Err(PoolError::MissingColumn {
                        column: name.clone(),
                        valid: valid.into_iter().collect(),
                    });
                }
            };
            columns.push(view);
        }
        Ok(Batch {
            names,
            columns,
            len,
        })
    }

    /// The number of rows the last read produced on all ranks together. For
    /// a cached dataset this is the size of the whole dataset; for a
    /// streaming read it counts up as batches are read.
    pub fn nread(&self) -> usize {
        self.nread.load(Ordering::SeqCst)
    }

    /// Whether `column` holds this stream's default value for `name`
    pub fn is_default(&self, name: &str, column: &ColumnView) -> bool {
        match (self.defaults.get(name), column.get(0)) {
            (Some(default), Some(first)) => *default == first,
            _ => false,
        }
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Ends the session. Reads on a closed stream fail; closing again does
    /// nothing.
    pub fn close(&self) {
        if self.lock_session().take().is_some() {
            self.handle.release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_session().is_none()
    }

    fn cache(&self) -> Result<Arc<DataCache>, PoolError> {
        self.lock_session().clone().ok_or(PoolError::StreamClosed)
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Arc<DataCache>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// What one rank found in a batch, reduced over the group so that every rank
/// takes the same decision
enum BatchCheck {
    Rows(u64),
    Empty,
    Mismatch,
    Failed,
}

impl BatchCheck {
    /// (rows, mismatched, empty, failed)
    fn counts(&self) -> (u64, u64, u64, u64) {
        match self {
            BatchCheck::Rows(n) => (*n, 0, 0, 0),
            BatchCheck::Empty => (0, 0, 1, 0),
            BatchCheck::Mismatch => (0, 1, 0, 0),
            BatchCheck::Failed => (0, 0, 0, 1),
        }
    }

    /// The number of local rows, if no rank of the group found a problem
    fn decide(&self, totals: (u64, u64, u64, u64)) -> Result<usize, PoolError> {
        let (_, mismatched, empty, failed) = totals;
        if failed > 0 {
            return Err(PoolError::ProtocolViolation(format!(
                "{} rank(s) failed to read a batch",
                failed
            )));
        }
        if mismatched > 0 {
            return Err(PoolError::ProtocolViolation(format!(
                "column lengths differ within a batch on {} rank(s)",
                mismatched
            )));
        }
        if empty > 0 {
            return Err(PoolError::NoData);
        }
        match self {
            BatchCheck::Rows(n) => Ok(*n as usize),
            _ => Err(PoolError::UnexpectedMessage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Communicator;
    use crate::context::Context;
    use crate::data::{ColumnMap, MemorySource};
    use crate::network::LocalFabric;

    fn single_rank_handle(data: ColumnMap) -> DataSourceHandle {
        let ep = LocalFabric::new(1).remove(0);
        let ctx = Context::new(Communicator::world(Arc::new(ep)));
        DataSourceHandle::new(ctx, Arc::new(MemorySource::new(data)))
    }

    #[tokio::test]
    async fn defaults_fill_missing_columns() {
        let mut data = ColumnMap::new();
        data.insert("Mass".to_string(), Column::from(vec![1.0, 2.0, 3.0]));
        let handle = single_rank_handle(data);

        let mut defaults = Defaults::new();
        defaults.insert("Weight".to_string(), Scalar::Float(1.5));
        let stream = handle.open(defaults).await.unwrap();
        let batches: Vec<Batch> = stream
            .read(&["Mass", "Weight"], false)
            .unwrap()
            .map(|b| b.unwrap())
            .collect()
            .await;

        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 3);
        assert!(!batch[0].is_repeated());
        assert!(stream.is_default("Weight", &batch[1]));
        assert!(!stream.is_default("Mass", &batch[0]));
        assert_eq!(batch[1].materialize(), Column::Float(vec![1.5; 3]));
        assert_eq!(stream.nread(), 3);
    }

    #[tokio::test]
    async fn missing_column_lists_the_valid_ones() {
        let mut data = ColumnMap::new();
        data.insert("Position".to_string(), Column::from(vec![0.0]));
        let handle = single_rank_handle(data);
        let mut defaults = Defaults::new();
        defaults.insert("Weight".to_string(), Scalar::Int(1));
        let stream = handle.open(defaults).await.unwrap();

        let mut batches = stream.read(&["Velocity"], false).unwrap();
        match batches.next().await {
            Some(Err(PoolError::MissingColumn { column, valid })) => {
                assert_eq!(column, "Velocity");
                assert_eq!(valid, vec!["Position", "Weight"]);
            }
            other => panic!("expected a missing column, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_streams_refuse_reads() {
        let mut data = ColumnMap::new();
        data.insert("A".to_string(), Column::from(vec![1i64]));
        let handle = single_rank_handle(data);
        let stream = handle.open(Defaults::new()).await.unwrap();
        assert!(handle.is_cached());

        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(!handle.is_cached());
        assert!(matches!(
            stream.read(&["A"], false),
            Err(PoolError::StreamClosed)
        ));
    }
}
