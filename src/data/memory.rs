//! Data sources over data that is already in memory.
use crate::context::Context;
use crate::data::source::{DataSource, RawBatchStream};
use crate::data::{Column, ColumnMap};
use crate::error::PoolError;
use crate::scatter::distribute;
use async_stream::try_stream;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

const ROOT: usize = 0;

/// A dataset held by the root rank, read in bulk and then cached.
#[derive(Debug, Default)]
pub struct MemorySource {
    data: ColumnMap,
    reads: AtomicUsize,
}

impl MemorySource {
    pub fn new(data: ColumnMap) -> Self {
        MemorySource {
            data,
            reads: AtomicUsize::new(0),
        }
    }

    /// How many times the data was read in bulk
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl DataSource for MemorySource {
    fn read_all(&self) -> Result<ColumnMap, PoolError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.clone())
    }
}

/// The chunks of a dataset, in order
pub type Chunks = Box<dyn Iterator<Item = ColumnMap> + Send>;

/// A dataset that is only read in batches, never cached.
///
/// The root rank pulls the dataset chunk by chunk from an iterator made by
/// `chunks`, and every chunk is spread evenly over the group. Columns a
/// chunk does not have are absent from the batch on every rank.
pub struct IterSource {
    chunks: Box<dyn Fn() -> Chunks + Send + Sync>,
}

impl fmt::Debug for IterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterSource").finish_non_exhaustive()
    }
}

/// What the root has for the group next
#[derive(Debug, Serialize, Deserialize)]
enum Step {
    /// A chunk, and which of the requested columns it has
    Batch(Vec<bool>),
    Stop,
    Failed(String),
}

impl IterSource {
    /// A source whose every read starts over with a fresh iterator from
    /// `chunks`
    pub fn new<F>(chunks: F) -> Self
    where
        F: Fn() -> Chunks + Send + Sync + 'static,
    {
        IterSource {
            chunks: Box::new(chunks),
        }
    }

    /// The next chunk, or all remaining chunks joined into one if `full`
    fn next_chunk(chunks: &mut Chunks, full: bool) -> Result<Option<ColumnMap>, PoolError> {
        if !full {
            return Ok(chunks.next());
        }
        let mut joined: Option<ColumnMap> = None;
        for chunk in chunks {
            match joined.as_mut() {
                None => joined = Some(chunk),
                Some(acc) => {
                    for (name, column) in chunk {
                        match acc.get_mut(&name) {
                            Some(existing) => existing.extend(column)?,
                            None => {
                                acc.insert(name, column);
                            }
                        }
                    }
                }
            }
        }
        Ok(joined)
    }
}

impl DataSource for IterSource {
    fn read_batches<'a>(
        &'a self,
        ctx: &'a Context,
        columns: &'a [String],
        full: bool,
    ) -> RawBatchStream<'a> {
        Box::pin(try_stream! {
            let comm = ctx.comm();
            let mut chunks = (comm.rank() == ROOT).then(|| (self.chunks)());
            let mut exhausted = false;
            let mut nbatch = 0usize;
            loop {
                let mut chunk = None;
                let step = match chunks.as_mut() {
                    Some(_) if exhausted => Some(Step::Stop),
                    Some(it) => Some(match IterSource::next_chunk(it, full) {
                        Ok(Some(map)) => {
                            exhausted = full;
                            let present = columns.iter().map(|c| map.contains_key(c)).collect();
                            chunk = Some(map);
                            Step::Batch(present)
                        }
                        Ok(None) => Step::Stop,
                        Err(e) => Step::Failed(e.to_string()),
                    }),
                    None => None,
                };
                let present = match comm.broadcast(step, ROOT).await? {
                    Step::Batch(present) => present,
                    Step::Stop => break,
                    Step::Failed(msg) => Err(PoolError::ReadFailure(msg))?,
                };

                let mut batch: Vec<Option<Column>> = Vec::with_capacity(columns.len());
                for (name, present) in columns.iter().zip(present) {
                    if present {
                        let array = chunk.as_ref().and_then(|c| c.get(name).cloned());
                        batch.push(Some(distribute(comm, array, ROOT).await?));
                    } else {
                        batch.push(None);
                    }
                }
                nbatch += 1;
                debug!("read batch {} of columns {:?}", nbatch, columns);
                yield batch;
            }
        })
    }
}
