//! Collective, cache-aware reading of datasets.
//!
//! A [`DataSource`] is opened through a [`DataSourceHandle`], which every
//! rank of a group creates around the same source. Each
//! [`open`](DataSourceHandle::open) returns a [`DataStream`] whose
//! [`read`](DataStream::read) hands out [`Batch`]es of the requested
//! columns, with missing columns filled in from default values.
//!
//! Small datasets are read once by the group's root rank, spread evenly over
//! the group and cached by the handle for as long as a stream is open.
//! Large datasets are read collectively, each rank reading its own section
//! batch by batch.
mod cache;
mod column;
mod handle;
mod memory;
mod source;
mod stream;

pub use cache::DataCache;
pub use column::{Column, ColumnView, Scalar};
pub use handle::DataSourceHandle;
pub use memory::{Chunks, IterSource, MemorySource};
pub use source::{ColumnMap, DataSource, RawBatch, RawBatchStream};
pub use stream::{Batch, BatchStream, DataStream, Defaults};
