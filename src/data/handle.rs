//! Handles to datasets, which own the dataset's cache.
use crate::context::Context;
use crate::data::{DataCache, DataSource, DataStream, Defaults};
use crate::error::PoolError;
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// A dataset opened by the ranks of one group.
///
/// The handle owns the dataset's [`DataCache`]. The cache is built by the
/// first [`open`](DataSourceHandle::open) and shared by every
/// [`DataStream`] opened while it is alive. Each open stream counts as one
/// session; when the last session closes the cache is dropped, and the next
/// `open` builds it again from scratch. Hold a stream from
/// [`keep_cache`](DataSourceHandle::keep_cache) to pin the cache across
/// several streams.
///
/// All ranks of the group must open and close streams of a handle in the
/// same order, since building the cache is a collective.
#[derive(Clone)]
pub struct DataSourceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    ctx: Context,
    source: Arc<dyn DataSource>,
    size: OnceLock<usize>,
    slot: Mutex<CacheSlot>,
    /// Serializes cache builds on this rank
    build_lock: tokio::sync::Mutex<()>,
    builds: AtomicUsize,
}

#[derive(Default)]
struct CacheSlot {
    cache: Option<Arc<DataCache>>,
    sessions: usize,
}

impl DataSourceHandle {
    /// Creates a handle for `source`, read by the ranks of `ctx`
    pub fn new(ctx: Context, source: Arc<dyn DataSource>) -> Self {
        DataSourceHandle {
            inner: Arc::new(HandleInner {
                ctx,
                source,
                size: OnceLock::new(),
                slot: Mutex::new(CacheSlot::default()),
                build_lock: tokio::sync::Mutex::new(()),
                builds: AtomicUsize::new(0),
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn source(&self) -> &dyn DataSource {
        self.inner.source.as_ref()
    }

    /// The total number of rows of the dataset.
    ///
    /// ## Errors
    /// `PoolError::SizeUnknown` if the size was neither set nor learnt by
    /// caching the data.
    pub fn size(&self) -> Result<usize, PoolError> {
        self.inner.size.get().copied().ok_or(PoolError::SizeUnknown)
    }

    /// Sets the total number of rows of the dataset. The size can only be
    /// set once: setting the same size again does nothing, setting another
    /// size fails with `PoolError::SizeConflict`.
    pub fn set_size(&self, size: usize) -> Result<(), PoolError> {
        let current = *self.inner.size.get_or_init(|| size);
        if current == size {
            Ok(())
        } else {
            Err(PoolError::SizeConflict {
                current,
                requested: size,
            })
        }
    }

    /// Opens a new [`DataStream`] that fills missing columns from
    /// `defaults`. Builds the cache if no stream currently holds it, so every
    /// rank of the group must call `open` together.
    pub async fn open(&self, defaults: Defaults) -> Result<DataStream, PoolError> {
        let cache = self.acquire().await?;
        Ok(DataStream::new(self.clone(), cache, defaults))
    }

    /// Pins the cache: as long as the returned stream is open the cache is
    /// kept, even when every other stream is closed.
    pub async fn keep_cache(&self) -> Result<DataStream, PoolError> {
        self.open(Defaults::new()).await
    }

    /// The number of times the cache has been built
    pub fn cache_builds(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    /// Whether a cache is currently held by an open stream
    pub fn is_cached(&self) -> bool {
        self.lock_slot().cache.is_some()
    }

    async fn acquire(&self) -> Result<Arc<DataCache>, PoolError> {
        let _building = self.inner.build_lock.lock().await;
        {
            let mut slot = self.lock_slot();
            if let Some(cache) = slot.cache.clone() {
                slot.sessions += 1;
                return Ok(cache);
            }
        }

        let cache =
            Arc::new(DataCache::build(&self.inner.ctx, self.inner.source.as_ref()).await?);
        self.inner.builds.fetch_add(1, Ordering::SeqCst);
        if !cache.is_empty() {
            // persists even after the cache is dropped
            self.set_size(cache.total_size())?;
        }

        let mut slot = self.lock_slot();
        slot.cache = Some(cache.clone());
        slot.sessions += 1;
        Ok(cache)
    }

    /// Ends one session; the cache is dropped with the last one.
    pub(crate) fn release(&self) {
        let mut slot = self.lock_slot();
        slot.sessions = slot.sessions.saturating_sub(1);
        if slot.sessions == 0 && slot.cache.take().is_some() {
            debug!("last stream closed, dropping the data cache");
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, CacheSlot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Communicator;
    use crate::data::MemorySource;
    use crate::network::LocalFabric;

    fn single_rank_ctx() -> Context {
        let ep = LocalFabric::new(1).remove(0);
        Context::new(Communicator::world(Arc::new(ep)))
    }

    #[test]
    fn size_can_only_be_set_once() {
        let handle = DataSourceHandle::new(
            single_rank_ctx(),
            Arc::new(MemorySource::new(Default::default())),
        );
        assert!(matches!(handle.size(), Err(PoolError::SizeUnknown)));
        handle.set_size(10).unwrap();
        handle.set_size(10).unwrap();
        assert!(matches!(
            handle.set_size(20),
            Err(PoolError::SizeConflict {
                current: 10,
                requested: 20
            })
        ));
        assert_eq!(handle.size().unwrap(), 10);
    }
}
