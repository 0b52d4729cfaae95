//! The `Transport` trait and an in-process implementation of it.
use crate::error::PoolError;
use crate::network::{Envelope, Mailbox};
use futures::future::{self, BoxFuture};
use log::error;
use std::fmt;
use std::sync::Arc;

/// A function called right before a job is aborted. Used by tests to observe
/// an abort as a panic instead of a process exit.
pub type AbortHook = Arc<dyn Fn(i32) + Send + Sync>;

/// The point-to-point layer every [`Communicator`] is built on. A
/// `Transport` knows its own rank in the world, how many ranks there are,
/// how to put an [`Envelope`] into another rank's [`Mailbox`], and how to
/// tear the whole job down.
///
/// [`Communicator`]: crate::comm::Communicator
pub trait Transport: Send + Sync + fmt::Debug {
    /// The world rank of this process
    fn rank(&self) -> usize;

    /// The number of ranks in the world
    fn size(&self) -> usize;

    /// The mailbox that envelopes addressed to this rank are delivered to
    fn mailbox(&self) -> &Mailbox;

    /// Delivers `envelope` to the rank `dest`. Sending to ourselves puts the
    /// envelope straight into our own mailbox.
    fn send(
        &self,
        dest: usize,
        envelope: Envelope,
    ) -> BoxFuture<'_, Result<(), PoolError>>;

    /// Terminates every process of the job. There is no clean shutdown: a
    /// rank blocked in a collective with a dead peer would never return, so
    /// the other ranks are told to exit as well.
    fn abort(&self, code: i32) -> !;
}

/// Exits the process of `rank` with `code`, calling `hook` first if set.
pub(crate) fn terminate(rank: usize, code: i32, hook: Option<&AbortHook>) -> ! {
    error!("rank {} aborting the job with code {}", rank, code);
    if let Some(hook) = hook {
        hook(code);
    }
    std::process::exit(code)
}

/// Builds sets of [`Endpoint`]s that are wired to each other in memory, so
/// that a whole job of ranks can run inside one process.
pub struct LocalFabric;

impl LocalFabric {
    /// Creates `num_ranks` connected endpoints; endpoint `i` has rank `i`.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(num_ranks: usize) -> Vec<Endpoint> {
        LocalFabric::build(num_ranks, None)
    }

    /// Like [`LocalFabric::new`], but every endpoint calls `hook` before
    /// exiting in [`Transport::abort`].
    pub fn with_abort_hook(num_ranks: usize, hook: AbortHook) -> Vec<Endpoint> {
        LocalFabric::build(num_ranks, Some(hook))
    }

    fn build(num_ranks: usize, hook: Option<AbortHook>) -> Vec<Endpoint> {
        let mailboxes: Arc<Vec<Arc<Mailbox>>> =
            Arc::new((0..num_ranks).map(|_| Arc::new(Mailbox::new())).collect());
        (0..num_ranks)
            .map(|rank| Endpoint {
                rank,
                mailboxes: mailboxes.clone(),
                abort_hook: hook.clone(),
            })
            .collect()
    }
}

/// One rank of a [`LocalFabric`]
#[derive(Clone)]
pub struct Endpoint {
    rank: usize,
    mailboxes: Arc<Vec<Arc<Mailbox>>>,
    abort_hook: Option<AbortHook>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("rank", &self.rank)
            .field("size", &self.mailboxes.len())
            .finish()
    }
}

impl Transport for Endpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailboxes[self.rank]
    }

    fn send(
        &self,
        dest: usize,
        envelope: Envelope,
    ) -> BoxFuture<'_, Result<(), PoolError>> {
        let result = match self.mailboxes.get(dest) {
            Some(mailbox) => {
                mailbox.deliver(envelope);
                Ok(())
            }
            None => Err(PoolError::UnknownId),
        };
        Box::pin(future::ready(result))
    }

    fn abort(&self, code: i32) -> ! {
        terminate(self.rank, code, self.abort_hook.as_ref())
    }
}
