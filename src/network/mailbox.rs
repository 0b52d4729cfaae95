//! The queue of envelopes received by one rank.
use crate::network::Envelope;
use log::debug;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

/// Holds every [`Envelope`] delivered to a rank that no receiver has taken
/// yet. Receivers select envelopes by communicator context, and optionally
/// by source and tag; envelopes that match are handed out in arrival order.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    notifier: Notify,
}

impl Mailbox {
    /// Creates an empty `Mailbox`
    pub fn new() -> Self {
        Mailbox::default()
    }

    /// Adds an envelope to the queue and wakes all waiting receivers.
    pub fn deliver(&self, envelope: Envelope) {
        {
            let mut queue =
                self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push_back(envelope);
        }
        self.notifier.notify_waiters();
    }

    /// Waits until an envelope for `context` from `source` (any source when
    /// `None`) with `tag` (any tag when `None`) is queued, and removes it.
    pub async fn recv(
        &self,
        context: u64,
        source: Option<usize>,
        tag: Option<u32>,
    ) -> Envelope {
        loop {
            // register interest before looking so a delivery between the
            // check and the await is not missed
            let notified = self.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(envelope) = self.take(context, source, tag) {
                return envelope;
            }
            debug!(
                "waiting for context {} source {:?} tag {:?}",
                context, source, tag
            );
            notified.await;
        }
    }

    /// The number of envelopes nobody has received yet
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take(
        &self,
        context: u64,
        source: Option<usize>,
        tag: Option<u32>,
    ) -> Option<Envelope> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = queue.iter().position(|e| {
            e.context == context
                && source.map_or(true, |s| e.source == s)
                && tag.map_or(true, |t| e.tag == t)
        })?;
        queue.remove(idx)
    }
}
