//! Process groups and the collective operations between their members.
//!
//! A [`Communicator`] is an ordered group of ranks. Its members can send each
//! other point-to-point messages and perform collective operations:
//! `broadcast`, `scatter`, `gather`, `all_reduce` and `barrier`.
//!
//! **Every collective is a rendezvous.** All members of a communicator must
//! call the same collectives in the same order. A code path that lets only
//! some members reach a collective is a deadlock, not an error: the members
//! that got there wait forever for the ones that did not.
use crate::error::PoolError;
use crate::network::{Envelope, Transport};
use bincode::{deserialize, serialize};
use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tags at or above this value are reserved for collective operations
pub const RESERVED_TAG_BASE: u32 = 0xFFFF_0000;
const TAG_BCAST: u32 = RESERVED_TAG_BASE;
const TAG_GATHER: u32 = RESERVED_TAG_BASE + 1;
const TAG_SCATTER: u32 = RESERVED_TAG_BASE + 2;

const WORLD_CONTEXT: u64 = 0;

/// Where a received message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// The rank of the sender within the communicator
    pub source: usize,
    /// The tag the message was sent with
    pub tag: u32,
}

/// An ordered group of ranks that can communicate with each other.
/// Cloning a `Communicator` is cheap and the clone refers to the same group.
#[derive(Clone)]
pub struct Communicator {
    transport: Arc<dyn Transport>,
    context: u64,
    /// World ranks of the members, indexed by rank in this communicator
    members: Arc<Vec<usize>>,
    rank: usize,
    splits: Arc<AtomicU64>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("context", &self.context)
            .field("rank", &self.rank)
            .field("members", &self.members)
            .finish()
    }
}

impl Communicator {
    /// The communicator of every rank reachable through `transport`
    pub fn world(transport: Arc<dyn Transport>) -> Self {
        let members = (0..transport.size()).collect();
        let rank = transport.rank();
        Communicator {
            transport,
            context: WORLD_CONTEXT,
            members: Arc::new(members),
            rank,
            splits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The rank of this process within the communicator
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of members of the communicator
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The world rank of the member with the given `rank`, or `None` if
    /// there is no such member
    pub fn world_rank(&self, rank: usize) -> Option<usize> {
        self.members.get(rank).copied()
    }

    /// The world ranks of all members, in communicator rank order
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// The id that separates this communicator's messages from the messages
    /// of every other communicator
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Sends `value` to the member `dest` with the given `tag`. Tags at or
    /// above [`RESERVED_TAG_BASE`] belong to the collective operations.
    pub async fn send<T: Serialize>(
        &self,
        dest: usize,
        tag: u32,
        value: &T,
    ) -> Result<(), PoolError> {
        self.send_bytes(dest, tag, serialize(value)?).await
    }

    /// Receives a message from `source` (any member when `None`) with `tag`
    /// (any tag when `None`).
    pub async fn recv<T: DeserializeOwned>(
        &self,
        source: Option<usize>,
        tag: Option<u32>,
    ) -> Result<(T, Status), PoolError> {
        let envelope = self.recv_envelope(source, tag).await?;
        let source = self
            .members
            .iter()
            .position(|r| *r == envelope.source)
            .ok_or(PoolError::UnknownId)?;
        let status = Status {
            source,
            tag: envelope.tag,
        };
        Ok((deserialize(&envelope.payload)?, status))
    }

    /// Sends the `value` held by `root` to every member. Only the value given
    /// by `root` is used; the others may pass `None`.
    pub async fn broadcast<T: Serialize + DeserializeOwned>(
        &self,
        value: Option<T>,
        root: usize,
    ) -> Result<T, PoolError> {
        if self.rank == root {
            let value = value.ok_or_else(|| {
                PoolError::ProtocolViolation(
                    "broadcast root has no value to send".to_string(),
                )
            })?;
            let payload = serialize(&value)?;
            for dest in (0..self.size()).filter(|r| *r != root) {
                self.send_bytes(dest, TAG_BCAST, payload.clone()).await?;
            }
            Ok(value)
        } else {
            let envelope = self.recv_envelope(Some(root), Some(TAG_BCAST)).await?;
            Ok(deserialize(&envelope.payload)?)
        }
    }

    /// Collects one value from every member on `root`, in rank order. Returns
    /// `Some` on `root` and `None` everywhere else.
    pub async fn gather<T: Serialize + DeserializeOwned>(
        &self,
        value: T,
        root: usize,
    ) -> Result<Option<Vec<T>>, PoolError> {
        if self.rank != root {
            self.send(root, TAG_GATHER, &value).await?;
            return Ok(None);
        }
        let mut own = Some(value);
        let mut values = Vec::with_capacity(self.size());
        for source in 0..self.size() {
            if source == root {
                values.extend(own.take());
            } else {
                let envelope =
                    self.recv_envelope(Some(source), Some(TAG_GATHER)).await?;
                values.push(deserialize(&envelope.payload)?);
            }
        }
        Ok(Some(values))
    }

    /// Collects one value from every member on every member, in rank order.
    pub async fn all_gather<T: Serialize + DeserializeOwned>(
        &self,
        value: T,
    ) -> Result<Vec<T>, PoolError> {
        let gathered = self.gather(value, 0).await?;
        self.broadcast(gathered, 0).await
    }

    /// Combines the values of all members with `op` and gives every member
    /// the result. Values are combined in rank order.
    pub async fn all_reduce<T, F>(&self, value: T, op: F) -> Result<T, PoolError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
    {
        let reduced = self
            .gather(value, 0)
            .await?
            .and_then(|values| values.into_iter().reduce(op));
        self.broadcast(reduced, 0).await
    }

    /// The sum of `value` over all members
    pub async fn all_reduce_sum(&self, value: u64) -> Result<u64, PoolError> {
        self.all_reduce(value, |a, b| a + b).await
    }

    /// Blocks until every member has reached the barrier.
    pub async fn barrier(&self) -> Result<(), PoolError> {
        self.gather((), 0).await?;
        self.broadcast(Some(()), 0).await
    }

    /// Hands item `i` of the vector held by `root` to member `i`. The vector
    /// must have exactly one item per member.
    pub async fn scatter<T: Serialize + DeserializeOwned>(
        &self,
        values: Option<Vec<T>>,
        root: usize,
    ) -> Result<T, PoolError> {
        if self.rank != root {
            let envelope = self.recv_envelope(Some(root), Some(TAG_SCATTER)).await?;
            return Ok(deserialize(&envelope.payload)?);
        }
        let values = values.unwrap_or_default();
        if values.len() != self.size() {
            return Err(PoolError::ProtocolViolation(format!(
                "scatter needs {} values but root has {}",
                self.size(),
                values.len()
            )));
        }
        let mut own = None;
        for (dest, value) in values.into_iter().enumerate() {
            if dest == root {
                own = Some(value);
            } else {
                self.send(dest, TAG_SCATTER, &value).await?;
            }
        }
        own.ok_or(PoolError::UnknownId)
    }

    /// Splits this communicator into disjoint communicators, one per distinct
    /// `color`. Members of a new communicator are ordered by `key`, ties
    /// broken by their rank in this communicator. Every member must call
    /// `split`.
    pub async fn split(&self, color: u32, key: usize) -> Result<Communicator, PoolError> {
        let everyone = self.all_gather((color, key)).await?;
        let seq = self.splits.fetch_add(1, Ordering::SeqCst);

        let mut group: Vec<(usize, usize)> = everyone
            .iter()
            .enumerate()
            .filter(|(_, (c, _))| *c == color)
            .map(|(rank, (_, k))| (*k, rank))
            .collect();
        group.sort_unstable();
        let members: Vec<usize> =
            group.iter().map(|(_, rank)| self.members[*rank]).collect();
        let rank = group
            .iter()
            .position(|(_, r)| *r == self.rank)
            .ok_or(PoolError::UnknownId)?;
        let context = derive_context(self.context, seq, color);
        debug!(
            "split context {} into context {} with world ranks {:?}",
            self.context, context, members
        );

        Ok(Communicator {
            transport: self.transport.clone(),
            context,
            members: Arc::new(members),
            rank,
            splits: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Terminates every process of the job, not only the members of this
    /// communicator. This is the only way a failed rank leaves a job.
    pub fn abort(&self, reason: &str) -> ! {
        error!(
            "an exception has occurred on world rank {}...all ranks exiting: {}",
            self.transport.rank(),
            reason
        );
        self.transport.abort(1)
    }

    async fn send_bytes(
        &self,
        dest: usize,
        tag: u32,
        payload: Vec<u8>,
    ) -> Result<(), PoolError> {
        let world_dest = *self.members.get(dest).ok_or(PoolError::UnknownId)?;
        let envelope = Envelope {
            context: self.context,
            source: self.transport.rank(),
            tag,
            payload,
        };
        self.transport.send(world_dest, envelope).await
    }

    async fn recv_envelope(
        &self,
        source: Option<usize>,
        tag: Option<u32>,
    ) -> Result<Envelope, PoolError> {
        let world_source = match source {
            Some(s) => Some(*self.members.get(s).ok_or(PoolError::UnknownId)?),
            None => None,
        };
        Ok(self
            .transport
            .mailbox()
            .recv(self.context, world_source, tag)
            .await)
    }
}

/// Mixes a parent context, split sequence number and color into a new
/// context id. Every member computes the same id without communicating.
fn derive_context(parent: u64, seq: u64, color: u32) -> u64 {
    let mut x = parent
        ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (u64::from(color) + 1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    // zero is the world context
    x.max(1)
}
