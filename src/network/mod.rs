//! A module with methods to communicate with the other ranks of a job, either
//! over TCP or in-process, as well as the `Client` and `Server`
//! implementations used to build a TCP mesh of ranks.
//!
//! Every rank owns a [`Mailbox`]. Bytes sent by other ranks arrive as
//! [`Envelope`]s and are queued in the mailbox until a receiver asks for an
//! envelope with a matching communicator context, source and tag. Delivery
//! between any two ranks is FIFO, which is what lets collective operations
//! match messages without sequence numbers.
use crate::error::PoolError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

mod client;
mod mailbox;
mod message;
mod server;
mod transport;

pub use client::Client;
pub use mailbox::Mailbox;
pub use server::Server;
pub use transport::{AbortHook, Endpoint, LocalFabric, Transport};

pub(crate) type FramedStream<T> =
    FramedRead<ReadHalf<TcpStream>, MessageCodec<T>>;
pub(crate) type FramedSink<T> =
    FramedWrite<WriteHalf<TcpStream>, MessageCodec<T>>;

/// A message for communication between nodes
#[derive(Serialize, Deserialize, Debug)]
pub struct Message<T> {
    /// The id of this message
    pub msg_id: usize,
    /// The id of the sender
    pub sender_id: usize,
    /// The id of the node this message is being sent to
    pub target_id: usize,
    /// The body of the message
    pub msg: T,
}

/// Control messages exchanged with the registration [`Server`]
#[derive(Serialize, Deserialize, Debug)]
pub enum ControlMsg {
    /// A directory message sent by the `Server` to new `Client`s once they
    /// connect to the `Server` so that they know which other `Client`s are
    /// currently connected
    Directory { dir: Vec<(usize, SocketAddr)> },
    /// An introduction that a new `Client` sends to the server with the
    /// address it accepts peer connections on
    Introduction { address: SocketAddr },
}

/// Messages exchanged directly between two ranks
#[derive(Serialize, Deserialize, Debug)]
pub enum PeerMsg {
    /// The first message on a new peer connection, identifying the sender
    Hello,
    /// Data addressed to a mailbox on the receiving rank
    Deliver(Envelope),
    /// The sender is aborting the job with the given exit code
    Abort { code: i32 },
    /// The sender is done and will close the connection without aborting
    Goodbye,
}

/// A unit of data addressed to a rank's [`Mailbox`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The id of the communicator this envelope belongs to
    pub context: u64,
    /// The world rank of the sender
    pub source: usize,
    /// The message tag
    pub tag: u32,
    /// A `bincode` serialized body
    pub payload: Vec<u8>,
}

/// Encodes and decodes length-prefixed, `bincode` serialized [`Message`]s
#[derive(Debug)]
pub struct MessageCodec<T> {
    phantom: std::marker::PhantomData<T>,
    pub(crate) codec: LengthDelimitedCodec,
}

/// Reads the next message from the given `reader`
pub(crate) async fn read_msg<T: serde::de::DeserializeOwned>(
    reader: &mut FramedStream<T>,
) -> Result<Message<T>, PoolError> {
    match reader.next().await {
        None => Err(PoolError::ConnectionClosed),
        Some(x) => Ok(x?),
    }
}

/// Send the given `message` over the given `sink`
pub(crate) async fn send_msg<T: Serialize>(
    message: Message<T>,
    sink: &mut FramedSink<T>,
) -> Result<(), PoolError> {
    sink.send(message).await
}
