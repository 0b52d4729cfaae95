//! Represents a registration server that hands out rank ids to the
//! `Client`s of a job.
use crate::error::PoolError;
use crate::network::{read_msg, send_msg, ControlMsg, FramedSink, Message, MessageCodec};
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::split;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Represents a registration `Server` for a job of ranks.
#[derive(Debug)]
pub struct Server {
    /// The `address` of this `Server`
    pub address: SocketAddr,
    /// The id of the current message
    pub msg_id: usize,
    /// A directory which is a map of rank to the address that `Client`
    /// accepts peer connections on
    pub directory: HashMap<usize, SocketAddr>,
    /// A `TcpListener` which listens for connections from new `Client`s
    listener: TcpListener,
}

impl Server {
    /// Create a new `Server` running on the given `address` in the format of
    /// `IP:Port`.
    pub async fn new(address: &str) -> Result<Self, PoolError> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        Ok(Server {
            address,
            msg_id: 0,
            directory: HashMap::new(),
            listener,
        })
    }

    /// Registers `num_nodes` `Client`s and returns once all of them have
    /// been given an id.
    ///
    /// Each new `Client` sends a [`ControlMsg::Introduction`] with its peer
    /// address. Ranks are assigned in connection order starting at 0, and
    /// the `Client` is answered with a [`ControlMsg::Directory`] of every
    /// `Client` that registered before it, which it then connects to.
    pub async fn accept_new_connections(
        &mut self,
        num_nodes: usize,
    ) -> Result<(), PoolError> {
        while self.directory.len() < num_nodes {
            let (socket, _) = self.listener.accept().await?;
            let (reader, writer) = split(socket);
            let mut stream = FramedRead::new(reader, MessageCodec::<ControlMsg>::new());
            let mut sink: FramedSink<ControlMsg> =
                FramedWrite::new(writer, MessageCodec::new());

            let intro = read_msg(&mut stream).await?;
            let address = match intro.msg {
                ControlMsg::Introduction { address } => address,
                _ => return Err(PoolError::UnexpectedMessage),
            };

            let assigned_id = self.directory.len();
            let mut dir: Vec<(usize, SocketAddr)> =
                self.directory.iter().map(|(k, v)| (*k, *v)).collect();
            dir.sort_unstable();
            let reply = Message::new(
                self.msg_id,
                usize::MAX,
                assigned_id,
                ControlMsg::Directory { dir },
            );
            send_msg(reply, &mut sink).await?;
            self.msg_id += 1;

            if self.directory.insert(assigned_id, address).is_some() {
                return Err(PoolError::ReconnectionError);
            }
            info!("Registered rank {} at address {}", assigned_id, address);
        }
        Ok(())
    }
}
