//! Represents a rank of a job running on its own process, connected to every
//! other rank over TCP.
use crate::error::PoolError;
use crate::network::transport::terminate;
use crate::network::{
    read_msg, send_msg, AbortHook, ControlMsg, Envelope, FramedSink, FramedStream,
    Mailbox, Message, MessageCodec, PeerMsg, Transport,
};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

/// A connection to another `Client`, used for sending directed communication
#[derive(Debug)]
struct Connection {
    /// The `IP:Port` of another `Client` that we're connected to
    address: SocketAddr,
    /// The buffered stream used for sending messages to the other `Client`
    sink: Mutex<FramedSink<PeerMsg>>,
}

/// Represents a `Client` rank in a job. Every `Client` holds one connection
/// to every other `Client`; messages read from those connections are put
/// into this `Client`s [`Mailbox`].
///
/// A peer connection that closes before the peer said
/// [`PeerMsg::Goodbye`] means that rank died, and the job is aborted.
pub struct Client {
    /// The `id` of this `Client`, assigned by the [`Server`] on startup
    /// to be monotonically increasing based on the order of connections
    ///
    /// [`Server`]: crate::network::Server
    pub id: usize,
    /// The number of `Client`s in the job
    pub num_nodes: usize,
    /// The address this `Client` accepts peer connections on
    pub address: SocketAddr,
    /// The id of the next message
    msg_id: AtomicUsize,
    /// A directory which is a map of client id to the [`Connection`] with that
    /// `Client`
    directory: HashMap<usize, Connection>,
    mailbox: Arc<Mailbox>,
    abort_hook: Option<AbortHook>,
}

/// How long an aborting `Client` waits to tell its peers before exiting
const ABORT_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

impl Client {
    /// Create a new [`Client`] that accepts peer connections on `my_ip` and
    /// joins the job registered by the [`Server`] at `server_addr`.
    ///
    /// Constructing the [`Client`] does these things:
    /// 1. Binds a listener on `my_ip` with an OS assigned port
    /// 2. Sends the [`Server`] a [`ControlMsg::Introduction`] containing the
    ///    address of that listener
    /// 3. The [`Server`] responds with a [`ControlMsg::Directory`], containing
    ///    the addresses of all `Client`s that registered before us, and our
    ///    id as the `target_id` of the message
    /// 4. Connects to all those `Client`s
    /// 5. Waits for every `Client` that registers after us to connect
    /// 6. Spawns a `tokio` task per connection that puts incoming envelopes
    ///    into our [`Mailbox`]
    ///
    /// [`Server`]: crate::network::Server
    pub async fn new(
        server_addr: &str,
        my_ip: &str,
        num_nodes: usize,
    ) -> Result<Arc<Self>, PoolError> {
        Client::build(server_addr, my_ip, num_nodes, None).await
    }

    /// Like [`Client::new`], but `hook` is called before this process exits
    /// because of an abort, whether it started here or at a peer.
    pub async fn with_abort_hook(
        server_addr: &str,
        my_ip: &str,
        num_nodes: usize,
        hook: AbortHook,
    ) -> Result<Arc<Self>, PoolError> {
        Client::build(server_addr, my_ip, num_nodes, Some(hook)).await
    }

    async fn build(
        server_addr: &str,
        my_ip: &str,
        num_nodes: usize,
        abort_hook: Option<AbortHook>,
    ) -> Result<Arc<Self>, PoolError> {
        let listener = TcpListener::bind(format!("{}:0", my_ip)).await?;
        let my_address = listener.local_addr()?;

        // Connect to the server and tell it our address
        let server_stream = TcpStream::connect(server_addr).await?;
        let (reader, writer) = io::split(server_stream);
        let mut stream: FramedStream<ControlMsg> =
            FramedRead::new(reader, MessageCodec::new());
        let mut sink: FramedSink<ControlMsg> =
            FramedWrite::new(writer, MessageCodec::new());
        let intro = ControlMsg::Introduction {
            address: my_address,
        };
        send_msg(Message::new(0, 0, 0, intro), &mut sink).await?;

        // Server responds with the addresses of all currently connected clients
        let dir_msg = read_msg(&mut stream).await?;
        let dir = match dir_msg.msg {
            ControlMsg::Directory { dir } => dir,
            _ => return Err(PoolError::UnexpectedMessage),
        };
        let id = dir_msg.target_id;
        info!("Client got id {} running at address {}", id, my_address);

        let mut directory = HashMap::new();
        let mut read_streams = Vec::new();
        for (peer_id, peer_addr) in dir {
            let (conn, stream) = Client::connect(id, peer_id, peer_addr).await?;
            directory.insert(peer_id, conn);
            read_streams.push((peer_id, stream));
        }

        // block until all the later clients start up and connect to us
        while directory.len() + 1 < num_nodes {
            let (socket, addr) = listener.accept().await?;
            let (reader, writer) = io::split(socket);
            let mut stream: FramedStream<PeerMsg> =
                FramedRead::new(reader, MessageCodec::new());
            let hello = read_msg(&mut stream).await?;
            if !matches!(hello.msg, PeerMsg::Hello) {
                return Err(PoolError::UnexpectedMessage);
            }
            if directory.contains_key(&hello.sender_id) {
                return Err(PoolError::ReconnectionError);
            }
            info!("Connected to id: {} at address: {}", hello.sender_id, addr);
            let conn = Connection {
                address: addr,
                sink: Mutex::new(FramedWrite::new(writer, MessageCodec::new())),
            };
            directory.insert(hello.sender_id, conn);
            read_streams.push((hello.sender_id, stream));
        }

        let mailbox = Arc::new(Mailbox::new());
        for (peer_id, stream) in read_streams {
            Client::recv_peer_msgs(
                id,
                peer_id,
                stream,
                mailbox.clone(),
                abort_hook.clone(),
            );
        }

        Ok(Arc::new(Client {
            id,
            num_nodes,
            address: my_address,
            msg_id: AtomicUsize::new(dir_msg.msg_id + 1),
            directory,
            mailbox,
            abort_hook,
        }))
    }

    /// Connects to the [`Client`] with the given `peer_id` running at
    /// `peer_addr` and introduces ourselves with a [`PeerMsg::Hello`].
    async fn connect(
        my_id: usize,
        peer_id: usize,
        peer_addr: SocketAddr,
    ) -> Result<(Connection, FramedStream<PeerMsg>), PoolError> {
        let socket = TcpStream::connect(peer_addr).await?;
        let (reader, writer) = io::split(socket);
        let stream = FramedRead::new(reader, MessageCodec::new());
        let mut sink: FramedSink<PeerMsg> =
            FramedWrite::new(writer, MessageCodec::new());
        send_msg(Message::new(0, my_id, peer_id, PeerMsg::Hello), &mut sink).await?;
        info!("Connected to id: {} at address: {}", peer_id, peer_addr);
        let conn = Connection {
            address: peer_addr,
            sink: Mutex::new(sink),
        };
        Ok((conn, stream))
    }

    /// Spawns a `tokio` task that forwards envelopes read from `reader` into
    /// the `mailbox`. The job is aborted if `peer_id` sends
    /// [`PeerMsg::Abort`], or if its connection ends before a
    /// [`PeerMsg::Goodbye`].
    fn recv_peer_msgs(
        my_id: usize,
        peer_id: usize,
        mut reader: FramedStream<PeerMsg>,
        mailbox: Arc<Mailbox>,
        abort_hook: Option<AbortHook>,
    ) {
        tokio::spawn(async move {
            let mut departed = false;
            loop {
                match read_msg(&mut reader).await {
                    Ok(msg) => match msg.msg {
                        PeerMsg::Deliver(envelope) => mailbox.deliver(envelope),
                        PeerMsg::Abort { code } => {
                            error!("rank {} aborted the job", peer_id);
                            terminate(my_id, code, abort_hook.as_ref())
                        }
                        PeerMsg::Goodbye => {
                            debug!("rank {} is done", peer_id);
                            departed = true;
                        }
                        PeerMsg::Hello => {
                            error!("unexpected hello from {}", msg.sender_id)
                        }
                    },
                    Err(PoolError::ConnectionClosed) if departed => {
                        debug!("connection to rank {} closed", peer_id);
                        break;
                    }
                    Err(PoolError::ConnectionClosed) => {
                        error!("lost the connection to rank {}", peer_id);
                        terminate(my_id, 1, abort_hook.as_ref())
                    }
                    Err(e) => {
                        error!("failed to read from rank {}: {}", peer_id, e);
                        terminate(my_id, 1, abort_hook.as_ref())
                    }
                }
            }
        });
    }

    /// Tells every peer that this `Client` is done. After this, closing the
    /// connections does not abort the job on the peers, so it must be the
    /// last thing a rank sends.
    pub async fn close(&self) -> Result<(), PoolError> {
        for (peer_id, conn) in &self.directory {
            let msg_id = self.msg_id.fetch_add(1, Ordering::Relaxed);
            let msg = Message::new(msg_id, self.id, *peer_id, PeerMsg::Goodbye);
            send_msg(msg, &mut *conn.sink.lock().await).await?;
        }
        info!("rank {} said goodbye to {} peers", self.id, self.directory.len());
        Ok(())
    }

    /// Sends [`PeerMsg::Abort`] to every peer, waiting at most
    /// `ABORT_NOTICE_TIMEOUT`. Peers that are not told still abort once
    /// this process exits and their connection to it closes.
    fn notify_abort(&self, code: i32) {
        let notices = async {
            for (peer_id, conn) in &self.directory {
                let msg_id = self.msg_id.fetch_add(1, Ordering::Relaxed);
                let msg = Message::new(msg_id, self.id, *peer_id, PeerMsg::Abort { code });
                if let Err(e) = send_msg(msg, &mut *conn.sink.lock().await).await {
                    warn!("could not tell rank {} about the abort: {}", peer_id, e);
                }
            }
        };
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| {
                    handle.block_on(async {
                        if tokio::time::timeout(ABORT_NOTICE_TIMEOUT, notices)
                            .await
                            .is_err()
                        {
                            warn!("timed out telling peers about the abort");
                        }
                    })
                })
            }
            _ => warn!("no multi-threaded runtime to notify peers of the abort from"),
        }
    }

    /// The addresses of every other `Client`, by id
    pub fn peers(&self) -> Vec<(usize, SocketAddr)> {
        let mut peers: Vec<_> =
            self.directory.iter().map(|(k, c)| (*k, c.address)).collect();
        peers.sort_unstable();
        peers
    }
}

impl Transport for Client {
    fn rank(&self) -> usize {
        self.id
    }

    fn size(&self) -> usize {
        self.num_nodes
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn send(
        &self,
        dest: usize,
        envelope: Envelope,
    ) -> BoxFuture<'_, Result<(), PoolError>> {
        Box::pin(async move {
            if dest == self.id {
                self.mailbox.deliver(envelope);
                return Ok(());
            }
            let conn = self.directory.get(&dest).ok_or(PoolError::UnknownId)?;
            let msg_id = self.msg_id.fetch_add(1, Ordering::Relaxed);
            let msg = Message::new(msg_id, self.id, dest, PeerMsg::Deliver(envelope));
            send_msg(msg, &mut *conn.sink.lock().await).await?;
            debug!("sent a message with id, {}", msg_id);
            Ok(())
        })
    }

    fn abort(&self, code: i32) -> ! {
        self.notify_abort(code);
        terminate(self.id, code, self.abort_hook.as_ref())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("num_nodes", &self.num_nodes)
            .field("address", &self.address)
            .field("directory", &self.directory)
            .finish()
    }
}
