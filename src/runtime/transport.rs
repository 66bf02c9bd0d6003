//! Socket primitives: broadcast publisher, subscriber links, command receiver
//! and the fire-and-forget command sender.
//!
//! Socket IO runs in background tasks. Tasks never touch area state; they only
//! decode frames and forward them into the owning node's inbox, so every
//! handler still runs on the single event loop.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::Address;
use super::error::{Result, RuntimeError, WireError, WireResult};
use super::wire;

/// Delay between subscriber connection attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(50);

/// Frames queued per subscriber before new broadcasts are dropped for it
pub const SEND_HIGH_WATER_MARK: usize = 1000;

/// Identifier of a socket registered with a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Something a socket task delivered to the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A subscribed broadcast
    Broadcast {
        /// Subscriber socket that received it
        socket: SocketId,
        /// Topic (empty for the default slot)
        topic: String,
        /// Decoded payload
        payload: Value,
    },

    /// A command frame from the receiver socket
    Command(Value),

    /// SIGINT was received
    Interrupt,
}

/// Sender half of a node inbox
pub type InboxSender = mpsc::UnboundedSender<Inbound>;

/// Bind a listener from an address book entry
///
/// Must be called from within a tokio runtime.
pub fn bind_listener(key: &str, address: &Address) -> Result<TcpListener> {
    let invalid = |err: std::io::Error| RuntimeError::InvalidAddress {
        key: key.to_string(),
        detail: err.to_string(),
    };
    let listener = std::net::TcpListener::bind((address.ip.as_str(), address.port)).map_err(invalid)?;
    listener.set_nonblocking(true).map_err(invalid)?;
    Ok(TcpListener::from_std(listener)?)
}

struct Peer {
    topics: Option<HashSet<String>>,
    outbox: mpsc::Sender<Vec<u8>>,
    writer: JoinHandle<()>,
}

impl Peer {
    fn wants(&self, topic: &str) -> bool {
        self.topics.as_ref().is_none_or(|topics| topics.contains(topic))
    }
}

/// Broadcast socket
///
/// Subscribers connect, send their topic list, and then receive every
/// `[topic, payload]` message whose topic they asked for. Nothing is replayed
/// to late joiners, and a subscriber that falls [`SEND_HIGH_WATER_MARK`]
/// frames behind misses broadcasts until it catches up.
pub struct Publisher {
    local_addr: SocketAddr,
    joins: mpsc::UnboundedReceiver<Peer>,
    peers: Vec<Peer>,
    accept: JoinHandle<()>,
}

impl Publisher {
    /// Bind the broadcast socket and start accepting subscribers
    pub fn bind(key: &str, address: &Address) -> Result<Self> {
        let listener = bind_listener(key, address)?;
        let local_addr = listener.local_addr()?;
        let (joined, joins) = mpsc::unbounded_channel();
        let accept = tokio::spawn(accept_subscribers(listener, joined));

        tracing::debug!("Publisher bound on {}", local_addr);

        Ok(Self {
            local_addr,
            joins,
            peers: Vec::new(),
            accept,
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of subscribers currently attached
    pub fn subscriber_count(&mut self) -> usize {
        self.admit();
        self.peers.retain(|peer| !peer.outbox.is_closed());
        self.peers.len()
    }

    /// Queue one broadcast to every interested subscriber
    pub fn send(&mut self, topic: &str, payload: &[u8]) -> WireResult<()> {
        self.admit();
        let frame = wire::encode(&[topic.as_bytes(), payload])?;
        let local_addr = self.local_addr;
        self.peers.retain(|peer| {
            if !peer.wants(topic) {
                return !peer.outbox.is_closed();
            }
            match peer.outbox.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("Subscriber of {} is full; dropped '{}'", local_addr, topic);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    /// Stop accepting and give queued frames up to `linger` to flush
    pub async fn close(mut self, linger: Duration) {
        self.accept.abort();
        self.admit();

        let writers: Vec<JoinHandle<()>> = self.peers.drain(..).map(|peer| peer.writer).collect();
        let aborts: Vec<_> = writers.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(linger, futures::future::join_all(writers))
            .await
            .is_err()
        {
            tracing::debug!("Linger expired with frames still queued on {}", self.local_addr);
            for handle in aborts {
                handle.abort();
            }
        }
    }

    fn admit(&mut self) {
        while let Ok(peer) = self.joins.try_recv() {
            self.peers.push(peer);
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn accept_subscribers(listener: TcpListener, joined: mpsc::UnboundedSender<Peer>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::debug!("Failed to accept subscriber: {}", err);
                continue;
            }
        };

        let joined = joined.clone();
        tokio::spawn(async move {
            match handshake(stream).await {
                Ok(peer) => {
                    tracing::debug!("Subscriber {} attached", remote);
                    let _ = joined.send(peer);
                }
                Err(err) => tracing::debug!("Subscriber {} rejected: {}", remote, err),
            }
        });
    }
}

async fn handshake(stream: TcpStream) -> WireResult<Peer> {
    let (mut reader, mut writer) = stream.into_split();

    let parts = wire::read_message(&mut reader)
        .await?
        .ok_or_else(|| WireError::Malformed("connection closed before subscribing".into()))?;
    let topics = parts
        .into_iter()
        .map(wire::utf8)
        .collect::<WireResult<HashSet<String>>>()?;

    let (outbox, mut queue) = mpsc::channel::<Vec<u8>>(SEND_HIGH_WATER_MARK);
    let writer = tokio::spawn(async move {
        // Keep the read half alive so the subscriber is not half-closed.
        let _reader = reader;
        while let Some(frame) = queue.recv().await {
            if let Err(err) = writer.write_all(&frame).await {
                tracing::debug!("Dropping subscriber: {}", err);
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    Ok(Peer {
        topics: if topics.is_empty() { None } else { Some(topics) },
        outbox,
        writer,
    })
}

/// Follow a publisher, reconnecting whenever the link drops
///
/// Decoded broadcasts are forwarded to `inbox` tagged with `socket`. The task
/// ends once the inbox is gone.
pub fn spawn_subscriber(
    socket: SocketId,
    address: Address,
    topics: Vec<String>,
    inbox: InboxSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match TcpStream::connect((address.connect_host(), address.port)).await {
                Ok(stream) => {
                    if let Err(err) = stream_broadcasts(socket, stream, &topics, &inbox).await {
                        tracing::debug!("{} lost link to {}: {}", socket, address, err);
                    }
                }
                Err(err) => tracing::trace!("{} cannot reach {}: {}", socket, address, err),
            }

            if inbox.is_closed() {
                break;
            }
            tokio::time::sleep(RECONNECT_INTERVAL).await;
        }
    })
}

async fn stream_broadcasts(
    socket: SocketId,
    stream: TcpStream,
    topics: &[String],
    inbox: &InboxSender,
) -> WireResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    wire::write_message(&mut writer, topics).await?;

    while let Some(parts) = wire::read_message(&mut reader).await? {
        let [topic, payload]: [Vec<u8>; 2] = match parts.try_into() {
            Ok(parts) => parts,
            Err(parts) => {
                tracing::warn!("{} dropped a broadcast with {} parts", socket, parts.len());
                continue;
            }
        };

        let topic = wire::utf8(topic)?;
        let payload: Value = match serde_json::from_slice(&payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("{} dropped an undecodable broadcast on '{}': {}", socket, topic, err);
                continue;
            }
        };

        if inbox
            .send(Inbound::Broadcast {
                socket,
                topic,
                payload,
            })
            .is_err()
        {
            break;
        }
    }

    Ok(())
}

/// Accept command connections and forward each decoded frame to `inbox`
pub fn spawn_command_receiver(listener: TcpListener, inbox: InboxSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::debug!("Failed to accept command connection: {}", err);
                    continue;
                }
            };

            let inbox = inbox.clone();
            tokio::spawn(async move {
                if let Err(err) = receive_commands(stream, &inbox).await {
                    tracing::debug!("Command connection from {} failed: {}", remote, err);
                }
            });
        }
    })
}

async fn receive_commands(mut stream: TcpStream, inbox: &InboxSender) -> WireResult<()> {
    while let Some(parts) = wire::read_message(&mut stream).await? {
        let [payload]: [Vec<u8>; 1] = match parts.try_into() {
            Ok(parts) => parts,
            Err(parts) => {
                tracing::warn!("Dropped a command frame with {} parts", parts.len());
                continue;
            }
        };

        match serde_json::from_slice::<Value>(&payload) {
            Ok(command) => {
                if inbox.send(Inbound::Command(command)).is_err() {
                    break;
                }
            }
            Err(err) => tracing::warn!("Dropped an undecodable command frame: {}", err),
        }
    }
    Ok(())
}

/// Deliver one command frame over a fresh connection, then close it
pub async fn deliver_command(address: &Address, payload: &[u8]) -> WireResult<()> {
    let mut stream = TcpStream::connect((address.connect_host(), address.port)).await?;
    wire::write_message(&mut stream, &[payload]).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Fire-and-forget command send
///
/// Inside a runtime the delivery runs as a background task; outside one it
/// blocks on a plain socket. Delivery failures are only logged.
pub fn send_command(address: &Address, payload: Vec<u8>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let address = address.clone();
            handle.spawn(async move {
                if let Err(err) = deliver_command(&address, &payload).await {
                    tracing::debug!("Command to {} not delivered: {}", address, err);
                }
            });
        }
        Err(_) => {
            if let Err(err) = deliver_command_blocking(address, &payload) {
                tracing::debug!("Command to {} not delivered: {}", address, err);
            }
        }
    }
}

fn deliver_command_blocking(address: &Address, payload: &[u8]) -> WireResult<()> {
    use std::io::Write;

    let frame = wire::encode(&[payload])?;
    let mut stream = std::net::TcpStream::connect((address.connect_host(), address.port))?;
    stream.write_all(&frame)?;
    stream.shutdown(std::net::Shutdown::Write)?;
    Ok(())
}
