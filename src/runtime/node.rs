//! Node: address resolution, socket registry and inbox polling
//!
//! A node owns every socket of one process. Socket tasks feed a single inbox;
//! the area's event loop polls that inbox and decides when a round boundary
//! has been reached.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use super::error::{Result, RuntimeError};
use super::transport::{self, Inbound, InboxSender, Publisher, SocketId};
use super::{Address, AddressBook, Interface, RuntimeConfig};

/// Socket owner and inbox for one process
pub struct Node {
    name: String,
    addresses: AddressBook,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    sender: InboxSender,
    subscriptions: HashMap<SocketId, String>,
    next_socket: u64,
    publisher: Option<Publisher>,
    receiver: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl Node {
    /// Create a node from the configuration's identity and address book
    ///
    /// No socket is opened until [`Node::bind_commands`], [`Node::subscribe`]
    /// or the first [`Node::publish`].
    pub fn new(config: &RuntimeConfig) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            name: config.name.clone(),
            addresses: config.addresses.clone(),
            inbox,
            sender,
            subscriptions: HashMap::new(),
            next_socket: 0,
            publisher: None,
            receiver: None,
            tasks: Vec::new(),
            running: true,
        }
    }

    /// Sender feeding this node's inbox
    pub fn inbox(&self) -> InboxSender {
        self.sender.clone()
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address book
    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    /// Resolve `name`'s interface (this node when `name` is `None`)
    pub fn resolve(&self, kind: Interface, name: Option<&str>) -> Result<&Address> {
        let name = name.unwrap_or(&self.name);
        self.addresses
            .get(name, kind)
            .ok_or_else(|| RuntimeError::UnknownAddress(kind.key(name)))
    }

    /// Bind the command receiver at this node's `rcv` address
    pub fn bind_commands(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.receiver {
            return Ok(addr);
        }

        let address = self.resolve(Interface::Rcv, None)?;
        let listener = transport::bind_listener(&Interface::Rcv.key(&self.name), address)?;
        let addr = listener.local_addr()?;
        self.tasks
            .push(transport::spawn_command_receiver(listener, self.sender.clone()));
        self.receiver = Some(addr);

        tracing::info!("{} receiving commands on {}", self.name, addr);
        Ok(addr)
    }

    /// Connect to `source`'s publisher, following the given topics (all when empty)
    pub fn subscribe(&mut self, source: &str, topics: &[String]) -> Result<SocketId> {
        let address = self.resolve(Interface::Pub, Some(source))?.clone();
        let socket = SocketId(self.next_socket);
        self.next_socket += 1;

        tracing::info!(
            "{} following {} at {} ({})",
            self.name,
            source,
            address,
            if topics.is_empty() {
                "all topics".to_string()
            } else {
                topics.join(", ")
            }
        );

        self.tasks.push(transport::spawn_subscriber(
            socket,
            address,
            topics.to_vec(),
            self.sender.clone(),
        ));
        self.subscriptions.insert(socket, source.to_string());
        Ok(socket)
    }

    /// Source a subscriber socket belongs to
    pub fn source_of(&self, socket: SocketId) -> Option<&str> {
        self.subscriptions.get(&socket).map(String::as_str)
    }

    /// Broadcast one message, binding the publisher on first use
    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.publisher.is_none() {
            let key = Interface::Pub.key(&self.name);
            let address = self.resolve(Interface::Pub, None)?;
            let publisher = Publisher::bind(&key, address)?;
            tracing::info!("{} publishing on {}", self.name, publisher.local_addr());
            self.publisher = Some(publisher);
        }

        if let Some(publisher) = self.publisher.as_mut() {
            publisher.send(topic, payload)?;
        }
        Ok(())
    }

    /// Bound publisher address, if the publisher exists yet
    pub fn publisher_addr(&self) -> Option<SocketAddr> {
        self.publisher.as_ref().map(Publisher::local_addr)
    }

    /// Send a command frame to `target`'s receiver
    ///
    /// A missing address is an error; delivery problems are not.
    pub fn send_command(&self, target: &str, payload: Vec<u8>) -> Result<()> {
        let address = self.resolve(Interface::Rcv, Some(target))?;
        transport::send_command(address, payload);
        Ok(())
    }

    /// Wait for the next delivery
    ///
    /// `None` waits indefinitely; a zero timeout only looks at what is already
    /// queued (after letting socket tasks run). Returns `None` when nothing
    /// arrived in time.
    pub async fn poll(&mut self, timeout: Option<Duration>) -> Option<Inbound> {
        match timeout {
            None => self.inbox.recv().await,
            Some(timeout) if timeout.is_zero() => {
                tokio::task::yield_now().await;
                match self.inbox.try_recv() {
                    Ok(inbound) => Some(inbound),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
                }
            }
            Some(timeout) => tokio::time::timeout(timeout, self.inbox.recv())
                .await
                .ok()
                .flatten(),
        }
    }

    /// Forward SIGINT into the inbox
    pub fn watch_interrupts(&mut self) {
        let sender = self.sender.clone();
        self.tasks.push(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = sender.send(Inbound::Interrupt);
            }
        }));
    }

    /// Whether the event loop should keep going
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Ask the event loop to exit after its current iteration
    pub fn stop(&mut self) {
        if self.running {
            tracing::info!("{} stopping", self.name);
        }
        self.running = false;
    }

    /// Tear down every socket, giving queued broadcasts up to `linger`
    pub async fn shutdown(&mut self, linger: Duration) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.close(linger).await;
        }
        self.subscriptions.clear();
        self.receiver = None;
        tracing::debug!("{} transport closed", self.name);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RuntimeConfig {
        let addresses = AddressBook::new()
            .with("a", Interface::Pub, Address::new("127.0.0.1", 5700))
            .with("b", Interface::Rcv, Address::new("127.0.0.1", 5701));
        RuntimeConfig::new("a", addresses)
    }

    #[test]
    fn test_resolve_self_and_peer() {
        let node = Node::new(&config());
        assert_eq!(node.resolve(Interface::Pub, None).unwrap().port, 5700);
        assert_eq!(node.resolve(Interface::Rcv, Some("b")).unwrap().port, 5701);
    }

    #[test]
    fn test_resolve_missing_key_fails() {
        let node = Node::new(&config());
        match node.resolve(Interface::Rcv, None) {
            Err(RuntimeError::UnknownAddress(key)) => assert_eq!(key, "a-rcv"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut node = Node::new(&config());
        assert!(node.is_running());
        node.stop();
        node.stop();
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_zero_timeout_poll_returns_queued_then_none() {
        let mut node = Node::new(&config());
        node.sender.send(Inbound::Command(serde_json::json!({}))).unwrap();
        assert!(node.poll(Some(Duration::ZERO)).await.is_some());
        assert!(node.poll(Some(Duration::ZERO)).await.is_none());
        assert!(node.poll(Some(Duration::from_millis(5))).await.is_none());
    }
}
