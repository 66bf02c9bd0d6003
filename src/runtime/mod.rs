//! Runtime configuration and public API
//!
//! This module holds the [`RuntimeConfig`] built once by the entry point and
//! passed into every [`Area`] constructor, together with the address book the
//! node uses to find its peers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Submodules
pub mod area;
pub mod error;
pub mod history;
pub mod node;
pub mod scheduler;
pub mod transport;
pub mod wire;

pub use area::{Area, HandlerId, Params};
pub use error::{Result, RuntimeError};
pub use history::{Context, History, Ring, DEFAULT_CAPACITY};
pub use node::Node;
pub use scheduler::{Round, Sequential, Strategy};

/// Kind of socket interface a node exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Point-to-point command receiver
    Rcv,
    /// Broadcast publisher
    Pub,
}

impl Interface {
    /// Suffix used in address book keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Interface::Rcv => "rcv",
            Interface::Pub => "pub",
        }
    }

    /// Address book key for `name`'s interface of this kind
    pub fn key(&self, name: &str) -> String {
        format!("{}-{}", name, self.as_str())
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network location of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// IP the owning node binds on
    pub ip: String,

    /// TCP port
    pub port: u16,

    /// Hostname peers connect to (defaults to `ip`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Address {
    /// Create an address without a separate connect host
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            host: None,
        }
    }

    /// Host peers should connect to
    pub fn connect_host(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.ip)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connect_host(), self.port)
    }
}

/// Resolved address book: `"{name}-{kind}"` to address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressBook(HashMap<String, Address>);

impl AddressBook {
    /// Create an empty address book
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`'s interface of the given kind
    pub fn insert(&mut self, name: &str, kind: Interface, address: Address) {
        self.0.insert(kind.key(name), address);
    }

    /// Builder-style variant of [`AddressBook::insert`]
    pub fn with(mut self, name: &str, kind: Interface, address: Address) -> Self {
        self.insert(name, kind, address);
        self
    }

    /// Look up `name`'s interface of the given kind
    pub fn get(&self, name: &str, kind: Interface) -> Option<&Address> {
        self.0.get(&kind.key(name))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the book is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One entry of the `subscriptions` startup option.
///
/// Accepts either a plain slot list (`["a", "b"]`), `null` for every topic, or
/// the long form `{"slots": [...], "bufferLength": 50}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SubscriptionRepr")]
pub struct Subscription {
    /// Topics to follow; `None` follows every topic with a single buffer
    pub slots: Option<Vec<String>>,

    /// Ring buffer capacity for each recorded buffer
    #[serde(rename = "bufferLength")]
    pub buffer_length: usize,
}

impl Subscription {
    /// Follow every topic of a source
    pub fn all() -> Self {
        Self {
            slots: None,
            buffer_length: DEFAULT_CAPACITY,
        }
    }

    /// Follow the given topics of a source
    pub fn slots<I, T>(slots: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let slots: Vec<String> = slots.into_iter().map(Into::into).collect();
        Self {
            slots: if slots.is_empty() { None } else { Some(slots) },
            buffer_length: DEFAULT_CAPACITY,
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubscriptionRepr {
    Slots(Option<Vec<String>>),
    Full {
        #[serde(default)]
        slots: Option<Vec<String>>,
        #[serde(rename = "bufferLength", default)]
        buffer_length: Option<usize>,
    },
}

impl From<SubscriptionRepr> for Subscription {
    fn from(repr: SubscriptionRepr) -> Self {
        let (slots, buffer_length) = match repr {
            SubscriptionRepr::Slots(slots) => (slots, None),
            SubscriptionRepr::Full {
                slots,
                buffer_length,
            } => (slots, buffer_length),
        };
        Self {
            slots: slots.filter(|slots| !slots.is_empty()),
            buffer_length: buffer_length.unwrap_or(DEFAULT_CAPACITY),
        }
    }
}

fn default_linger() -> f64 {
    1.0
}

fn default_puller() -> bool {
    true
}

/// Configuration for one Area process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Name of this node (its address book prefix)
    pub name: String,

    /// Resolved address book shared by every node of the deployment
    #[serde(default)]
    pub addresses: AddressBook,

    /// Seconds of input silence before a quiescence round fires (none = wait for traffic)
    #[serde(default)]
    pub timeout: Option<f64>,

    /// Seconds queued outbound frames may take to flush on shutdown
    #[serde(default = "default_linger")]
    pub linger: f64,

    /// Bind the command receiver at this node's `rcv` address
    #[serde(default = "default_puller")]
    pub puller: bool,

    /// Sources to follow, keyed by source name
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Subscription>,

    /// Values merged into the initial context
    #[serde(rename = "context-values", default)]
    pub context_values: Map<String, Value>,
}

impl RuntimeConfig {
    /// Create a configuration with defaults for everything but the identity
    pub fn new(name: impl Into<String>, addresses: AddressBook) -> Self {
        Self {
            name: name.into(),
            addresses,
            timeout: None,
            linger: default_linger(),
            puller: default_puller(),
            subscriptions: BTreeMap::new(),
            context_values: Map::new(),
        }
    }

    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded configuration for '{}' from {:?}", config.name, path);
        Ok(config)
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RuntimeError::Config("node name must not be empty".into()));
        }
        self.poll_timeout()?;
        self.linger_duration()?;
        Ok(())
    }

    /// Poll timeout as a duration
    pub fn poll_timeout(&self) -> Result<Option<Duration>> {
        self.timeout
            .map(|secs| seconds("timeout", secs))
            .transpose()
    }

    /// Shutdown linger as a duration
    pub fn linger_duration(&self) -> Result<Duration> {
        seconds("linger", self.linger)
    }

    /// Set the quiescence timeout in seconds
    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Follow `source` on startup
    pub fn with_subscription(mut self, source: impl Into<String>, subscription: Subscription) -> Self {
        self.subscriptions.insert(source.into(), subscription);
        self
    }

    /// Seed an initial context value
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_values.insert(key.into(), value);
        self
    }
}

fn seconds(option: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|err| RuntimeError::Config(format!("invalid {}: {} ({})", option, secs, err)))
}
