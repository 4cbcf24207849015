use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::message::Envelope;

/// Opaque handle the master may attach to an inbound message (for instance a
/// connection being handed over). The core only passes it through.
pub type Socket = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("envelope `{0}` has no recipient")]
    NoRecipient(String),

    #[error("unknown peer `{0}`")]
    UnknownPeer(String),

    #[error("peer `{0}` is already connected")]
    AlreadyConnected(String),

    #[error("transport for `{0}` is closed")]
    Closed(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Encode(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// One-way message channel out of a process.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name this process is known by on the cluster; stamped into `from`.
    fn identity(&self) -> &str;

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// In-process router that connects named processes through unbounded
/// channels. Each connected name gets its own inbox.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    peers: Arc<DashMap<String, UnboundedSender<Envelope>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub under `name`, returning the outbound side and the inbox.
    pub fn connect(
        &self,
        name: &str,
    ) -> Result<(LocalTransport, UnboundedReceiver<Envelope>), TransportError> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = mpsc::unbounded_channel();
        match self.peers.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(TransportError::AlreadyConnected(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let transport = LocalTransport {
            name: name.to_string(),
            hub: self.clone(),
        };
        Ok((transport, rx))
    }

    /// Route an envelope to its recipient's inbox.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        let to = envelope
            .to
            .clone()
            .ok_or_else(|| TransportError::NoRecipient(envelope.action.clone()))?;
        let peer = self
            .peers
            .get(&to)
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;
        debug!(action = %envelope.action, from = %envelope.from, %to, "hub deliver");
        peer.send(envelope).map_err(|_| TransportError::Closed(to))
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransport {
    name: String,
    hub: LocalHub,
}

#[async_trait]
impl Transport for LocalTransport {
    fn identity(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.hub.deliver(envelope)
    }
}
