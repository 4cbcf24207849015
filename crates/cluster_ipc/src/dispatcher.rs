//! Inbound message router.
//!
//! `cluster:ready` fires the `ready` lifecycle stage, `#ipc_feed#` goes to the
//! handler table (requests) or the correlation table (responses), and every
//! other action is published to local subscribers as a [`PassthroughEvent`].
//!
//! Routing happens in arrival order. Only the work that waits (ready hooks,
//! feed handlers and their replies) runs off the routing path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::correlation::CorrelationTable;
use crate::handlers::FeedHandlerTable;
use crate::lifecycle::{LifecycleRegistry, stage};
use crate::message::{Action, Envelope, FeedBody, FeedRequest, IPC_FEED};
use crate::transport::{Socket, Transport};

/// An application-level message the core does not interpret.
#[derive(Debug, Clone)]
pub struct PassthroughEvent {
    pub action: String,
    pub body: Value,
    pub from: String,
    pub socket: Option<Socket>,
}

/// Work left over after routing that has to wait on hooks or handlers.
enum Deferred {
    Ready(Option<Socket>),
    Answer { to: String, request: FeedRequest },
}

#[derive(Clone)]
pub struct MessageDispatcher {
    transport: Arc<dyn Transport>,
    calls: Arc<CorrelationTable>,
    feeds: Arc<FeedHandlerTable>,
    hooks: Arc<LifecycleRegistry>,
    subscribers: Arc<DashMap<u64, UnboundedSender<PassthroughEvent>>>,
    next_subscriber: Arc<AtomicU64>,
}

impl MessageDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        calls: Arc<CorrelationTable>,
        feeds: Arc<FeedHandlerTable>,
        hooks: Arc<LifecycleRegistry>,
    ) -> Self {
        Self {
            transport,
            calls,
            feeds,
            hooks,
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Receive every [`PassthroughEvent`] published from now on, in arrival
    /// order. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> UnboundedReceiver<PassthroughEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        rx
    }

    /// Route one inbound message and wait for any hook or handler it starts.
    /// Never fails: problems are logged.
    pub async fn dispatch(&self, envelope: Envelope, socket: Option<Socket>) {
        if let Some(work) = self.route(envelope, socket) {
            self.finish(work).await;
        }
    }

    /// Dispatch everything arriving on `inbox` until the inbox closes.
    ///
    /// Messages are routed one after another; ready hooks and feed handlers
    /// each run on their own task so a slow one does not hold up the rest.
    pub fn serve(&self, mut inbox: UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Some(work) = dispatcher.route(envelope, None) {
                    let d = dispatcher.clone();
                    tokio::spawn(async move { d.finish(work).await });
                }
            }
            debug!(process = %dispatcher.transport.identity(), "inbox closed");
        })
    }

    fn route(&self, envelope: Envelope, socket: Option<Socket>) -> Option<Deferred> {
        match envelope.kind() {
            Action::ClusterReady => Some(Deferred::Ready(socket)),
            Action::Feed => match serde_json::from_value::<FeedBody>(envelope.body) {
                Ok(FeedBody::Request(request)) => Some(Deferred::Answer {
                    to: envelope.from,
                    request,
                }),
                Ok(FeedBody::Response(response)) => {
                    self.calls.complete(response);
                    None
                }
                Err(e) => {
                    warn!(from = %envelope.from, "malformed feed body: {e}");
                    None
                }
            },
            Action::Other(action) => {
                self.publish(PassthroughEvent {
                    action,
                    body: envelope.body,
                    from: envelope.from,
                    socket,
                });
                None
            }
        }
    }

    fn publish(&self, event: PassthroughEvent) {
        if self.subscribers.is_empty() {
            debug!(action = %event.action, "no subscriber for action");
            return;
        }
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    async fn finish(&self, work: Deferred) {
        match work {
            Deferred::Ready(socket) => {
                if let Err(e) = self.hooks.trigger(stage::READY, socket).await {
                    error!(
                        process = %self.transport.identity(),
                        "[{}:cluster:ready] Error: {e:#}",
                        self.transport.identity()
                    );
                }
            }
            Deferred::Answer { to, request } => self.answer(to, request).await,
        }
    }

    async fn answer(&self, to: String, request: FeedRequest) {
        let response = self.feeds.respond(request).await;
        let body = match serde_json::to_value(&response) {
            Ok(body) => body,
            Err(e) => {
                error!(id = response.id, "failed to encode feed response: {e}");
                return;
            }
        };
        let reply = Envelope::new(IPC_FEED, self.transport.identity(), Some(to.as_str()), body);
        if let Err(e) = self.transport.send(reply).await {
            warn!(id = response.id, %to, "failed to send feed response: {e}");
        }
    }
}
