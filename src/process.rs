//! One cluster process: the agent or worker side of the runtime.
//!
//! `ClusterProcess` owns the process's private tables (pending feed calls,
//! feed handlers, lifecycle hooks) and the dispatcher routing inbound
//! messages to them. It is cheap to clone; clones share the same tables.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cluster_ipc::lifecycle::stage;
use cluster_ipc::{
    CorrelationTable, DuplicateFeedHandler, Envelope, FeedHandlerTable, FeedOutcome, FeedResult,
    HookError, LifecycleRegistry, MessageDispatcher, PassthroughEvent, Socket, Transport,
    TransportError,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ProcessKind, ProcessOptions};
use crate::plugin::PluginDescriptor;

#[derive(Clone)]
pub struct ClusterProcess {
    options: Arc<ProcessOptions>,
    transport: Arc<dyn Transport>,
    calls: Arc<CorrelationTable>,
    feeds: Arc<FeedHandlerTable>,
    hooks: Arc<LifecycleRegistry>,
    dispatcher: MessageDispatcher,
}

impl ClusterProcess {
    pub fn new(options: ProcessOptions, transport: Arc<dyn Transport>) -> Self {
        let calls = Arc::new(CorrelationTable::new());
        let feeds = Arc::new(FeedHandlerTable::new());
        let hooks = Arc::new(LifecycleRegistry::new());
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&calls),
            Arc::clone(&feeds),
            Arc::clone(&hooks),
        );
        Self {
            options: Arc::new(options),
            transport,
            calls,
            feeds,
            hooks,
            dispatcher,
        }
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    pub fn kind(&self) -> ProcessKind {
        self.options.kind
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Feed calls still waiting for their response.
    pub fn pending_feeds(&self) -> usize {
        self.calls.pending()
    }

    /// Append a hook to lifecycle `stage`.
    pub fn bind<F, Fut>(&self, stage: &str, hook: F) -> &Self
    where
        F: Fn(Option<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.bind(stage, hook);
        self
    }

    pub async fn trigger(&self, stage: &str, socket: Option<Socket>) -> Result<(), HookError> {
        self.hooks.trigger(stage, socket).await
    }

    /// Serve feed calls for `event` from other processes.
    pub fn on_feed<F, Fut, O>(&self, event: &str, handler: F) -> Result<&Self, DuplicateFeedHandler>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Into<FeedOutcome>,
    {
        self.feeds.register(event, handler)?;
        Ok(self)
    }

    /// Call `event` on `agent` and wait for its result, for at most the
    /// default window.
    pub async fn feed(&self, agent: &str, event: &str, data: Value) -> FeedResult {
        self.calls.feed(self.transport.as_ref(), agent, event, data, None).await
    }

    pub async fn feed_with_timeout(
        &self,
        agent: &str,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> FeedResult {
        self.calls
            .feed(self.transport.as_ref(), agent, event, data, Some(timeout))
            .await
    }

    /// Fire-and-forget message to process `to`.
    pub async fn send(&self, to: &str, action: &str, body: Value) -> Result<(), TransportError> {
        self.transport
            .send(Envelope::new(action, self.transport.identity(), Some(to), body))
            .await
    }

    /// Messages with actions the runtime does not interpret.
    pub fn subscribe(&self) -> UnboundedReceiver<PassthroughEvent> {
        self.dispatcher.subscribe()
    }

    pub async fn dispatch(&self, envelope: Envelope, socket: Option<Socket>) {
        self.dispatcher.dispatch(envelope, socket).await
    }

    pub fn serve(&self, inbox: UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        self.dispatcher.serve(inbox)
    }

    /// Run the entry of every plugin in order, each to completion before the
    /// next starts.
    pub async fn create(&self, plugins: &[PluginDescriptor]) -> anyhow::Result<()> {
        for plugin in plugins {
            let Some(entry) = plugin.entry() else {
                debug!(plugin = %plugin.name(), "configuration-only plugin");
                continue;
            };
            info!(process = %self.name(), plugin = %plugin.name(), "initializing plugin");
            entry(self.clone(), plugin.scope().clone())
                .await
                .with_context(|| format!("plugin[{}] failed to initialize", plugin.name()))?;
        }
        Ok(())
    }

    /// [`create`](Self::create), then the application's own bootstrap.
    pub async fn create_with<F, Fut>(
        &self,
        plugins: &[PluginDescriptor],
        bootstrap: F,
    ) -> anyhow::Result<()>
    where
        F: FnOnce(ClusterProcess) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.create(plugins).await?;
        bootstrap(self.clone())
            .await
            .with_context(|| format!("{} bootstrap failed", self.name()))
    }

    /// Shut down: workers run `beforeStop` first, then every process runs `stop`.
    pub async fn destroy(&self) -> Result<(), HookError> {
        if self.kind() == ProcessKind::Worker {
            self.trigger(stage::BEFORE_STOP, None).await?;
        }
        self.trigger(stage::STOP, None).await?;
        info!(process = %self.name(), "stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ClusterProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterProcess")
            .field("options", &self.options)
            .field("pending_feeds", &self.calls.pending())
            .field("feeds", &self.feeds.events())
            .finish_non_exhaustive()
    }
}
