//! Caller side of the feed protocol: turns a one-way `#ipc_feed#` message into
//! an awaitable call.
//!
//! Each call gets a process-local id and an entry in the [`CorrelationTable`].
//! The entry is removed exactly once, either by the matching response or by
//! the timeout, and whichever removes it settles the call. A response arriving
//! after the timeout finds no entry and is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::message::{Envelope, FeedResponse, IPC_FEED, status};
use crate::transport::{Transport, TransportError};

/// Window used when the caller does not pass a timeout.
pub const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(20 * 60);

pub type FeedResult = Result<Option<Value>, FeedError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// The agent answered with a non-200 status.
    #[error("feed failed with status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("feed event[{event}] result from agent[{agent}] timeout")]
    Timeout { event: String, agent: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The table went away while the call was in flight.
    #[error("feed call #{0} was abandoned")]
    Abandoned(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedErrorKind {
    NotFound,
    HandlerFailure,
    HandlerRejection,
    Timeout,
    Transport,
    Unknown,
}

impl FeedError {
    /// Wire status of the failure; `None` for failures that never had one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FeedError::Remote { status, .. } => Some(*status),
            FeedError::Timeout { .. } => Some(status::TIMEOUT),
            FeedError::Transport(_) | FeedError::Abandoned(_) => None,
        }
    }

    pub fn kind(&self) -> FeedErrorKind {
        match self {
            FeedError::Transport(_) => FeedErrorKind::Transport,
            FeedError::Abandoned(_) => FeedErrorKind::Unknown,
            FeedError::Timeout { .. } => FeedErrorKind::Timeout,
            FeedError::Remote { status, .. } => match *status {
                status::NOT_FOUND => FeedErrorKind::NotFound,
                500..=599 => FeedErrorKind::HandlerFailure,
                status::HANDLER_REJECTED => FeedErrorKind::HandlerRejection,
                status::TIMEOUT => FeedErrorKind::Timeout,
                _ => FeedErrorKind::Unknown,
            },
        }
    }

    /// Message text as it crossed the wire.
    pub fn message(&self) -> String {
        match self {
            FeedError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

struct PendingCall {
    event: String,
    agent: String,
    tx: oneshot::Sender<FeedResult>,
}

/// Removes the entry when the caller's future goes away early.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingCall>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// In-flight feed calls of one process, keyed by id.
#[derive(Default)]
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls still waiting for a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Send `event` with `data` to `agent` and wait for the correlated reply.
    ///
    /// Resolves with the handler's data (possibly absent) on status 200 and
    /// fails with a [`FeedError`] otherwise, or with status 608 when nothing
    /// came back within `timeout` (default [`DEFAULT_FEED_TIMEOUT`]).
    pub async fn feed(
        &self,
        transport: &dyn Transport,
        agent: &str,
        event: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> FeedResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                event: event.to_string(),
                agent: agent.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let body = json!({ "event": event, "data": data, "id": id });
        transport
            .send(Envelope::new(IPC_FEED, transport.identity(), Some(agent), body))
            .await?;
        debug!(id, %agent, %event, "feed sent");

        let window = timeout.unwrap_or(DEFAULT_FEED_TIMEOUT);
        match tokio::time::timeout(window, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FeedError::Abandoned(id)),
            Err(_) => match self.pending.remove(&id) {
                Some((_, call)) => {
                    warn!(
                        id,
                        agent = %call.agent,
                        event = %call.event,
                        "feed timed out after {:?}",
                        window
                    );
                    Err(FeedError::Timeout {
                        event: call.event,
                        agent: call.agent,
                    })
                }
                // The response claimed the entry first; its result is already in the channel.
                None => rx.await.unwrap_or(Err(FeedError::Abandoned(id))),
            },
        }
    }

    /// Settle the call matching `response.id`. Returns `false` when the id is
    /// unknown or already settled, in which case the response is dropped.
    pub fn complete(&self, response: FeedResponse) -> bool {
        let Some((_, call)) = self.pending.remove(&response.id) else {
            debug!(
                id = response.id,
                status = response.status,
                "dropping feed response without pending call"
            );
            return false;
        };
        let result = if response.status == status::OK {
            Ok(response.data)
        } else {
            Err(FeedError::Remote {
                status: response.status,
                message: response.message(),
            })
        };
        // The caller may have stopped waiting; nothing left to do then.
        let _ = call.tx.send(result);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FeedBody, FeedRequest};
    use crate::transport::LocalHub;
    use std::sync::Arc;

    async fn next_request(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Envelope>,
    ) -> FeedRequest {
        let env = rx.recv().await.expect("request envelope");
        assert_eq!(env.action, IPC_FEED);
        match serde_json::from_value(env.body).unwrap() {
            FeedBody::Request(req) => req,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ids_increase_per_table() {
        let hub = LocalHub::new();
        let (worker, _wrx) = hub.connect("w").unwrap();
        let (_agent, mut arx) = hub.connect("vs").unwrap();
        let table = Arc::new(CorrelationTable::new());

        for expected in 0..3u64 {
            let t = Arc::clone(&table);
            let w = worker.clone();
            let call = tokio::spawn(async move {
                t.feed(&w, "vs", "e", Value::Null, Some(Duration::from_secs(5))).await
            });
            let req = next_request(&mut arx).await;
            assert_eq!(req.id, expected);
            assert!(table.complete(FeedResponse::ok(req.id, None)));
            assert_eq!(call.await.unwrap(), Ok(None));
        }
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn non_ok_status_rejects_with_status_and_message() {
        let hub = LocalHub::new();
        let (worker, _wrx) = hub.connect("w").unwrap();
        let (_agent, mut arx) = hub.connect("vs").unwrap();
        let table = Arc::new(CorrelationTable::new());

        let t = Arc::clone(&table);
        let call =
            tokio::spawn(async move { t.feed(&worker, "vs", "e", Value::Null, None).await });
        let req = next_request(&mut arx).await;
        table.complete(FeedResponse::fail(req.id, 503, "busy"));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.kind(), FeedErrorKind::HandlerFailure);
        assert_eq!(err.message(), "busy");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_with_608_and_late_response_is_dropped() {
        let hub = LocalHub::new();
        let (worker, _wrx) = hub.connect("w").unwrap();
        let (_agent, mut arx) = hub.connect("vs").unwrap();
        let table = CorrelationTable::new();

        let err = table
            .feed(&worker, "vs", "slow", Value::Null, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FeedError::Timeout {
                event: "slow".into(),
                agent: "vs".into()
            }
        );
        assert_eq!(err.status(), Some(status::TIMEOUT));
        assert_eq!(table.pending(), 0);

        let req = next_request(&mut arx).await;
        assert!(!table.complete(FeedResponse::ok(req.id, Some(json!("late")))));
    }

    #[tokio::test(start_paused = true)]
    async fn default_window_is_twenty_minutes() {
        let hub = LocalHub::new();
        let (worker, _wrx) = hub.connect("w").unwrap();
        let (_agent, _arx) = hub.connect("vs").unwrap();
        let table = CorrelationTable::new();
        let start = tokio::time::Instant::now();

        let just_before = async {
            tokio::time::sleep(Duration::from_secs(20 * 60 - 1)).await;
            table.pending()
        };
        let (pending, result) = tokio::join!(
            just_before,
            table.feed(&worker, "vs", "e", Value::Null, None)
        );

        assert_eq!(pending, 1);
        assert_eq!(result.unwrap_err().status(), Some(status::TIMEOUT));
        assert!(start.elapsed() >= Duration::from_secs(20 * 60));
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn send_failure_leaves_no_pending_entry() {
        let hub = LocalHub::new();
        let (worker, _wrx) = hub.connect("w").unwrap();
        let table = CorrelationTable::new();

        let err = table
            .feed(&worker, "missing", "e", Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::Transport);
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_releases_its_entry() {
        let hub = LocalHub::new();
        let (worker, _wrx) = hub.connect("w").unwrap();
        let (_agent, mut arx) = hub.connect("vs").unwrap();
        let table = Arc::new(CorrelationTable::new());

        let t = Arc::clone(&table);
        let call =
            tokio::spawn(async move { t.feed(&worker, "vs", "e", Value::Null, None).await });
        let req = next_request(&mut arx).await;
        assert_eq!(table.pending(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(table.pending(), 0);
        assert!(!table.complete(FeedResponse::ok(req.id, None)));
    }
}
