//! Receiving side of the feed protocol: one handler per event name.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{FeedRequest, FeedResponse, status};

/// Error value a handler returns to report a failure to the caller.
///
/// The status stays in the 500-599 range; anything else becomes 500.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerFailure {
    status: u16,
    message: String,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: status::HANDLER_FAILURE,
            message: message.into(),
        }
    }

    pub fn with_status(code: u16, message: impl Into<String>) -> Self {
        let status = if (500..600).contains(&code) {
            code
        } else {
            status::HANDLER_FAILURE
        };
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What a feed handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutcome {
    /// Ran, nothing to send back.
    Empty,
    Data(Value),
    Failure(HandlerFailure),
}

impl From<()> for FeedOutcome {
    fn from(_: ()) -> Self {
        FeedOutcome::Empty
    }
}

impl From<Value> for FeedOutcome {
    fn from(v: Value) -> Self {
        if v.is_null() {
            FeedOutcome::Empty
        } else {
            FeedOutcome::Data(v)
        }
    }
}

impl From<Option<Value>> for FeedOutcome {
    fn from(v: Option<Value>) -> Self {
        v.map(FeedOutcome::from).unwrap_or(FeedOutcome::Empty)
    }
}

impl From<HandlerFailure> for FeedOutcome {
    fn from(f: HandlerFailure) -> Self {
        FeedOutcome::Failure(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} has been set on feed handlers")]
pub struct DuplicateFeedHandler {
    pub event: String,
}

type FeedHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<FeedOutcome>> + Send + Sync>;

/// Event name → handler. Names are unique for the lifetime of the table.
#[derive(Default)]
pub struct FeedHandlerTable {
    handlers: DashMap<String, FeedHandler>,
}

impl FeedHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`.
    ///
    /// Handlers that finish immediately can return `std::future::ready(..)`.
    /// Returning `Err` (or panicking) is reported to the caller as status 600;
    /// a [`HandlerFailure`], returned as the value or as the error, is
    /// reported with its own status.
    pub fn register<F, Fut, O>(
        &self,
        event: impl Into<String>,
        handler: F,
    ) -> Result<(), DuplicateFeedHandler>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Into<FeedOutcome>,
    {
        use dashmap::mapref::entry::Entry;

        let event = event.into();
        match self.handlers.entry(event) {
            Entry::Occupied(slot) => Err(DuplicateFeedHandler {
                event: slot.key().clone(),
            }),
            Entry::Vacant(slot) => {
                let handler: FeedHandler = Arc::new(move |data| {
                    let fut = handler(data);
                    async move { fut.await.map(Into::<FeedOutcome>::into) }.boxed()
                });
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Run the handler for `request` and build the response to send back.
    pub async fn respond(&self, request: FeedRequest) -> FeedResponse {
        let FeedRequest { event, data, id } = request;
        let Some(handler) = self.handlers.get(&event).map(|h| Arc::clone(h.value())) else {
            debug!(id, %event, "no feed handler");
            return FeedResponse::not_found(id);
        };

        // Own task, so a panicking handler is contained and reported.
        match tokio::spawn(handler(data)).await {
            Ok(Ok(FeedOutcome::Empty)) => FeedResponse::ok(id, None),
            Ok(Ok(FeedOutcome::Data(v))) => FeedResponse::ok(id, Some(v)),
            Ok(Ok(FeedOutcome::Failure(f))) => FeedResponse::fail(id, f.status, f.message),
            Ok(Err(e)) => match e.downcast_ref::<HandlerFailure>() {
                Some(f) => FeedResponse::fail(id, f.status, f.message.clone()),
                None => {
                    warn!(id, %event, "feed handler failed: {e}");
                    FeedResponse::fail(id, status::HANDLER_REJECTED, e.to_string())
                }
            },
            Err(join) => {
                warn!(id, %event, "feed handler aborted: {join}");
                FeedResponse::fail(id, status::HANDLER_REJECTED, join.to_string())
            }
        }
    }
}
