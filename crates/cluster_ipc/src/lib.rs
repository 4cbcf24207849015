pub mod correlation;
pub mod dispatcher;
pub mod handlers;
pub mod lifecycle;
pub mod message;
pub mod stdio;
pub mod transport;

pub use correlation::{CorrelationTable, DEFAULT_FEED_TIMEOUT, FeedError, FeedErrorKind, FeedResult};
pub use dispatcher::{MessageDispatcher, PassthroughEvent};
pub use handlers::{DuplicateFeedHandler, FeedHandlerTable, FeedOutcome, HandlerFailure};
pub use lifecycle::{HookError, LifecycleRegistry};
pub use message::{Action, Envelope, FeedBody, FeedRequest, FeedResponse};
pub use transport::{LocalHub, LocalTransport, Socket, Transport, TransportError};
