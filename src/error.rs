//! The error taxonomy shared by the queue client, the enqueuer, and the
//! worker loop. Each handling site matches on these variants explicitly
//! rather than inspecting error classes or message strings.

use std::io;

use thiserror::Error;

/// Errors raised by the queue client and connection pool.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The server is unreachable, closed the connection, or the transport
    /// failed mid-exchange. Callers at the lease boundary back off and retry.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    /// A reserved job held by this client will hit its TTR within a second.
    /// Callers retry immediately, giving cleanup hooks a chance to run.
    #[error("job deadline soon")]
    DeadlineSoon,
    /// The server no longer considers the job ours, typically because the
    /// lease expired or the job was already resolved. Disposition call-sites
    /// treat this as non-fatal.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    /// The server sent something outside the response grammar, or refused an
    /// operation outright. The session is dropped and reopened.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors raised at submission time, before or during an enqueue attempt.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The task descriptor could not be rendered into the wire format. Raised
    /// synchronously, before any enqueue attempt.
    #[error("task descriptor is not serializable")]
    NotSerializable(#[from] serde_yaml::Error),
    /// A fanout degree below one was requested.
    #[error("invalid fanout degree: {0}")]
    InvalidFanout(u64),
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A task dispatched synchronously (no queue configured) failed.
    #[error("synchronous task execution failed")]
    Sync(#[source] RunError),
}

/// Errors raised while running a single job's task descriptor. The worker
/// converts these into a disposition at the dispatch boundary.
#[derive(Debug, Error)]
pub enum RunError {
    /// A referenced entity cannot currently be found. Treated as transient:
    /// the job is retried unless it has grown stale.
    #[error("referenced entity is missing")]
    MissingEntity,
    /// The descriptor names an operation with no registry entry.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    /// The descriptor is structurally valid YAML but doesn't make sense for
    /// the operation it names.
    #[error("bad task descriptor: {0}")]
    BadDescriptor(String),
    /// Any other failure during task execution. Dead-lettered by default.
    #[error("task failed")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Fatal worker-process errors: these stop the loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no queue has been configured")]
    NoQueue,
    #[error("no custom handler is defined for non-task jobs")]
    NoExternalHandler,
}
