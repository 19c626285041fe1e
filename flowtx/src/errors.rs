use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;

use crate::{atomic, Atomic};

/// Error kinds for transaction demarcation.
///
/// Each kind names one failure category so callers can react differently, most notably
/// to tell a [ErrorKind::HeuristicRollback] apart from an ordinary [ErrorKind::CommitFailed].
///
/// # Examples
///
/// ```rust,ignore
/// use flowtx::errors::{TxError, ErrorKind, TxResult};
///
/// fn example() -> TxResult<()> {
///     Err(TxError::new("Transaction is marked for rollback", ErrorKind::IllegalState))
/// }
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    // Wiring errors
    /// A demarcation action needs a factory that was not configured, or a
    /// runtime setting was rejected
    ConfigurationError,

    // Binding errors
    /// A different transaction is already bound to the worker
    AlreadyBound,
    /// A resource is already bound or enlisted under the same key
    AlreadyBoundResource,
    /// Attempt to bind a resource without a key
    NullKey,
    /// Attempt to bind an absent resource
    NullResource,
    /// The resource kind cannot take part in this transaction
    UnsupportedResource,

    // State errors
    /// The operation is invalid for the current transaction status
    IllegalState,

    // Hook failures
    /// The real begin against the resource or manager failed
    BeginFailed,
    /// The real commit failed
    CommitFailed,
    /// Commit was requested but the transaction manager rolled back on its own
    HeuristicRollback,
    /// The real rollback failed, the transaction must be abandoned
    RollbackFailed,
    /// The transaction status could not be determined
    StatusQuery,
    /// A distributed operation was requested without a transaction manager
    NoTransactionManager,
    /// Suspending the manager transaction failed
    SuspendFailed,
    /// Resuming the manager transaction failed
    ResumeFailed,
    /// A resource adapter reported a failure (enlist, delist, close)
    ResourceError,

    // Event Errors
    /// Error in notification delivery
    EventError,

    // Extension Errors - lets resource adapter crates plug in their own categories
    /// Error from an adapter module (e.g. "jdbc", "jms")
    Extension(String),

    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ConfigurationError => write!(f, "Configuration error"),
            ErrorKind::AlreadyBound => write!(f, "Transaction already bound"),
            ErrorKind::AlreadyBoundResource => write!(f, "Resource already bound"),
            ErrorKind::NullKey => write!(f, "Null resource key"),
            ErrorKind::NullResource => write!(f, "Null resource"),
            ErrorKind::UnsupportedResource => write!(f, "Unsupported resource"),
            ErrorKind::IllegalState => write!(f, "Illegal transaction state"),
            ErrorKind::BeginFailed => write!(f, "Begin failed"),
            ErrorKind::CommitFailed => write!(f, "Commit failed"),
            ErrorKind::HeuristicRollback => write!(f, "Heuristic rollback"),
            ErrorKind::RollbackFailed => write!(f, "Rollback failed"),
            ErrorKind::StatusQuery => write!(f, "Status query failed"),
            ErrorKind::NoTransactionManager => write!(f, "No transaction manager"),
            ErrorKind::SuspendFailed => write!(f, "Suspend failed"),
            ErrorKind::ResumeFailed => write!(f, "Resume failed"),
            ErrorKind::ResourceError => write!(f, "Resource error"),
            ErrorKind::EventError => write!(f, "Event error"),
            ErrorKind::Extension(name) => write!(f, "{} error", name),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Error type for every fallible flowtx operation.
///
/// `TxError` carries a message, a kind, an optional cause and the backtrace captured
/// at construction. Hook failures are wrapped with the original error kept as cause.
///
/// ```rust,ignore
/// use flowtx::errors::{TxError, ErrorKind};
///
/// let cause = TxError::new("connection reset", ErrorKind::ResourceError);
/// let err = TxError::new_with_cause("Failed to commit transaction", ErrorKind::CommitFailed, cause);
/// ```
#[derive(Clone)]
pub struct TxError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<TxError>>,
    backtrace: Atomic<Backtrace>,
}

impl TxError {
    /// Creates a new `TxError` with the specified message and error kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        TxError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: atomic(Backtrace::new()),
        }
    }

    /// Creates a new `TxError` that keeps `cause` in its error chain.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: TxError) -> Self {
        TxError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: atomic(Backtrace::new()),
        }
    }

    /// Wraps a hook failure into `kind`, unless it already carries a classification
    /// the caller must see unchanged.
    pub(crate) fn wrap(self, message: &str, kind: ErrorKind) -> Self {
        match self.error_kind {
            ErrorKind::HeuristicRollback
            | ErrorKind::IllegalState
            | ErrorKind::NoTransactionManager => self,
            _ => TxError::new_with_cause(message, kind, self),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&TxError> {
        self.cause.as_deref()
    }

    /// Returns `true` when the manager rolled the transaction back during a commit.
    pub fn is_heuristic_rollback(&self) -> bool {
        self.error_kind == ErrorKind::HeuristicRollback
    }
}

impl Display for TxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for TxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print error message with stack trace followed by cause
        match &self.cause {
            Some(cause) => write!(f, "{} ({})\nCaused by: {:?}", self.message, self.error_kind, cause),
            None => write!(f, "{} ({})\n{:?}", self.message, self.error_kind, self.backtrace.read()),
        }
    }
}

impl Error for TxError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for flowtx operations.
pub type TxResult<T> = Result<T, TxError>;

impl From<String> for TxError {
    fn from(msg: String) -> Self {
        TxError::new(&msg, ErrorKind::InternalError)
    }
}

impl From<&str> for TxError {
    fn from(msg: &str) -> Self {
        TxError::new(msg, ErrorKind::InternalError)
    }
}
