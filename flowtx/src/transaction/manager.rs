use crate::errors::TxResult;
use crate::transaction::{TransactionStatus, XaResource};
use std::sync::Arc;

/// The external transaction manager that distributed transactions delegate to.
///
/// Implementations wrap a real manager (an XA coordinator, an application
/// server's manager). All calls block the calling worker.
pub trait TransactionManager: Send + Sync {
    /// Sets the timeout, in seconds, used by the next `begin` on this worker.
    fn set_transaction_timeout(&self, seconds: u32) -> TxResult<()>;

    /// Starts a manager transaction associated with the calling worker.
    fn begin(&self) -> TxResult<Arc<dyn ManagedTransaction>>;

    /// The manager transaction associated with the calling worker, if any.
    fn current(&self) -> TxResult<Option<Arc<dyn ManagedTransaction>>>;

    /// Detaches the worker's manager transaction and returns it.
    fn suspend(&self) -> TxResult<Option<Arc<dyn ManagedTransaction>>>;

    /// Reattaches a previously suspended manager transaction to the worker.
    fn resume(&self, transaction: Arc<dyn ManagedTransaction>) -> TxResult<()>;
}

/// A transaction owned by the external manager.
///
/// `commit` must report a unilateral rollback with
/// [crate::errors::ErrorKind::HeuristicRollback].
pub trait ManagedTransaction: Send + Sync {
    fn commit(&self) -> TxResult<()>;

    fn rollback(&self) -> TxResult<()>;

    fn set_rollback_only(&self) -> TxResult<()>;

    fn status(&self) -> TxResult<TransactionStatus>;

    fn enlist_resource(&self, resource: &Arc<dyn XaResource>) -> TxResult<bool>;
}

/// Converts a millisecond timeout to the whole seconds a manager expects.
///
/// The division truncates toward zero: 1999 ms becomes 1 s and anything
/// below one second becomes 0, which most managers read as "use the
/// manager default". Existing integrations depend on this, keep it.
#[inline]
pub fn timeout_as_seconds(timeout_ms: u64) -> u32 {
    u32::try_from(timeout_ms / 1000).unwrap_or(u32::MAX)
}
