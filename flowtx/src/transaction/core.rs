use super::delegate::DelegateState;
use super::distributed::DistributedState;
use super::single_resource::SingleResourceState;
use crate::errors::{ErrorKind, TxError, TxResult};
use crate::runtime::TxRuntime;
use crate::transaction::{
    ManagedTransaction, Resource, ResourceConstraints, ResourceKey, SingleResourceHooks,
    TransactionEvents, TransactionNotifier, TransactionRegistry, TransactionStatus,
};
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// Resolution slot. Exactly one of commit or rollback may move it out of
// UNRESOLVED; the loser observes the claimed value.
const UNRESOLVED: u8 = 0;
const COMMITTING: u8 = 1;
const ROLLING_BACK: u8 = 2;
const COMMITTED: u8 = 3;
const ROLLED_BACK: u8 = 4;
const ABANDONED: u8 = 5;

/// Set-once lifecycle flags. Local status is derived from these without a lock.
#[derive(Default)]
pub(crate) struct LifecycleFlags {
    started: AtomicBool,
    committed: AtomicBool,
    rolled_back: AtomicBool,
}

impl LifecycleFlags {
    #[cfg(test)]
    pub(crate) fn begun() -> Self {
        let flags = LifecycleFlags::default();
        flags.started.store(true, Ordering::Release);
        flags
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn terminal(&self) -> Option<TransactionStatus> {
        if self.rolled_back.load(Ordering::Acquire) {
            Some(TransactionStatus::RolledBack)
        } else if self.committed.load(Ordering::Acquire) {
            Some(TransactionStatus::Committed)
        } else {
            None
        }
    }

    pub(crate) fn local_status(&self, rollback_only: bool) -> TransactionStatus {
        match self.terminal() {
            Some(status) => status,
            None if rollback_only => TransactionStatus::MarkedRollback,
            None if self.is_started() => TransactionStatus::Active,
            None => TransactionStatus::NoTransaction,
        }
    }
}

pub(crate) enum TransactionKind {
    SingleResource(SingleResourceState),
    Distributed(DistributedState),
    Delegate(DelegateState),
}

impl TransactionKind {
    fn name(&self) -> &'static str {
        match self {
            TransactionKind::SingleResource(_) => "SingleResourceTransaction",
            TransactionKind::Distributed(_) => "DistributedTransaction",
            TransactionKind::Delegate(_) => "DelegateTransaction",
        }
    }
}

/// A unit of transactional work.
///
/// A transaction is used exactly once: begin, then commit or rollback. Its
/// status only moves forward. Handles are cheap to clone and compare equal
/// when they refer to the same transaction.
///
/// Three variants share this state machine:
/// - single resource: one local resource, resolved through adapter hooks
/// - distributed: any number of enlistable resources coordinated by an
///   external [crate::transaction::TransactionManager]
/// - delegate: becomes one of the above on its first resource binding
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    id: String,
    timeout_ms: AtomicU64,
    rollback_only: AtomicBool,
    resolution: AtomicU8,
    flags: LifecycleFlags,
    notifier: TransactionNotifier,
    registry: TransactionRegistry,
    kind: TransactionKind,
}

impl Transaction {
    fn new(runtime: &TxRuntime, kind: TransactionKind) -> Self {
        Transaction {
            inner: Arc::new(TransactionInner {
                id: Uuid::new_v4().to_string(),
                timeout_ms: AtomicU64::new(runtime.default_transaction_timeout()),
                rollback_only: AtomicBool::new(false),
                resolution: AtomicU8::new(UNRESOLVED),
                flags: LifecycleFlags::default(),
                notifier: runtime.notifier(),
                registry: runtime.registry().clone(),
                kind,
            }),
        }
    }

    /// A local transaction over a single resource, resolved through `hooks`.
    pub fn single_resource(
        runtime: &TxRuntime,
        hooks: Arc<dyn SingleResourceHooks>,
        constraints: ResourceConstraints,
    ) -> Self {
        Self::new(
            runtime,
            TransactionKind::SingleResource(SingleResourceState::new(hooks, constraints)),
        )
    }

    /// A transaction coordinated by the runtime's transaction manager.
    pub fn distributed(runtime: &TxRuntime) -> Self {
        Self::new(
            runtime,
            TransactionKind::Distributed(DistributedState::new(runtime.transaction_manager(), false)),
        )
    }

    /// A transaction that adopts the manager transaction already associated
    /// with the calling worker instead of starting one.
    pub fn external(runtime: &TxRuntime) -> Self {
        Self::new(
            runtime,
            TransactionKind::Distributed(DistributedState::new(runtime.transaction_manager(), true)),
        )
    }

    /// A transaction whose kind is decided by the first resource bound to it.
    /// Plain resources need `local` hooks.
    pub fn delegate(
        runtime: &TxRuntime,
        local: Option<(Arc<dyn SingleResourceHooks>, ResourceConstraints)>,
    ) -> Self {
        Self::new(
            runtime,
            TransactionKind::Delegate(DelegateState::new(runtime.clone(), local)),
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Timeout in milliseconds.
    pub fn timeout(&self) -> u64 {
        self.inner.timeout_ms.load(Ordering::Acquire)
    }

    /// Sets the timeout in milliseconds. Only affects a transaction that has
    /// not begun yet.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.inner.timeout_ms.store(timeout_ms, Ordering::Release);
    }

    pub fn application_name(&self) -> &str {
        self.inner.notifier.application_name()
    }

    pub fn begin(&self) -> TxResult<()> {
        if self.inner.flags.started.swap(true, Ordering::AcqRel) {
            return Err(TxError::new(
                &format!("Transaction {} has already begun", self.id()),
                ErrorKind::IllegalState,
            ));
        }

        if let Err(e) = self.do_begin() {
            self.inner.flags.started.store(false, Ordering::Release);
            log::error!("Failed to begin transaction {}: {}", self.id(), e);
            return Err(e.wrap(&format!("Failed to begin transaction {}", self.id()), ErrorKind::BeginFailed));
        }

        log::debug!("Began transaction {}", self.id());
        // a failed bind leaves the transaction begun but untracked, the caller rolls it back
        self.inner.registry.bind(self)?;
        self.inner.notifier.fire(TransactionEvents::Began, self.id());
        Ok(())
    }

    /// Commits, unbinding from the registry whatever the outcome.
    pub fn commit(&self) -> TxResult<()> {
        let result = self.commit_and_notify();
        self.finish(result, "commit")
    }

    /// Rolls back, unbinding from the registry whatever the outcome. Rolling
    /// back a rolled back transaction is a no-op.
    pub fn rollback(&self) -> TxResult<()> {
        let result = self.rollback_and_notify();
        self.finish(result, "rollback")
    }

    /// Rolls back if marked rollback-only, commits otherwise.
    pub fn resolve(&self) -> TxResult<()> {
        if self.is_rollback_only() {
            self.rollback()
        } else {
            self.commit()
        }
    }

    pub fn set_rollback_only(&self) {
        if !self.inner.rollback_only.swap(true, Ordering::AcqRel) {
            log::debug!("Transaction {} marked for rollback", self.id());
        }

        match &self.inner.kind {
            TransactionKind::SingleResource(_) => {}
            TransactionKind::Distributed(state) => state.set_rollback_only(self.id()),
            TransactionKind::Delegate(state) => state.set_rollback_only(),
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        if self.inner.rollback_only.load(Ordering::Acquire) {
            return true;
        }

        match &self.inner.kind {
            TransactionKind::SingleResource(state) => state.is_rollback_only(),
            TransactionKind::Distributed(state) => state.is_marked_rollback(self.id()),
            TransactionKind::Delegate(state) => state.is_rollback_only(),
        }
    }

    /// Current status. Has no side effects.
    pub fn status(&self) -> TxResult<TransactionStatus> {
        let rollback_only = self.inner.rollback_only.load(Ordering::Acquire);
        match &self.inner.kind {
            TransactionKind::SingleResource(state) => {
                Ok(self.inner.flags.local_status(rollback_only || state.is_rollback_only()))
            }
            TransactionKind::Distributed(state) => state.status(&self.inner.flags, rollback_only),
            TransactionKind::Delegate(state) => state.status(&self.inner.flags, rollback_only),
        }
    }

    /// Like [Transaction::status], with query failures logged and reported as `Unknown`.
    pub fn status_or_unknown(&self) -> TransactionStatus {
        self.status().unwrap_or_else(|e| {
            log::warn!("Failed to query status of transaction {}: {}", self.id(), e);
            TransactionStatus::Unknown
        })
    }

    pub fn is_begun(&self) -> bool {
        self.inner.flags.is_started()
    }

    pub fn is_committed(&self) -> bool {
        self.inner.flags.terminal() == Some(TransactionStatus::Committed)
    }

    pub fn is_rolled_back(&self) -> bool {
        self.inner.flags.terminal() == Some(TransactionStatus::RolledBack)
    }

    /// Whether this transaction is coordinated by the transaction manager.
    /// Only such transactions can be suspended.
    pub fn is_xa(&self) -> bool {
        match &self.inner.kind {
            TransactionKind::SingleResource(_) => false,
            TransactionKind::Distributed(_) => true,
            TransactionKind::Delegate(state) => state.is_xa(),
        }
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.inner.kind, TransactionKind::Delegate(_))
    }

    /// Detaches the manager transaction from the calling worker.
    pub fn suspend(&self) -> TxResult<()> {
        match &self.inner.kind {
            TransactionKind::Distributed(state) => state.suspend(self.id()),
            TransactionKind::Delegate(state) => state.suspend(self.id()),
            TransactionKind::SingleResource(_) => Err(self.not_suspendable()),
        }
    }

    /// Reattaches a suspended manager transaction to the calling worker.
    pub fn resume(&self) -> TxResult<()> {
        match &self.inner.kind {
            TransactionKind::Distributed(state) => state.resume(self.id()),
            TransactionKind::Delegate(state) => state.resume(self.id()),
            TransactionKind::SingleResource(_) => Err(self.not_suspendable()),
        }
    }

    /// Binds a resource to this transaction. Absent arguments fail with
    /// `NullKey` / `NullResource`.
    pub fn bind_resource(
        &self,
        key: impl Into<Option<ResourceKey>>,
        resource: impl Into<Option<Resource>>,
    ) -> TxResult<()> {
        let key = key.into().ok_or_else(|| {
            TxError::new(
                &format!("Cannot bind a resource to transaction {} without a key", self.id()),
                ErrorKind::NullKey,
            )
        })?;
        let resource = resource.into().ok_or_else(|| {
            TxError::new(
                &format!("Cannot bind a null resource to transaction {}", self.id()),
                ErrorKind::NullResource,
            )
        })?;

        match &self.inner.kind {
            TransactionKind::SingleResource(state) => state.bind_resource(self.id(), key, resource),
            TransactionKind::Distributed(state) => state.enlist(self.id(), self.timeout(), key, resource),
            TransactionKind::Delegate(state) => state.bind_resource(self, key, resource),
        }
    }

    /// Enlists a handle with the distributed transaction. Holder keys are
    /// normalized to the factory they wrap.
    pub fn enlist(&self, key: ResourceKey, resource: Resource) -> TxResult<()> {
        match &self.inner.kind {
            TransactionKind::SingleResource(_) => Err(TxError::new(
                &format!("Local transaction {} cannot enlist distributed resources", self.id()),
                ErrorKind::UnsupportedResource,
            )),
            _ => self.bind_resource(key, resource),
        }
    }

    pub fn supports(&self, key: &ResourceKey, resource: &Resource) -> bool {
        match &self.inner.kind {
            TransactionKind::SingleResource(state) => state.supports(key, resource),
            TransactionKind::Distributed(_) => resource.is_enlistable(),
            TransactionKind::Delegate(state) => state.supports(key, resource),
        }
    }

    pub fn has_resource(&self, key: &ResourceKey) -> bool {
        self.resource(key).is_some()
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<Resource> {
        match &self.inner.kind {
            TransactionKind::SingleResource(state) => state.resource(key),
            TransactionKind::Distributed(state) => state.resource(key),
            TransactionKind::Delegate(state) => state.resource(key),
        }
    }

    /// Whether `candidate` may be folded into this transaction instead of
    /// being rejected by the registry. Only delegates accept inner transactions.
    pub fn supports_inner_transaction(&self, candidate: &Transaction) -> bool {
        match &self.inner.kind {
            TransactionKind::Delegate(state) => state.supports_inner_transaction(candidate),
            _ => false,
        }
    }

    /// The manager transaction behind a distributed transaction.
    pub fn managed_transaction(&self) -> Option<Arc<dyn ManagedTransaction>> {
        match &self.inner.kind {
            TransactionKind::Distributed(state) => state.managed_transaction(),
            TransactionKind::Delegate(state) => state.managed_transaction(),
            TransactionKind::SingleResource(_) => None,
        }
    }

    pub(crate) fn is_unresolved(&self) -> bool {
        self.inner.resolution.load(Ordering::Acquire) == UNRESOLVED
    }

    fn do_begin(&self) -> TxResult<()> {
        match &self.inner.kind {
            TransactionKind::SingleResource(state) => state.begin(self.id()),
            TransactionKind::Distributed(state) => state.begin(self.id(), self.timeout()),
            TransactionKind::Delegate(_) => Ok(()),
        }
    }

    fn do_commit(&self) -> TxResult<()> {
        match &self.inner.kind {
            TransactionKind::SingleResource(state) => state.commit(self.id()),
            TransactionKind::Distributed(state) => state.commit(self.id()),
            TransactionKind::Delegate(state) => state.commit(self.id()),
        }
    }

    fn do_rollback(&self) -> TxResult<()> {
        match &self.inner.kind {
            TransactionKind::SingleResource(state) => state.rollback(self.id()),
            TransactionKind::Distributed(state) => state.rollback(self.id(), &self.inner.flags),
            TransactionKind::Delegate(state) => state.rollback(self.id()),
        }
    }

    fn commit_and_notify(&self) -> TxResult<()> {
        if self.is_rollback_only() {
            return Err(TxError::new(
                &format!("Transaction {} is marked for rollback and cannot be committed", self.id()),
                ErrorKind::IllegalState,
            ));
        }
        if !self.is_begun() {
            return Err(TxError::new(
                &format!("Transaction {} has not begun", self.id()),
                ErrorKind::IllegalState,
            ));
        }
        self.claim(COMMITTING)
            .map_err(|state| self.resolution_conflict("commit", state))?;

        match self.do_commit() {
            Ok(()) => {
                self.inner.flags.committed.store(true, Ordering::Release);
                self.inner.resolution.store(COMMITTED, Ordering::Release);
                log::debug!("Committed transaction {}", self.id());
                self.inner.notifier.fire(TransactionEvents::Committed, self.id());
                Ok(())
            }
            Err(e) if e.is_heuristic_rollback() => {
                self.inner.rollback_only.store(true, Ordering::Release);
                self.inner.flags.rolled_back.store(true, Ordering::Release);
                self.inner.resolution.store(ROLLED_BACK, Ordering::Release);
                log::warn!("Transaction {} was rolled back by the transaction manager: {}", self.id(), e);
                self.inner.notifier.fire(TransactionEvents::RolledBack, self.id());
                Err(e)
            }
            Err(e) => {
                // give the caller a chance to roll back
                self.inner.resolution.store(UNRESOLVED, Ordering::Release);
                log::error!("Failed to commit transaction {}: {}", self.id(), e);
                Err(e.wrap(&format!("Failed to commit transaction {}", self.id()), ErrorKind::CommitFailed))
            }
        }
    }

    fn rollback_and_notify(&self) -> TxResult<()> {
        self.set_rollback_only();

        match self.claim(ROLLING_BACK) {
            Ok(()) => {}
            Err(ROLLED_BACK) => {
                log::debug!("Transaction {} is already rolled back", self.id());
                return Ok(());
            }
            Err(state) => return Err(self.resolution_conflict("roll back", state)),
        }

        match self.do_rollback() {
            Ok(()) => {
                self.inner.flags.rolled_back.store(true, Ordering::Release);
                self.inner.resolution.store(ROLLED_BACK, Ordering::Release);
                log::debug!("Rolled back transaction {}", self.id());
                self.inner.notifier.fire(TransactionEvents::RolledBack, self.id());
                Ok(())
            }
            Err(e) => {
                self.inner.resolution.store(ABANDONED, Ordering::Release);
                log::error!("Failed to roll back transaction {}, abandoning it: {}", self.id(), e);
                Err(e.wrap(&format!("Failed to roll back transaction {}", self.id()), ErrorKind::RollbackFailed))
            }
        }
    }

    fn finish(&self, result: TxResult<()>, operation: &str) -> TxResult<()> {
        match (result, self.inner.registry.unbind(self)) {
            (Ok(()), unbound) => unbound,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unbind_error)) => {
                log::warn!(
                    "Failed to unbind transaction {} after failed {}: {}",
                    self.id(),
                    operation,
                    unbind_error
                );
                Err(e)
            }
        }
    }

    fn claim(&self, target: u8) -> Result<(), u8> {
        self.inner
            .resolution
            .compare_exchange(UNRESOLVED, target, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    fn resolution_conflict(&self, operation: &str, state: u8) -> TxError {
        let reason = match state {
            COMMITTING => "is being committed",
            ROLLING_BACK => "is being rolled back",
            COMMITTED => "is already committed",
            ROLLED_BACK => "is already rolled back",
            _ => "was abandoned after a failed rollback",
        };
        TxError::new(
            &format!("Cannot {} transaction {}: it {}", operation, self.id(), reason),
            ErrorKind::IllegalState,
        )
    }

    fn not_suspendable(&self) -> TxError {
        TxError::new(
            &format!("Local transaction {} cannot be suspended or resumed", self.id()),
            ErrorKind::IllegalState,
        )
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl Display for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{{id={}, status={}}}",
            self.inner.kind.name(),
            self.id(),
            self.status_or_unknown()
        )
    }
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.inner.kind.name())
            .field("id", &self.id())
            .field("timeout_ms", &self.timeout())
            .field("rollback_only", &self.inner.rollback_only.load(Ordering::Acquire))
            .field("resolution", &self.inner.resolution.load(Ordering::Acquire))
            .finish()
    }
}
