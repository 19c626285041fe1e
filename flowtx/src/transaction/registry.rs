use crate::common::WorkerId;
use crate::errors::{ErrorKind, TxError, TxResult};
use crate::transaction::Transaction;
use dashmap::DashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct WorkerSlots {
    current: Option<Transaction>,
    suspended: SmallVec<[Transaction; 2]>,
    isolated: SmallVec<[Transaction; 2]>,
}

impl WorkerSlots {
    fn is_empty(&self) -> bool {
        self.current.is_none() && self.suspended.is_empty() && self.isolated.is_empty()
    }
}

/// Binds transactions to the worker executing them.
///
/// Each worker holds at most one current transaction, plus a stack of
/// suspended and a stack of isolated ones. A worker only ever reads and
/// writes its own slots, so the map is the only synchronization needed.
///
/// Never call back into a transaction while a map guard is alive: every
/// operation clones what it needs out of the slot first.
#[derive(Clone, Default)]
pub struct TransactionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    workers: DashMap<WorkerId, WorkerSlots>,
    bound: AtomicUsize,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        TransactionRegistry::default()
    }

    /// The transaction bound to the calling worker.
    pub fn current(&self) -> Option<Transaction> {
        self.inner
            .workers
            .get(&WorkerId::current())
            .and_then(|slots| slots.current.clone())
    }

    pub fn has_current(&self) -> bool {
        self.current().is_some()
    }

    /// Binds `transaction` to the calling worker.
    ///
    /// Binding the bound transaction again is a no-op, as is binding a
    /// transaction the bound delegate accepts as its inner transaction.
    pub fn bind(&self, transaction: &Transaction) -> TxResult<()> {
        match self.current() {
            Some(bound) if &bound == transaction => Ok(()),
            Some(bound) if bound.supports_inner_transaction(transaction) => {
                log::debug!("Transaction {} is folded into bound {}", transaction.id(), bound.id());
                Ok(())
            }
            Some(bound) => Err(Self::already_bound(&bound, transaction)),
            None => {
                self.with_slots(|slots| slots.current = Some(transaction.clone()));
                self.inner.bound.fetch_add(1, Ordering::AcqRel);
                log::debug!("Bound transaction {} to worker {}", transaction.id(), WorkerId::current());
                Ok(())
            }
        }
    }

    /// Unbinds `transaction` from the calling worker. A no-op when nothing
    /// is bound.
    pub fn unbind(&self, transaction: &Transaction) -> TxResult<()> {
        match self.current() {
            None => Ok(()),
            Some(bound) if &bound == transaction => {
                self.take_current();
                log::debug!("Unbound transaction {} from worker {}", transaction.id(), WorkerId::current());
                Ok(())
            }
            Some(bound) if bound.supports_inner_transaction(transaction) => Ok(()),
            Some(bound) => Err(Self::already_bound(&bound, transaction)),
        }
    }

    /// Suspends the bound distributed transaction and moves it to the
    /// suspended stack.
    pub fn suspend(&self) -> TxResult<Transaction> {
        let transaction = self.current().ok_or_else(|| {
            TxError::new("No transaction is bound to suspend", ErrorKind::IllegalState)
        })?;
        if !transaction.is_xa() {
            return Err(TxError::new(
                &format!("Transaction {} does not support suspension", transaction.id()),
                ErrorKind::IllegalState,
            ));
        }

        transaction.suspend()?;
        self.take_current();
        self.with_slots(|slots| slots.suspended.push(transaction.clone()));
        log::debug!("Suspended transaction {} on worker {}", transaction.id(), WorkerId::current());
        Ok(transaction)
    }

    /// Rebinds and resumes the most recently suspended transaction, if any.
    /// Failures are logged.
    pub fn resume_if_suspended(&self) -> Option<Transaction> {
        let transaction = self.pop_with(|slots| slots.suspended.pop())?;

        if let Err(e) = self.bind(&transaction) {
            log::error!("Failed to rebind suspended transaction {}: {}", transaction.id(), e);
            self.with_slots(|slots| slots.suspended.push(transaction));
            return None;
        }
        if let Err(e) = transaction.resume() {
            log::error!("Failed to resume transaction {}: {}", transaction.id(), e);
        }
        log::debug!("Resumed transaction {} on worker {}", transaction.id(), WorkerId::current());
        Some(transaction)
    }

    /// Hides the bound transaction from the calling worker.
    pub fn isolate(&self) -> Option<Transaction> {
        let transaction = self.take_current()?;
        self.with_slots(|slots| slots.isolated.push(transaction.clone()));
        log::debug!("Isolated transaction {} on worker {}", transaction.id(), WorkerId::current());
        Some(transaction)
    }

    /// Rebinds the most recently isolated transaction. Fails with
    /// `AlreadyBound`, keeping it isolated, if another transaction took the slot.
    pub fn restore_isolated(&self) -> TxResult<Option<Transaction>> {
        let isolated = self
            .inner
            .workers
            .get(&WorkerId::current())
            .and_then(|slots| slots.isolated.last().cloned());
        let transaction = match isolated {
            Some(transaction) => transaction,
            None => return Ok(None),
        };

        if let Some(bound) = self.current() {
            return Err(Self::already_bound(&bound, &transaction));
        }

        self.with_slots(|slots| {
            slots.isolated.pop();
            slots.current = Some(transaction.clone());
        });
        self.inner.bound.fetch_add(1, Ordering::AcqRel);
        log::debug!("Restored transaction {} on worker {}", transaction.id(), WorkerId::current());
        Ok(Some(transaction))
    }

    /// Commits the bound transaction, or rolls it back if it is marked
    /// rollback-only.
    pub fn resolve_current(&self) -> TxResult<()> {
        match self.current() {
            Some(transaction) => transaction.resolve(),
            None => Ok(()),
        }
    }

    /// Drops all state of the calling worker.
    pub fn clear(&self) {
        if let Some((worker, slots)) = self.inner.workers.remove(&WorkerId::current()) {
            if let Some(current) = &slots.current {
                self.inner.bound.fetch_sub(1, Ordering::AcqRel);
                log::warn!("Discarding bound transaction {} of worker {}", current.id(), worker);
            }
            if !slots.suspended.is_empty() || !slots.isolated.is_empty() {
                log::warn!(
                    "Discarding {} suspended and {} isolated transactions of worker {}",
                    slots.suspended.len(),
                    slots.isolated.len(),
                    worker
                );
            }
        }
    }

    /// Number of transactions bound across all workers.
    pub fn transaction_count(&self) -> usize {
        self.inner.bound.load(Ordering::Acquire)
    }

    pub fn suspended_count(&self) -> usize {
        self.inner
            .workers
            .get(&WorkerId::current())
            .map(|slots| slots.suspended.len())
            .unwrap_or(0)
    }

    pub fn isolated_count(&self) -> usize {
        self.inner
            .workers
            .get(&WorkerId::current())
            .map(|slots| slots.isolated.len())
            .unwrap_or(0)
    }

    fn take_current(&self) -> Option<Transaction> {
        let taken = self.pop_with(|slots| slots.current.take());
        if taken.is_some() {
            self.inner.bound.fetch_sub(1, Ordering::AcqRel);
        }
        taken
    }

    fn pop_with(&self, f: impl FnOnce(&mut WorkerSlots) -> Option<Transaction>) -> Option<Transaction> {
        let worker = WorkerId::current();
        let taken = self.inner.workers.get_mut(&worker).and_then(|mut slots| f(&mut slots));
        self.inner.workers.remove_if(&worker, |_, slots| slots.is_empty());
        taken
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut WorkerSlots) -> R) -> R {
        let mut slots = self.inner.workers.entry(WorkerId::current()).or_default();
        f(&mut slots)
    }

    fn already_bound(bound: &Transaction, transaction: &Transaction) -> TxError {
        TxError::new(
            &format!(
                "Transaction {} is bound to worker {}, cannot bind or unbind {}",
                bound.id(),
                WorkerId::current(),
                transaction.id()
            ),
            ErrorKind::AlreadyBound,
        )
    }
}
