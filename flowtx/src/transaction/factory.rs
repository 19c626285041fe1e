use crate::errors::TxResult;
use crate::runtime::TxRuntime;
use crate::transaction::{ResourceConstraints, SingleResourceHooks, Transaction};
use std::sync::Arc;

/// Creates and begins transactions for a demarcated step.
pub trait TransactionFactory: Send + Sync {
    /// Creates a transaction, sets its timeout and begins it. The begun
    /// transaction is bound to the calling worker.
    fn begin_transaction(&self, runtime: &TxRuntime, timeout_ms: u64) -> TxResult<Transaction>;

    /// Adopts a transaction started outside the runtime, if there is one.
    fn join_external_transaction(&self, _runtime: &TxRuntime) -> TxResult<Option<Transaction>> {
        Ok(None)
    }
}

fn begin(transaction: Transaction, timeout_ms: u64) -> TxResult<Transaction> {
    transaction.set_timeout(timeout_ms);
    if let Err(e) = transaction.begin() {
        // begun but not bound, nobody else will resolve it
        if transaction.is_begun() {
            if let Err(rollback_error) = transaction.rollback() {
                log::error!("Failed to roll back untracked transaction {}: {}", transaction.id(), rollback_error);
            }
        }
        return Err(e);
    }
    Ok(transaction)
}

fn join_external(runtime: &TxRuntime) -> TxResult<Option<Transaction>> {
    let manager = match runtime.transaction_manager() {
        Some(manager) => manager,
        None => return Ok(None),
    };
    if manager.current()?.is_none() {
        return Ok(None);
    }

    let transaction = Transaction::external(runtime);
    transaction.begin()?;
    log::debug!("Joined external transaction as {}", transaction.id());
    Ok(Some(transaction))
}

/// Factory of local transactions over one resource.
pub struct SingleResourceTransactionFactory {
    hooks: Arc<dyn SingleResourceHooks>,
    constraints: ResourceConstraints,
}

impl SingleResourceTransactionFactory {
    pub fn new(hooks: Arc<dyn SingleResourceHooks>) -> Self {
        SingleResourceTransactionFactory {
            hooks,
            constraints: ResourceConstraints::any(),
        }
    }

    pub fn with_constraints(mut self, constraints: ResourceConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

impl TransactionFactory for SingleResourceTransactionFactory {
    fn begin_transaction(&self, runtime: &TxRuntime, timeout_ms: u64) -> TxResult<Transaction> {
        begin(
            Transaction::single_resource(runtime, self.hooks.clone(), self.constraints),
            timeout_ms,
        )
    }
}

/// Factory of transactions coordinated by the runtime's transaction manager.
#[derive(Default)]
pub struct DistributedTransactionFactory;

impl DistributedTransactionFactory {
    pub fn new() -> Self {
        DistributedTransactionFactory
    }
}

impl TransactionFactory for DistributedTransactionFactory {
    fn begin_transaction(&self, runtime: &TxRuntime, timeout_ms: u64) -> TxResult<Transaction> {
        begin(Transaction::distributed(runtime), timeout_ms)
    }

    fn join_external_transaction(&self, runtime: &TxRuntime) -> TxResult<Option<Transaction>> {
        join_external(runtime)
    }
}

/// Factory of transactions that pick their kind on first resource binding.
#[derive(Default)]
pub struct DelegateTransactionFactory {
    local: Option<(Arc<dyn SingleResourceHooks>, ResourceConstraints)>,
}

impl DelegateTransactionFactory {
    pub fn new() -> Self {
        DelegateTransactionFactory::default()
    }

    /// Lets the created transactions bind plain resources through `hooks`.
    pub fn with_local_support(mut self, hooks: Arc<dyn SingleResourceHooks>, constraints: ResourceConstraints) -> Self {
        self.local = Some((hooks, constraints));
        self
    }
}

impl TransactionFactory for DelegateTransactionFactory {
    fn begin_transaction(&self, runtime: &TxRuntime, timeout_ms: u64) -> TxResult<Transaction> {
        begin(Transaction::delegate(runtime, self.local.clone()), timeout_ms)
    }

    fn join_external_transaction(&self, runtime: &TxRuntime) -> TxResult<Option<Transaction>> {
        join_external(runtime)
    }
}
