use super::core::LifecycleFlags;
use crate::errors::{ErrorKind, TxError, TxResult};
use crate::runtime::TxRuntime;
use crate::transaction::{
    ManagedTransaction, Resource, ResourceConstraints, ResourceKey, SingleResourceHooks, Transaction,
    TransactionStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Undetermined transaction that becomes local or distributed on its first
/// binding. The chosen inner transaction is registered through the delegate,
/// so the registry only ever sees the delegate.
pub(crate) struct DelegateState {
    runtime: TxRuntime,
    local: Option<(Arc<dyn SingleResourceHooks>, ResourceConstraints)>,
    delegate: OnceLock<Transaction>,
    rollback_only: AtomicBool,
}

impl DelegateState {
    pub(crate) fn new(
        runtime: TxRuntime,
        local: Option<(Arc<dyn SingleResourceHooks>, ResourceConstraints)>,
    ) -> Self {
        DelegateState {
            runtime,
            local,
            delegate: OnceLock::new(),
            rollback_only: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::Release);
        if let Some(delegate) = self.delegate.get() {
            delegate.set_rollback_only();
        }
    }

    pub(crate) fn is_rollback_only(&self) -> bool {
        self.delegate
            .get()
            .map(|delegate| delegate.is_rollback_only())
            .unwrap_or(false)
    }

    pub(crate) fn status(&self, flags: &LifecycleFlags, rollback_only: bool) -> TxResult<TransactionStatus> {
        match self.delegate.get() {
            Some(delegate) => delegate.status(),
            None => Ok(flags.local_status(rollback_only)),
        }
    }

    pub(crate) fn is_xa(&self) -> bool {
        self.delegate.get().map(|delegate| delegate.is_xa()).unwrap_or(false)
    }

    pub(crate) fn suspend(&self, transaction_id: &str) -> TxResult<()> {
        self.xa_delegate(transaction_id, "suspended")?.suspend()
    }

    pub(crate) fn resume(&self, transaction_id: &str) -> TxResult<()> {
        self.xa_delegate(transaction_id, "resumed")?.resume()
    }

    fn xa_delegate(&self, transaction_id: &str, operation: &str) -> TxResult<&Transaction> {
        match self.delegate.get() {
            Some(delegate) if delegate.is_xa() => Ok(delegate),
            _ => Err(TxError::new(
                &format!("Transaction {} is not distributed and cannot be {}", transaction_id, operation),
                ErrorKind::IllegalState,
            )),
        }
    }

    pub(crate) fn bind_resource(&self, owner: &Transaction, key: ResourceKey, resource: Resource) -> TxResult<()> {
        if let Some(delegate) = self.delegate.get() {
            return delegate.bind_resource(key, resource);
        }

        if !owner.is_begun() || !owner.is_unresolved() {
            return Err(TxError::new(
                &format!("Cannot bind a resource to transaction {} outside of its active lifetime", owner.id()),
                ErrorKind::IllegalState,
            ));
        }

        let candidate = self.create_delegate(owner, &key, &resource)?;
        candidate.set_timeout(owner.timeout());
        candidate.begin()?;

        let delegate = match self.delegate.set(candidate.clone()) {
            Ok(()) => {
                log::debug!("Transaction {} delegates to {}", owner.id(), candidate);
                &candidate
            }
            Err(_) => {
                if let Err(e) = candidate.rollback() {
                    log::warn!("Failed to discard surplus delegate of transaction {}: {}", owner.id(), e);
                }
                self.delegate.get().ok_or_else(|| {
                    TxError::new(
                        &format!("Delegate of transaction {} vanished", owner.id()),
                        ErrorKind::InternalError,
                    )
                })?
            }
        };

        if self.rollback_only.load(Ordering::Acquire) {
            delegate.set_rollback_only();
        }
        delegate.bind_resource(key, resource)
    }

    fn create_delegate(&self, owner: &Transaction, key: &ResourceKey, resource: &Resource) -> TxResult<Transaction> {
        if resource.is_enlistable() {
            return Ok(Transaction::distributed(&self.runtime));
        }

        match &self.local {
            Some((hooks, constraints)) if constraints.accepts(key, resource) => Ok(Transaction::single_resource(
                &self.runtime,
                hooks.clone(),
                *constraints,
            )),
            _ => Err(TxError::new(
                &format!("Transaction {} has no local support for {:?}", owner.id(), resource),
                ErrorKind::UnsupportedResource,
            )),
        }
    }

    pub(crate) fn supports(&self, key: &ResourceKey, resource: &Resource) -> bool {
        match self.delegate.get() {
            Some(delegate) => delegate.supports(key, resource),
            None if resource.is_enlistable() => true,
            None => self
                .local
                .as_ref()
                .map(|(_, constraints)| constraints.accepts(key, resource))
                .unwrap_or(false),
        }
    }

    pub(crate) fn resource(&self, key: &ResourceKey) -> Option<Resource> {
        self.delegate.get().and_then(|delegate| delegate.resource(key))
    }

    pub(crate) fn supports_inner_transaction(&self, candidate: &Transaction) -> bool {
        if candidate.is_delegate() {
            return false;
        }
        match self.delegate.get() {
            None => true,
            Some(delegate) => delegate == candidate || delegate.is_xa() == candidate.is_xa(),
        }
    }

    pub(crate) fn managed_transaction(&self) -> Option<Arc<dyn ManagedTransaction>> {
        self.delegate.get().and_then(|delegate| delegate.managed_transaction())
    }

    pub(crate) fn commit(&self, transaction_id: &str) -> TxResult<()> {
        match self.delegate.get() {
            Some(delegate) => delegate.commit(),
            None => {
                log::debug!("Transaction {} committed without any bound resource", transaction_id);
                Ok(())
            }
        }
    }

    pub(crate) fn rollback(&self, transaction_id: &str) -> TxResult<()> {
        match self.delegate.get() {
            Some(delegate) => delegate.rollback(),
            None => {
                log::debug!("Transaction {} rolled back without any bound resource", transaction_id);
                Ok(())
            }
        }
    }
}
