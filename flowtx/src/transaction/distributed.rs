use super::core::LifecycleFlags;
use crate::common::{atomic, Atomic, ReadExecutor, WriteExecutor};
use crate::errors::{ErrorKind, TxError, TxResult};
use crate::transaction::{
    timeout_as_seconds, ManagedTransaction, Resource, ResourceIdentity, ResourceKey,
    TransactionManager, TransactionStatus,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct DistributedState {
    manager: Option<Arc<dyn TransactionManager>>,
    handle: Atomic<Option<Arc<dyn ManagedTransaction>>>,
    resources: Mutex<IndexMap<ResourceIdentity, (ResourceKey, Resource)>>,
    suspended: AtomicBool,
    external: bool,
}

impl DistributedState {
    pub(crate) fn new(manager: Option<Arc<dyn TransactionManager>>, external: bool) -> Self {
        DistributedState {
            manager,
            handle: atomic(None),
            resources: Mutex::new(IndexMap::new()),
            suspended: AtomicBool::new(false),
            external,
        }
    }

    fn manager(&self, transaction_id: &str) -> TxResult<&Arc<dyn TransactionManager>> {
        self.manager.as_ref().ok_or_else(|| {
            TxError::new(
                &format!("No transaction manager is configured for distributed transaction {}", transaction_id),
                ErrorKind::NoTransactionManager,
            )
        })
    }

    pub(crate) fn managed_transaction(&self) -> Option<Arc<dyn ManagedTransaction>> {
        self.handle.read_with(|handle| handle.clone())
    }

    pub(crate) fn begin(&self, transaction_id: &str, timeout_ms: u64) -> TxResult<()> {
        let manager = self.manager(transaction_id)?;
        let handle = if self.external {
            manager.current()?.ok_or_else(|| {
                TxError::new(
                    &format!("No external transaction to join for transaction {}", transaction_id),
                    ErrorKind::IllegalState,
                )
            })?
        } else {
            manager.set_transaction_timeout(timeout_as_seconds(timeout_ms))?;
            manager.begin()?
        };
        self.handle.write_with(|slot| *slot = Some(handle));
        Ok(())
    }

    pub(crate) fn enlist(
        &self,
        transaction_id: &str,
        timeout_ms: u64,
        key: ResourceKey,
        resource: Resource,
    ) -> TxResult<()> {
        if !resource.is_enlistable() {
            return Err(TxError::new(
                &format!("Distributed transaction {} only accepts enlistable resources", transaction_id),
                ErrorKind::UnsupportedResource,
            ));
        }
        if self.suspended.load(Ordering::Acquire) {
            return Err(TxError::new(
                &format!("Cannot enlist a resource while transaction {} is suspended", transaction_id),
                ErrorKind::IllegalState,
            ));
        }

        let handle = self.managed_transaction().ok_or_else(|| {
            TxError::new(
                &format!("Transaction {} has no active manager transaction", transaction_id),
                ErrorKind::IllegalState,
            )
        })?;

        let key = key.normalize();
        let identity = key.identity();
        {
            let mut resources = self.resources.lock();
            if resources.contains_key(&identity) {
                return Err(TxError::new(
                    &format!("A resource is already enlisted in transaction {} for key {:?}", transaction_id, key),
                    ErrorKind::AlreadyBoundResource,
                ));
            }
            resources.insert(identity.clone(), (key, resource.clone()));
        }

        // the map entry reserves the key, the manager call runs unlocked
        if let Err(e) = Self::enlist_with_manager(transaction_id, timeout_ms, &handle, &resource) {
            self.resources.lock().shift_remove(&identity);
            return Err(e);
        }

        log::debug!("Enlisted {:?} in transaction {}", resource, transaction_id);
        Ok(())
    }

    fn enlist_with_manager(
        transaction_id: &str,
        timeout_ms: u64,
        handle: &Arc<dyn ManagedTransaction>,
        resource: &Resource,
    ) -> TxResult<()> {
        let enlisted = match resource {
            Resource::SelfEnlisting(r) => r.enlist(handle)?,
            Resource::Xa(r) => {
                r.set_transaction_timeout(timeout_as_seconds(timeout_ms))?;
                handle.enlist_resource(r)?
            }
            Resource::Plain(_) => false,
        };

        if enlisted {
            Ok(())
        } else {
            Err(TxError::new(
                &format!("Failed to enlist {:?} in transaction {}", resource, transaction_id),
                ErrorKind::ResourceError,
            ))
        }
    }

    pub(crate) fn resource(&self, key: &ResourceKey) -> Option<Resource> {
        self.resources
            .lock()
            .get(&key.identity())
            .map(|(_, resource)| resource.clone())
    }

    pub(crate) fn commit(&self, transaction_id: &str) -> TxResult<()> {
        let handle = self.take_handle(transaction_id)?;
        self.delist_all(transaction_id);
        // joined transactions are resolved by whoever started them
        let result = if self.external { Ok(()) } else { handle.commit() };
        match &result {
            // the caller still has to roll the manager transaction back
            Err(e) if !e.is_heuristic_rollback() => self.handle.write_with(|slot| *slot = Some(handle)),
            _ => self.close_all(transaction_id),
        }
        result
    }

    pub(crate) fn rollback(&self, transaction_id: &str, flags: &LifecycleFlags) -> TxResult<()> {
        let handle = match self.handle.write_with(|slot| slot.take()) {
            Some(handle) => handle,
            None if flags.is_started() => {
                self.close_all(transaction_id);
                return Err(TxError::new(
                    &format!("Transaction {} has no manager transaction left to roll back", transaction_id),
                    ErrorKind::IllegalState,
                ));
            }
            None => {
                self.close_all(transaction_id);
                return Ok(());
            }
        };

        self.delist_all(transaction_id);
        let result = if self.external {
            handle.set_rollback_only()
        } else {
            handle.rollback()
        };
        self.close_all(transaction_id);
        result
    }

    pub(crate) fn suspend(&self, transaction_id: &str) -> TxResult<()> {
        let manager = self.manager(transaction_id)?;
        if self.suspended.load(Ordering::Acquire) {
            return Err(TxError::new(
                &format!("Transaction {} is already suspended", transaction_id),
                ErrorKind::IllegalState,
            ));
        }

        let suspended = manager.suspend().map_err(|e| {
            e.wrap(&format!("Failed to suspend transaction {}", transaction_id), ErrorKind::SuspendFailed)
        })?;
        match suspended {
            Some(handle) => {
                self.handle.write_with(|slot| *slot = Some(handle));
                self.suspended.store(true, Ordering::Release);
                log::debug!("Suspended transaction {}", transaction_id);
                Ok(())
            }
            None => Err(TxError::new(
                &format!("Transaction manager has no transaction to suspend for {}", transaction_id),
                ErrorKind::IllegalState,
            )),
        }
    }

    pub(crate) fn resume(&self, transaction_id: &str) -> TxResult<()> {
        let manager = self.manager(transaction_id)?;
        if !self.suspended.load(Ordering::Acquire) {
            return Err(TxError::new(
                &format!("Transaction {} is not suspended", transaction_id),
                ErrorKind::IllegalState,
            ));
        }

        let handle = self.managed_transaction().ok_or_else(|| {
            TxError::new(
                &format!("Transaction {} has no manager transaction to resume", transaction_id),
                ErrorKind::IllegalState,
            )
        })?;
        manager.resume(handle).map_err(|e| {
            e.wrap(&format!("Failed to resume transaction {}", transaction_id), ErrorKind::ResumeFailed)
        })?;
        self.suspended.store(false, Ordering::Release);
        log::debug!("Resumed transaction {}", transaction_id);
        Ok(())
    }

    pub(crate) fn set_rollback_only(&self, transaction_id: &str) {
        if let Some(handle) = self.managed_transaction() {
            if let Err(e) = handle.set_rollback_only() {
                log::warn!("Failed to mark manager transaction of {} for rollback: {}", transaction_id, e);
            }
        }
    }

    pub(crate) fn is_marked_rollback(&self, transaction_id: &str) -> bool {
        match self.managed_transaction() {
            Some(handle) => match handle.status() {
                Ok(status) => status == TransactionStatus::MarkedRollback,
                Err(e) => {
                    log::warn!("Failed to query manager status of transaction {}: {}", transaction_id, e);
                    false
                }
            },
            None => false,
        }
    }

    pub(crate) fn status(&self, flags: &LifecycleFlags, rollback_only: bool) -> TxResult<TransactionStatus> {
        if let Some(status) = flags.terminal() {
            return Ok(status);
        }

        match self.managed_transaction() {
            Some(handle) => match handle.status() {
                Ok(TransactionStatus::Active) if rollback_only => Ok(TransactionStatus::MarkedRollback),
                Ok(status) => Ok(status),
                Err(e) => Err(TxError::new_with_cause(
                    "Failed to query the transaction manager for status",
                    ErrorKind::StatusQuery,
                    e,
                )),
            },
            // begun but the manager transaction is gone
            None if flags.is_started() => Ok(TransactionStatus::Unknown),
            None => Ok(TransactionStatus::NoTransaction),
        }
    }

    fn take_handle(&self, transaction_id: &str) -> TxResult<Arc<dyn ManagedTransaction>> {
        self.handle.write_with(|slot| slot.take()).ok_or_else(|| {
            TxError::new(
                &format!("Transaction {} has no manager transaction to commit", transaction_id),
                ErrorKind::IllegalState,
            )
        })
    }

    fn delist_all(&self, transaction_id: &str) {
        let resources: Vec<Resource> = self
            .resources
            .lock()
            .values()
            .map(|(_, resource)| resource.clone())
            .collect();

        for resource in resources {
            if let Resource::SelfEnlisting(r) = &resource {
                if let Err(e) = r.delist() {
                    log::warn!("Failed to delist {} from transaction {}: {}", r.name(), transaction_id, e);
                }
            }
        }
    }

    fn close_all(&self, transaction_id: &str) {
        let closable: Vec<(ResourceIdentity, Resource)> = self
            .resources
            .lock()
            .iter()
            .filter(|(_, (_, resource))| !resource.is_reusable())
            .map(|(identity, (_, resource))| (identity.clone(), resource.clone()))
            .collect();

        for (identity, resource) in closable {
            match resource.close() {
                Ok(()) => {
                    self.resources.lock().shift_remove(&identity);
                }
                Err(e) => log::error!("Failed to close {:?} of transaction {}: {}", resource, transaction_id, e),
            }
        }
    }
}
