use crate::errors::{ErrorKind, TxError, TxResult};
use crate::transaction::{Resource, ResourceConstraints, ResourceKey};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Resource-specific side of a local transaction, supplied by the adapter
/// that owns the resource (a database connection, a messaging session).
pub trait SingleResourceHooks: Send + Sync {
    /// Real begin. Most resources start their work lazily on binding.
    fn begin(&self, _transaction_id: &str) -> TxResult<()> {
        Ok(())
    }

    /// Called once the resource is bound, e.g. to leave auto-commit mode.
    fn resource_bound(&self, _key: &ResourceKey, _resource: &Resource) -> TxResult<()> {
        Ok(())
    }

    fn commit(&self, key: &ResourceKey, resource: &Resource) -> TxResult<()>;

    fn rollback(&self, key: &ResourceKey, resource: &Resource) -> TxResult<()>;
}

pub(crate) struct SingleResourceState {
    hooks: Arc<dyn SingleResourceHooks>,
    constraints: ResourceConstraints,
    binding: OnceLock<(ResourceKey, Resource)>,
    // the binding stays after a failed `resource_bound`, it can only be rolled back
    unprepared: AtomicBool,
}

impl SingleResourceState {
    pub(crate) fn new(hooks: Arc<dyn SingleResourceHooks>, constraints: ResourceConstraints) -> Self {
        SingleResourceState {
            hooks,
            constraints,
            binding: OnceLock::new(),
            unprepared: AtomicBool::new(false),
        }
    }

    pub(crate) fn begin(&self, transaction_id: &str) -> TxResult<()> {
        self.hooks.begin(transaction_id)
    }

    pub(crate) fn bind_resource(&self, transaction_id: &str, key: ResourceKey, resource: Resource) -> TxResult<()> {
        let key = key.normalize();
        if self.binding.set((key.clone(), resource.clone())).is_err() {
            return Err(TxError::new(
                &format!(
                    "Transaction {} already has a bound resource, a single-resource transaction binds exactly one",
                    transaction_id
                ),
                ErrorKind::AlreadyBoundResource,
            ));
        }

        log::debug!("Bound {:?} under {:?} to transaction {}", resource, key, transaction_id);
        self.hooks.resource_bound(&key, &resource).map_err(|e| {
            self.unprepared.store(true, Ordering::Release);
            TxError::new_with_cause(
                &format!("Failed to prepare resource bound to transaction {}", transaction_id),
                ErrorKind::ResourceError,
                e,
            )
        })
    }

    pub(crate) fn is_rollback_only(&self) -> bool {
        self.unprepared.load(Ordering::Acquire)
    }

    pub(crate) fn supports(&self, key: &ResourceKey, resource: &Resource) -> bool {
        match self.binding.get() {
            None => self.constraints.accepts(key, resource),
            Some((bound_key, bound_resource)) => bound_key == key && bound_resource.same_as(resource),
        }
    }

    pub(crate) fn resource(&self, key: &ResourceKey) -> Option<Resource> {
        self.binding
            .get()
            .filter(|(bound_key, _)| bound_key == key)
            .map(|(_, resource)| resource.clone())
    }

    pub(crate) fn commit(&self, transaction_id: &str) -> TxResult<()> {
        match self.binding.get() {
            Some((key, resource)) => self.hooks.commit(key, resource),
            None => {
                log::warn!("Committing transaction {} with no bound resource", transaction_id);
                Ok(())
            }
        }
    }

    pub(crate) fn rollback(&self, transaction_id: &str) -> TxResult<()> {
        match self.binding.get() {
            Some((key, resource)) => self.hooks.rollback(key, resource),
            None => {
                log::warn!("Rolling back transaction {} with no bound resource", transaction_id);
                Ok(())
            }
        }
    }
}
