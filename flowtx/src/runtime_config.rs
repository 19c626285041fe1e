//! Configuration of a transaction runtime.

use crate::common::{DEFAULT_APPLICATION_NAME, DEFAULT_TRANSACTION_TIMEOUT_MS};
use crate::errors::{ErrorKind, TxError, TxResult};
use crate::transaction::TransactionManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Settings shared by every transaction of one runtime.
///
/// Settings can be changed until the runtime is built; afterwards every
/// setter fails with `ConfigurationError`.
///
/// ```rust,ignore
/// let config = RuntimeConfig::new();
/// config.set_application_name("orders")?;
/// config.set_default_transaction_timeout(10_000)?;
/// ```
#[derive(Clone)]
pub struct RuntimeConfig {
    inner: Arc<RuntimeConfigInner>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            inner: Arc::new(RuntimeConfigInner::new()),
        }
    }

    /// Name reported in lifecycle notifications.
    pub fn application_name(&self) -> String {
        self.inner.application_name()
    }

    /// Sets the application name. Can be set only once.
    ///
    /// # Errors
    ///
    /// Returns error if already initialized, if the name is blank or if a
    /// name was set before.
    pub fn set_application_name(&self, name: &str) -> TxResult<()> {
        self.inner.set_application_name(name)
    }

    /// Timeout in milliseconds given to transactions that configure none.
    pub fn default_transaction_timeout(&self) -> u64 {
        self.inner.default_transaction_timeout()
    }

    /// # Errors
    ///
    /// Returns error if already initialized or if the timeout is zero.
    pub fn set_default_transaction_timeout(&self, timeout_ms: u64) -> TxResult<()> {
        self.inner.set_default_transaction_timeout(timeout_ms)
    }

    /// The external transaction manager, if one is configured.
    pub fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        self.inner.transaction_manager()
    }

    /// # Errors
    ///
    /// Returns error if already initialized or if a manager was set before.
    pub fn set_transaction_manager(&self, manager: Arc<dyn TransactionManager>) -> TxResult<()> {
        self.inner.set_transaction_manager(manager)
    }

    pub fn is_configured(&self) -> bool {
        self.inner.configured.load(Ordering::Acquire)
    }

    pub(crate) fn initialize(&self) {
        self.inner.configured.store(true, Ordering::Release);
    }
}

struct RuntimeConfigInner {
    configured: AtomicBool,
    application_name: OnceLock<String>,
    default_transaction_timeout: AtomicU64,
    transaction_manager: OnceLock<Arc<dyn TransactionManager>>,
}

impl RuntimeConfigInner {
    fn new() -> Self {
        RuntimeConfigInner {
            configured: AtomicBool::from(false),
            application_name: OnceLock::new(),
            default_transaction_timeout: AtomicU64::from(DEFAULT_TRANSACTION_TIMEOUT_MS),
            transaction_manager: OnceLock::new(),
        }
    }

    fn check_not_configured(&self, setting: &str) -> TxResult<()> {
        if self.configured.load(Ordering::Acquire) {
            log::error!("{} cannot be changed after initialization", setting);
            return Err(TxError::new(
                &format!("{} cannot be changed after initialization", setting),
                ErrorKind::ConfigurationError,
            ));
        }
        Ok(())
    }

    fn application_name(&self) -> String {
        self.application_name
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string())
    }

    fn set_application_name(&self, name: &str) -> TxResult<()> {
        self.check_not_configured("Application name")?;

        let name = name.trim();
        if name.is_empty() {
            log::error!("Application name cannot be empty");
            return Err(TxError::new("Application name cannot be empty", ErrorKind::ConfigurationError));
        }

        self.application_name.set(name.to_string()).map_err(|_| {
            log::error!("Application name is already set");
            TxError::new("Application name is already set", ErrorKind::ConfigurationError)
        })
    }

    fn default_transaction_timeout(&self) -> u64 {
        self.default_transaction_timeout.load(Ordering::Acquire)
    }

    fn set_default_transaction_timeout(&self, timeout_ms: u64) -> TxResult<()> {
        self.check_not_configured("Default transaction timeout")?;

        if timeout_ms == 0 {
            log::error!("Default transaction timeout must be positive");
            return Err(TxError::new(
                "Default transaction timeout must be positive",
                ErrorKind::ConfigurationError,
            ));
        }

        self.default_transaction_timeout.store(timeout_ms, Ordering::Release);
        Ok(())
    }

    fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        self.transaction_manager.get().cloned()
    }

    fn set_transaction_manager(&self, manager: Arc<dyn TransactionManager>) -> TxResult<()> {
        self.check_not_configured("Transaction manager")?;

        self.transaction_manager.set(manager).map_err(|_| {
            log::error!("Transaction manager is already set");
            TxError::new("Transaction manager is already set", ErrorKind::ConfigurationError)
        })
    }
}
