use crate::errors::{TxError, TxResult};
use crate::runtime::TxRuntime;
use crate::runtime_config::RuntimeConfig;
use crate::transaction::TransactionManager;
use std::sync::Arc;

/// Fluent builder for a [TxRuntime].
///
/// The first invalid setting is captured and reported by [TxRuntimeBuilder::build];
/// later settings are ignored once an error is captured.
///
/// ```rust,ignore
/// let runtime = TxRuntime::builder()
///     .application_name("orders")
///     .default_transaction_timeout(10_000)
///     .build()?;
/// ```
#[derive(Default)]
pub struct TxRuntimeBuilder {
    error: Option<TxError>,
    config: RuntimeConfig,
}

impl TxRuntimeBuilder {
    pub fn new() -> Self {
        TxRuntimeBuilder {
            error: None,
            config: RuntimeConfig::new(),
        }
    }

    pub fn application_name(mut self, name: &str) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_application_name(name) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Default transaction timeout in milliseconds. Must be positive.
    pub fn default_transaction_timeout(mut self, timeout_ms: u64) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_default_transaction_timeout(timeout_ms) {
                self.error = Some(e);
            }
        }
        self
    }

    /// The external manager coordinating distributed transactions.
    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_transaction_manager(manager) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Freezes the configuration and starts the runtime.
    pub fn build(self) -> TxResult<TxRuntime> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(TxRuntime::new(self.config))
    }
}
