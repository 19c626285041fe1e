use crate::common::SubscriberRef;
use crate::errors::TxResult;
use crate::runtime_builder::TxRuntimeBuilder;
use crate::runtime_config::RuntimeConfig;
use crate::transaction::{
    TransactionEventBus, TransactionEventListener, TransactionManager, TransactionNotifier,
    TransactionRegistry,
};
use std::sync::Arc;

/// The transaction runtime of one process.
///
/// Owns the registry that binds transactions to workers, the lifecycle
/// notification bus and the runtime-wide settings. Build one at startup and
/// hand clones to every step runner; clones share all state.
///
/// ```rust,ignore
/// let runtime = TxRuntime::builder()
///     .application_name("orders")
///     .default_transaction_timeout(10_000)
///     .transaction_manager(manager)
///     .build()?;
///
/// let tx = Transaction::distributed(&runtime);
/// tx.begin()?;
/// ```
#[derive(Clone)]
pub struct TxRuntime {
    inner: Arc<TxRuntimeInner>,
}

struct TxRuntimeInner {
    config: RuntimeConfig,
    registry: TransactionRegistry,
    event_bus: TransactionEventBus,
    notifier: TransactionNotifier,
}

impl TxRuntime {
    pub fn builder() -> TxRuntimeBuilder {
        TxRuntimeBuilder::new()
    }

    pub(crate) fn new(config: RuntimeConfig) -> Self {
        config.initialize();
        let event_bus = TransactionEventBus::new();
        let notifier = TransactionNotifier::new(&config.application_name(), event_bus.clone());
        log::debug!(
            "Transaction runtime '{}' started, default timeout {} ms",
            config.application_name(),
            config.default_transaction_timeout()
        );
        TxRuntime {
            inner: Arc::new(TxRuntimeInner {
                config,
                registry: TransactionRegistry::new(),
                event_bus,
                notifier,
            }),
        }
    }

    pub fn config(&self) -> RuntimeConfig {
        self.inner.config.clone()
    }

    pub fn application_name(&self) -> String {
        self.inner.config.application_name()
    }

    /// Default transaction timeout in milliseconds.
    pub fn default_transaction_timeout(&self) -> u64 {
        self.inner.config.default_transaction_timeout()
    }

    pub fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        self.inner.config.transaction_manager()
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.inner.registry
    }

    pub fn notifier(&self) -> TransactionNotifier {
        self.inner.notifier.clone()
    }

    /// Registers a listener for transaction lifecycle notifications.
    pub fn subscribe(&self, listener: TransactionEventListener) -> TxResult<Option<SubscriberRef>> {
        self.inner.event_bus.register(listener)
    }

    pub fn unsubscribe(&self, subscriber: SubscriberRef) -> TxResult<()> {
        self.inner.event_bus.deregister(subscriber)
    }

    /// Drops all listeners. Transactions still in flight keep working but
    /// nobody is notified anymore.
    pub fn close(&self) -> TxResult<()> {
        if self.inner.registry.transaction_count() > 0 {
            log::warn!(
                "Closing runtime '{}' with {} bound transactions",
                self.application_name(),
                self.inner.registry.transaction_count()
            );
        }
        self.inner.event_bus.close()
    }
}
