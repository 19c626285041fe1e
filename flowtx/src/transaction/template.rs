use crate::errors::{ErrorKind, TxError, TxResult};
use crate::runtime::TxRuntime;
use crate::transaction::{Transaction, TransactionAction, TransactionConfig, TransactionFactory};
use std::sync::Arc;

/// What the template did to the transaction it found bound.
enum Displaced {
    Nothing,
    Suspended,
    Isolated,
}

/// Runs a callback under the demarcation rules of a [TransactionConfig].
///
/// ```rust,ignore
/// let template = TransactionTemplate::new(Some(config), runtime.clone())?;
/// let order_id = template.execute(|| store_order(&order))?;
/// ```
pub struct TransactionTemplate {
    config: Option<TransactionConfig>,
    runtime: TxRuntime,
}

impl TransactionTemplate {
    /// Fails with `ConfigurationError` if the config cannot run.
    pub fn new(config: Option<TransactionConfig>, runtime: TxRuntime) -> TxResult<Self> {
        if let Some(config) = &config {
            config.validate()?;
        }
        Ok(TransactionTemplate { config, runtime })
    }

    pub fn config(&self) -> Option<&TransactionConfig> {
        self.config.as_ref()
    }

    pub fn execute<T>(&self, callback: impl FnOnce() -> TxResult<T>) -> TxResult<T> {
        let config = match &self.config {
            Some(config) => config,
            None => return callback(),
        };

        let registry = self.runtime.registry();
        let joined = if registry.current().is_none() && config.interact_with_external() {
            match config.factory() {
                Some(factory) => factory.join_external_transaction(&self.runtime)?,
                None => None,
            }
        } else {
            None
        };

        let result = self.demarcate(config, callback);

        if let Some(joined) = joined {
            if let Err(e) = registry.unbind(&joined) {
                log::warn!("Failed to unbind joined external transaction {}: {}", joined.id(), e);
            }
        }
        result
    }

    fn demarcate<T>(&self, config: &TransactionConfig, callback: impl FnOnce() -> TxResult<T>) -> TxResult<T> {
        let registry = self.runtime.registry();
        let action = config.action();
        let bound = registry.current();

        match (action, &bound) {
            (TransactionAction::Never, Some(tx)) => {
                log::error!("Transaction {} is bound but the step is configured as {}", tx.id(), action);
                return Err(TxError::new(
                    &format!("A transaction is bound but the step is configured as {}", action),
                    ErrorKind::ConfigurationError,
                ));
            }
            (TransactionAction::AlwaysJoin, None) => {
                return Err(TxError::new(
                    &format!("No transaction is bound but the step is configured as {}", action),
                    ErrorKind::IllegalState,
                ));
            }
            _ => {}
        }

        let displaced = match &bound {
            Some(tx) => self.displace(action, tx)?,
            None => Displaced::Nothing,
        };

        let result = self.run(config, action, callback);

        match displaced {
            Displaced::Nothing => result,
            Displaced::Suspended => {
                registry.resume_if_suspended();
                result
            }
            Displaced::Isolated => match (result, registry.restore_isolated()) {
                (Ok(value), Ok(_)) => Ok(value),
                (Ok(_), Err(e)) => Err(e),
                (Err(e), Ok(_)) => Err(e),
                (Err(e), Err(restore_error)) => {
                    log::error!("Failed to restore isolated transaction: {}", restore_error);
                    Err(e)
                }
            },
        }
    }

    fn displace(&self, action: TransactionAction, bound: &Transaction) -> TxResult<Displaced> {
        let registry = self.runtime.registry();
        match action {
            TransactionAction::None | TransactionAction::AlwaysBegin if bound.is_xa() => {
                registry.suspend()?;
                Ok(Displaced::Suspended)
            }
            TransactionAction::None | TransactionAction::AlwaysBegin => {
                log::debug!("Resolving transaction {} before running step as {}", bound.id(), action);
                bound.resolve()?;
                Ok(Displaced::Nothing)
            }
            TransactionAction::NotSupported if bound.is_xa() => {
                registry.suspend()?;
                Ok(Displaced::Suspended)
            }
            TransactionAction::NotSupported => {
                registry.isolate();
                Ok(Displaced::Isolated)
            }
            _ => Ok(Displaced::Nothing),
        }
    }

    fn run<T>(
        &self,
        config: &TransactionConfig,
        action: TransactionAction,
        callback: impl FnOnce() -> TxResult<T>,
    ) -> TxResult<T> {
        let registry = self.runtime.registry();
        let began = match action {
            TransactionAction::AlwaysBegin => Some(self.begin(config)?),
            TransactionAction::BeginOrJoin if registry.current().is_none() => Some(self.begin(config)?),
            _ => None,
        };

        match callback() {
            Ok(value) => {
                if let Some(tx) = &began {
                    if registry.current().as_ref() == Some(tx) {
                        if let Err(e) = tx.resolve() {
                            Self::roll_back_unresolved(tx);
                            return Err(e);
                        }
                    }
                }
                Ok(value)
            }
            Err(e) => {
                if let Some(tx) = &began {
                    Self::roll_back_unresolved(tx);
                }
                Err(e)
            }
        }
    }

    // a failed commit leaves the transaction unresolved for us to roll back
    fn roll_back_unresolved(tx: &Transaction) {
        if tx.is_unresolved() {
            if let Err(rollback_error) = tx.rollback() {
                log::error!("Failed to roll back transaction {}: {}", tx.id(), rollback_error);
            }
        }
    }

    fn begin(&self, config: &TransactionConfig) -> TxResult<Transaction> {
        let factory: &Arc<dyn TransactionFactory> = config.factory().ok_or_else(|| {
            TxError::new(
                &format!("Transaction action {} requires a transaction factory", config.action()),
                ErrorKind::ConfigurationError,
            )
        })?;
        factory.begin_transaction(&self.runtime, config.timeout(&self.runtime))
    }
}
