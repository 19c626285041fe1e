use crate::errors::{ErrorKind, TxError, TxResult};
use crate::runtime::TxRuntime;
use crate::transaction::TransactionFactory;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a step relates to the transaction bound to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionAction {
    /// Run without a transaction, resolving or suspending one that is bound.
    #[default]
    None,
    /// Always start a new transaction.
    AlwaysBegin,
    /// Join the bound transaction or start one.
    BeginOrJoin,
    /// Require a bound transaction.
    AlwaysJoin,
    /// Join the bound transaction if there is one.
    JoinIfPossible,
    /// Refuse to run while a transaction is bound.
    Never,
    /// Run in whatever is bound, transactional or not.
    Indifferent,
    /// Hide the bound transaction while the step runs.
    NotSupported,
}

impl TransactionAction {
    pub const ALL: [TransactionAction; 8] = [
        TransactionAction::None,
        TransactionAction::AlwaysBegin,
        TransactionAction::BeginOrJoin,
        TransactionAction::AlwaysJoin,
        TransactionAction::JoinIfPossible,
        TransactionAction::Never,
        TransactionAction::Indifferent,
        TransactionAction::NotSupported,
    ];

    pub fn code(&self) -> u8 {
        match self {
            TransactionAction::None => 0,
            TransactionAction::AlwaysBegin => 1,
            TransactionAction::BeginOrJoin => 2,
            TransactionAction::AlwaysJoin => 3,
            TransactionAction::JoinIfPossible => 4,
            TransactionAction::Never => 5,
            TransactionAction::Indifferent => 6,
            TransactionAction::NotSupported => 7,
        }
    }

    pub fn from_code(code: u8) -> TxResult<Self> {
        Self::ALL.get(code as usize).copied().ok_or_else(|| {
            TxError::new(
                &format!("Unknown transaction action code: {}", code),
                ErrorKind::ConfigurationError,
            )
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionAction::None => "NONE",
            TransactionAction::AlwaysBegin => "ALWAYS_BEGIN",
            TransactionAction::BeginOrJoin => "BEGIN_OR_JOIN",
            TransactionAction::AlwaysJoin => "ALWAYS_JOIN",
            TransactionAction::JoinIfPossible => "JOIN_IF_POSSIBLE",
            TransactionAction::Never => "NEVER",
            TransactionAction::Indifferent => "INDIFFERENT",
            TransactionAction::NotSupported => "NOT_SUPPORTED",
        }
    }

    /// Actions that cannot run without a factory.
    pub fn requires_factory(&self) -> bool {
        matches!(
            self,
            TransactionAction::AlwaysBegin | TransactionAction::AlwaysJoin | TransactionAction::BeginOrJoin
        )
    }
}

impl Display for TransactionAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionAction {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .find(|action| action.as_str() == name)
            .copied()
            .ok_or_else(|| {
                TxError::new(
                    &format!("Unknown transaction action: '{}'", s),
                    ErrorKind::ConfigurationError,
                )
            })
    }
}

// 0 marks a timeout that has not been resolved yet
const TIMEOUT_UNSET: u64 = 0;

/// Demarcation settings attached to one step.
///
/// Immutable once built, except that an unset timeout is filled in from the
/// runtime default the first time it is read.
///
/// ```rust,ignore
/// let config = TransactionConfig::new(TransactionAction::BeginOrJoin)
///     .with_factory(Arc::new(DistributedTransactionFactory::new()))
///     .with_timeout(10_000);
/// config.validate()?;
/// ```
#[derive(Clone)]
pub struct TransactionConfig {
    action: TransactionAction,
    factory: Option<Arc<dyn TransactionFactory>>,
    timeout_ms: Arc<AtomicU64>,
    interact_with_external: bool,
}

impl TransactionConfig {
    pub fn new(action: TransactionAction) -> Self {
        TransactionConfig {
            action,
            factory: None,
            timeout_ms: Arc::new(AtomicU64::new(TIMEOUT_UNSET)),
            interact_with_external: false,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets the timeout in milliseconds. Zero leaves it to the runtime default.
    pub fn with_timeout(self, timeout_ms: u64) -> Self {
        self.timeout_ms.store(timeout_ms, Ordering::Release);
        self
    }

    /// Allows joining a transaction started outside the runtime.
    pub fn with_interact_with_external(mut self, interact: bool) -> Self {
        self.interact_with_external = interact;
        self
    }

    pub fn action(&self) -> TransactionAction {
        self.action
    }

    pub fn factory(&self) -> Option<&Arc<dyn TransactionFactory>> {
        self.factory.as_ref()
    }

    pub fn interact_with_external(&self) -> bool {
        self.interact_with_external
    }

    /// The configured timeout, defaulted once from `runtime`.
    pub fn timeout(&self, runtime: &TxRuntime) -> u64 {
        let current = self.timeout_ms.load(Ordering::Acquire);
        if current != TIMEOUT_UNSET {
            return current;
        }

        let default = runtime.default_transaction_timeout();
        match self.timeout_ms.compare_exchange(
            TIMEOUT_UNSET,
            default,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => default,
            Err(resolved) => resolved,
        }
    }

    /// Whether the action can ever run inside a transaction.
    pub fn is_transacted(&self) -> bool {
        !matches!(
            self.action,
            TransactionAction::None | TransactionAction::Never | TransactionAction::NotSupported
        )
    }

    /// Checks the wiring: actions that begin or join need a factory.
    pub fn validate(&self) -> TxResult<()> {
        if self.action.requires_factory() && self.factory.is_none() {
            log::error!("Transaction action {} requires a transaction factory", self.action);
            return Err(TxError::new(
                &format!("Transaction action {} requires a transaction factory", self.action),
                ErrorKind::ConfigurationError,
            ));
        }
        Ok(())
    }

    /// Whether a transaction will be active once this action is applied.
    ///
    /// Depends on live registry state for `JOIN_IF_POSSIBLE` and
    /// `INDIFFERENT`, so evaluate it per invocation.
    pub fn resolves_to_active_transaction(&self, registry_has_current: bool) -> TxResult<bool> {
        match self.action {
            TransactionAction::None | TransactionAction::Never | TransactionAction::NotSupported => Ok(false),
            TransactionAction::AlwaysBegin | TransactionAction::AlwaysJoin | TransactionAction::BeginOrJoin => {
                self.validate()?;
                Ok(true)
            }
            TransactionAction::JoinIfPossible | TransactionAction::Indifferent => Ok(registry_has_current),
        }
    }
}

impl Debug for TransactionConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionConfig")
            .field("action", &self.action)
            .field("has_factory", &self.factory.is_some())
            .field("timeout_ms", &self.timeout_ms.load(Ordering::Acquire))
            .field("interact_with_external", &self.interact_with_external)
            .finish()
    }
}
