use crate::errors::{ErrorKind, TxError, TxResult};
use std::fmt::{Display, Formatter};

/// Status of a transaction as seen by callers and diagnostics.
///
/// Integer codes follow the numbering used by JTA-style transaction managers,
/// so they can be exchanged with external tooling unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionStatus {
    /// Begun and not yet resolved
    Active,
    /// Begun, but can only be rolled back
    MarkedRollback,
    /// Successfully committed
    Committed,
    /// Rolled back
    RolledBack,
    /// Status could not be determined
    Unknown,
    /// Not begun yet
    NoTransaction,
}

impl TransactionStatus {
    pub fn code(&self) -> i32 {
        match self {
            TransactionStatus::Active => 0,
            TransactionStatus::MarkedRollback => 1,
            TransactionStatus::Committed => 3,
            TransactionStatus::RolledBack => 4,
            TransactionStatus::Unknown => 5,
            TransactionStatus::NoTransaction => 6,
        }
    }

    pub fn from_code(code: i32) -> TxResult<Self> {
        match code {
            0 => Ok(TransactionStatus::Active),
            1 => Ok(TransactionStatus::MarkedRollback),
            3 => Ok(TransactionStatus::Committed),
            4 => Ok(TransactionStatus::RolledBack),
            5 => Ok(TransactionStatus::Unknown),
            6 => Ok(TransactionStatus::NoTransaction),
            _ => Err(TxError::new(
                &format!("Unknown transaction status code: {}", code),
                ErrorKind::StatusQuery,
            )),
        }
    }

    /// `true` for `Committed` and `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::MarkedRollback => "MARKED_ROLLBACK",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLEDBACK",
            TransactionStatus::Unknown => "UNKNOWN",
            TransactionStatus::NoTransaction => "NO_TRANSACTION",
        };
        write!(f, "{}", name)
    }
}
