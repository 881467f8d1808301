//! Errors - one enum for the engine, classified into four kinds.
//!
//! | Kind | Meaning | Who handles it |
//! |------|---------|----------------|
//! | Transient | RPC timeout, lock store down, write conflict | poller logs, next pass retries |
//! | ChainRejected | broadcast refused, not enough on-chain funds | entity moves to FAILED |
//! | Validation | bad input, limits, ledger balance | returned to the caller |
//! | Invariant | bad signature, double credit | abort, audit, alert |

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::keys::KeyError;

pub type CustodyResult<T> = Result<T, CustodyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    ChainRejected,
    Validation,
    Invariant,
}

#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    // Transient infrastructure
    #[error("chain rpc: {0}")]
    Rpc(String),
    #[error("lock store: {0}")]
    LockStore(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("concurrent update on {0}, retry")]
    Conflict(String),
    #[error("{0} is busy")]
    Busy(String),
    #[error("address pool exhausted: {0}")]
    CapacityExhausted(String),

    // Chain rejected
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
    #[error("insufficient on-chain balance on {address}: need {required}, have {available}")]
    InsufficientOnChain { address: String, required: Decimal, available: Decimal },
    #[error("transaction failed on chain: {0}")]
    TransactionFailed(String),

    // Validation
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("amount {amount} is below the minimum of {min}")]
    AmountBelowMinimum { amount: Decimal, min: Decimal },
    #[error("amount {amount} is above the maximum of {max}")]
    AmountAboveMaximum { amount: Decimal, max: Decimal },
    #[error("fee {fee} consumes the whole amount {amount}")]
    FeeExceedsAmount { amount: Decimal, fee: Decimal },
    #[error("daily withdrawal limit exceeded, remaining {remaining}")]
    DailyLimitExceeded { remaining: Decimal },
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Decimal, requested: Decimal },
    #[error("withdrawals are disabled until {until} after a security change")]
    WithdrawalsFrozen { until: DateTime<Utc> },
    #[error("invalid password")]
    InvalidPassword,
    #[error("sender and receiver are the same user")]
    SelfTransfer,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("config: {0}")]
    Config(String),

    // Invariant violations
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("signature failed self-verification for {0}")]
    SignatureMismatch(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl CustodyError {
    pub fn kind(&self) -> ErrorKind {
        use CustodyError::*;
        match self {
            Rpc(_) | LockStore(_) | Storage(_) | Conflict(_) | Busy(_) | CapacityExhausted(_) => ErrorKind::Transient,
            BroadcastRejected(_) | InsufficientOnChain { .. } | TransactionFailed(_) => ErrorKind::ChainRejected,
            InvalidAddress(_)
            | InvalidAmount(_)
            | AmountBelowMinimum { .. }
            | AmountAboveMaximum { .. }
            | FeeExceedsAmount { .. }
            | DailyLimitExceeded { .. }
            | InsufficientBalance { .. }
            | WithdrawalsFrozen { .. }
            | InvalidPassword
            | SelfTransfer
            | NotFound(_)
            | InvalidTransition(_)
            | Config(_) => ErrorKind::Validation,
            Invariant(_) | SignatureMismatch(_) => ErrorKind::Invariant,
            Key(KeyError::InvalidAddress(_) | KeyError::InvalidMnemonic(_) | KeyError::WrongPassphrase) => {
                ErrorKind::Validation
            }
            Key(_) => ErrorKind::Invariant,
        }
    }

    pub fn is_transient(&self) -> bool { self.kind() == ErrorKind::Transient }

    pub fn storage(e: impl std::fmt::Display) -> Self { Self::Storage(e.to_string()) }

    pub fn rpc(e: impl std::fmt::Display) -> Self { Self::Rpc(e.to_string()) }
}

impl From<serde_json::Error> for CustodyError {
    fn from(e: serde_json::Error) -> Self { Self::Storage(format!("json: {}", e)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(CustodyError::Rpc("timeout".into()).kind(), ErrorKind::Transient);
        assert_eq!(CustodyError::BroadcastRejected("BANDWITH_ERROR".into()).kind(), ErrorKind::ChainRejected);
        assert_eq!(
            CustodyError::InsufficientBalance { available: Decimal::ONE, requested: Decimal::TWO }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(CustodyError::SignatureMismatch("T...".into()).kind(), ErrorKind::Invariant);
        assert_eq!(CustodyError::Key(KeyError::InvalidAddress("x".into())).kind(), ErrorKind::Validation);
    }

    #[test]
    fn messages_carry_amounts() {
        let err = CustodyError::DailyLimitExceeded { remaining: Decimal::new(1250, 2) };
        assert_eq!(err.to_string(), "daily withdrawal limit exceeded, remaining 12.50");
    }
}
