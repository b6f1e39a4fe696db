use crate::{
    address::AddressError,
    amount::{
        AmountError,
        TokenAmount,
    },
    state::Action,
};

/// Failures surfaced by the dispatcher, wallet flow and reconciliation loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The signer declined. Callers show a neutral notice, not an error.
    #[error("request rejected in wallet")]
    UserRejected,
    #[error("wallet is on chain {actual}, expected chain {expected}")]
    NetworkMismatch { expected: u64, actual: u64 },
    #[error("contract read failed: {0}")]
    TransientReadFailure(String),
    #[error("{action} is not available in the current contract state")]
    StateViolation { action: Action },
    #[error("contract state has not been loaded yet")]
    NoState,
    #[error("{0}")]
    ChainRejection(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("insufficient token balance: have {have}, need {need}")]
    InsufficientBalance { have: TokenAmount, need: TokenAmount },
    #[error("a wallet connection is already in progress")]
    ConnectionInProgress,
    #[error("contract state poller is not running")]
    PollerStopped,
}

impl Error {
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, Error::UserRejected)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid payee address: {0}")]
    InvalidPayee(AddressError),
    #[error("invalid amount: {0}")]
    InvalidAmount(AmountError),
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
    #[error("duration must be a whole number of days between 1 and 365")]
    DurationOutOfRange,
    #[error("milestone percentages must sum to 100, got {sum}")]
    MilestoneSum { sum: u32 },
    #[error("between 1 and 10 milestones are required, got {count}")]
    MilestoneCount { count: usize },
    #[error("milestone percentage must be between 0 and 100")]
    PercentageOutOfRange,
    #[error("settlement amount must be greater than zero and at most {remaining}")]
    SettlementAmount { remaining: TokenAmount },
    #[error("{action} requires an amount")]
    MissingAmount { action: Action },
    #[error("poll_interval_ms must be greater than zero")]
    PollInterval,
    #[error("approval_window_secs must be between 1 and {max}")]
    ApprovalWindow { max: u64 },
}
