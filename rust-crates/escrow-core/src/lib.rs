pub mod address;
pub mod amount;
pub mod chain;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod poller;
pub mod snapshot;
pub mod state;
pub mod wallet;
pub mod wizard;

pub use address::Address;
pub use amount::TokenAmount;
pub use config::EscrowConfig;
pub use error::{
    Error,
    ValidationError,
};
pub use snapshot::{
    ContractSnapshot,
    Milestone,
    SettlementProposal,
    ViewerRole,
};
pub use state::{
    Action,
    Assessment,
    ClosureReason,
    ContractState,
    Party,
    determine_state,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
