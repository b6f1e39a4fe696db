//! Seams to the wallet and the escrow contract. Signing, RPC transport and
//! provider discovery live behind these traits.

use crate::{
    address::Address,
    amount::TokenAmount,
    error::Error,
    snapshot::ContractSnapshot,
    wallet::WalletSession,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// EIP-1193 "user rejected request".
pub const USER_REJECTED_CODE: i64 = 4001;
/// EIP-3085/3326 "unrecognized chain id".
pub const UNKNOWN_CHAIN_CODE: i64 = 4902;
const ACTION_REJECTED: &str = "ACTION_REJECTED";

/// Failure reported by a collaborator, shaped like a provider error
/// `{code, message}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ChainError {
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
}

impl ChainError {
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_rejected() -> Self {
        Self::new(Some(USER_REJECTED_CODE), "User rejected the request.")
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code == Some(USER_REJECTED_CODE) || self.message.contains(ACTION_REJECTED)
    }
}

impl From<ChainError> for Error {
    fn from(err: ChainError) -> Self {
        if err.is_user_rejection() {
            Error::UserRejected
        } else {
            Error::ChainRejection(err.message)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    #[serde(default)]
    pub revert_reason: Option<String>,
    /// Set for contract-creation transactions.
    #[serde(default)]
    pub contract_address: Option<Address>,
}

/// A state-changing call on the escrow contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ContractCall {
    PayPlatformFee,
    ConfirmPayer,
    ConfirmPayee,
    Deposit { amount: TokenAmount },
    ReleaseMilestone { index: usize },
    Refund,
    ProposeSettlement { amount: TokenAmount },
    ApproveSettlement,
    ApproveCancel,
    ClaimAfterDeadline,
}

impl ContractCall {
    pub fn method(&self) -> &'static str {
        match self {
            ContractCall::PayPlatformFee => "payPlatformFee",
            ContractCall::ConfirmPayer => "confirmPayer",
            ContractCall::ConfirmPayee => "confirmPayee",
            ContractCall::Deposit { .. } => "deposit",
            ContractCall::ReleaseMilestone { .. } => "releaseMilestone",
            ContractCall::Refund => "refund",
            ContractCall::ProposeSettlement { .. } => "proposeSettlement",
            ContractCall::ApproveSettlement => "approveSettlement",
            ContractCall::ApproveCancel => "approveCancel",
            ContractCall::ClaimAfterDeadline => "claimAfterDeadline",
        }
    }
}

/// Constructor arguments for a new escrow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub payer: Address,
    pub payee: Address,
    pub token: Address,
    pub amount: TokenAmount,
    pub duration_secs: u64,
    pub milestone_percentages: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub tx_hash: TxHash,
    pub contract_address: Address,
}

pub trait ContractReader {
    fn contract_details(
        &self,
        contract: &Address,
    ) -> impl Future<Output = Result<ContractSnapshot, ChainError>> + Send;
}

pub trait EscrowGateway: ContractReader {
    fn submit(
        &self,
        contract: &Address,
        from: &Address,
        call: &ContractCall,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    /// Resolves once the transaction has `confirmations` confirmations.
    fn wait_for_receipt(
        &self,
        tx_hash: &TxHash,
        confirmations: u64,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send;

    fn deploy(
        &self,
        request: &DeployRequest,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    fn token_balance(
        &self,
        token: &Address,
        owner: &Address,
    ) -> impl Future<Output = Result<TokenAmount, ChainError>> + Send;

    fn token_allowance(
        &self,
        token: &Address,
        owner: &Address,
        spender: &Address,
    ) -> impl Future<Output = Result<TokenAmount, ChainError>> + Send;

    fn approve_token(
        &self,
        token: &Address,
        owner: &Address,
        spender: &Address,
        amount: TokenAmount,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;
}

pub trait WalletProvider {
    fn connect(&self) -> impl Future<Output = Result<WalletSession, ChainError>> + Send;

    fn chain_id(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// `Ok(false)` when the provider declined without raising an error.
    fn switch_network(
        &self,
        chain_id: u64,
    ) -> impl Future<Output = Result<bool, ChainError>> + Send;
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn into_error__rejection_code_or_marker__user_rejected() {
        let coded: Error = ChainError::user_rejected().into();
        let marked: Error =
            ChainError::new(None, "ethers: ACTION_REJECTED (user denied)").into();

        assert!(coded.is_user_rejection());
        assert!(marked.is_user_rejection());
    }

    #[test]
    fn into_error__revert__keeps_reason_verbatim() {
        // given
        let err = ChainError::new(Some(-32000), "execution reverted: Not payer");

        // when
        let converted: Error = err.into();

        // then
        match converted {
            Error::ChainRejection(reason) => {
                assert_eq!(reason, "execution reverted: Not payer")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn contract_call__serializes_with_method_tag() {
        let call = ContractCall::ReleaseMilestone { index: 2 };

        let json = serde_json::to_value(call).unwrap();

        assert_eq!(json["method"], "releaseMilestone");
        assert_eq!(json["index"], 2);
        assert_eq!(call.method(), "releaseMilestone");
    }
}
