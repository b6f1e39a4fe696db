use crate::{
    address::Address,
    amount::TokenAmount,
    error::ValidationError,
};
use chrono::TimeDelta;
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

pub const USDC_POLYGON: Address = Address::new([
    0x3c, 0x49, 0x9c, 0x54, 0x2c, 0xef, 0x5e, 0x38, 0x11, 0xe1, 0x19, 0x2c, 0xe7, 0x0d,
    0x8c, 0xc0, 0x3d, 0x5c, 0x33, 0x59,
]);
pub const PLATFORM_FEE_RECIPIENT: Address = Address::new([
    0xc1, 0x01, 0xe7, 0x6d, 0xa5, 0x5b, 0xc9, 0x34, 0x38, 0xa9, 0x55, 0x54, 0x6e, 0x93,
    0xd5, 0x63, 0x12, 0xa3, 0xcf, 0x16,
]);
pub const POLYGON_CHAIN_ID: u64 = 137;
pub const PLATFORM_FEE: TokenAmount = TokenAmount::whole_tokens(1);
pub const APPROVAL_WINDOW_SECS: u64 = 3600;
pub const MAX_APPROVAL_WINDOW_SECS: u64 = 30 * 86_400;

/// Constants consumed by the escrow core. Every field has a default so a
/// config file only needs to name what it overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    pub token_address: Address,
    pub fee_recipient: Address,
    pub platform_fee: TokenAmount,
    pub target_chain_id: u64,
    pub approval_window_secs: u64,
    pub poll_interval_ms: u64,
    pub failure_threshold: u32,
    pub confirmations: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            token_address: USDC_POLYGON,
            fee_recipient: PLATFORM_FEE_RECIPIENT,
            platform_fee: PLATFORM_FEE,
            target_chain_id: POLYGON_CHAIN_ID,
            approval_window_secs: APPROVAL_WINDOW_SECS,
            poll_interval_ms: 10_000,
            failure_threshold: 3,
            confirmations: 1,
        }
    }
}

impl EscrowConfig {
    /// Rejects values the poll loop or the window arithmetic cannot run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::PollInterval);
        }
        if !(1..=MAX_APPROVAL_WINDOW_SECS).contains(&self.approval_window_secs) {
            return Err(ValidationError::ApprovalWindow {
                max: MAX_APPROVAL_WINDOW_SECS,
            });
        }
        Ok(())
    }

    /// Clamped to [`MAX_APPROVAL_WINDOW_SECS`] for configs that skipped
    /// [`EscrowConfig::validate`].
    pub fn approval_window(&self) -> TimeDelta {
        let secs = self.approval_window_secs.min(MAX_APPROVAL_WINDOW_SECS);
        TimeDelta::try_seconds(secs as i64).unwrap_or(TimeDelta::hours(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
