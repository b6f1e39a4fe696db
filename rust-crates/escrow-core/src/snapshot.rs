use crate::{
    address::Address,
    amount::TokenAmount,
    error::ValidationError,
};
use chrono::{
    DateTime,
    Utc,
};
use itertools::Itertools;
use serde::{
    Deserialize,
    Serialize,
};

pub const MAX_MILESTONES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub percentage: u8,
    pub released: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementProposal {
    pub amount: TokenAmount,
    pub proposed_at: DateTime<Utc>,
}

/// Point-in-time read of every escrow field the state engine looks at.
///
/// A cancel approval is `Some(approved_at)` once that party has approved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSnapshot {
    pub payer: Address,
    pub payee: Address,
    pub amount: TokenAmount,
    pub remaining_amount: TokenAmount,
    pub deposited: bool,
    pub platform_fee_paid: bool,
    pub confirmed_payer: bool,
    pub confirmed_payee: bool,
    pub deadline: DateTime<Utc>,
    pub milestones: Vec<Milestone>,
    pub cancel_payer_approved_at: Option<DateTime<Utc>>,
    pub cancel_payee_approved_at: Option<DateTime<Utc>>,
    pub settlement: Option<SettlementProposal>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewerRole {
    Payer,
    Payee,
    Observer,
}

impl ContractSnapshot {
    /// A viewer holding both addresses is the payer.
    pub fn role_of(&self, viewer: &Address) -> ViewerRole {
        if *viewer == self.payer {
            ViewerRole::Payer
        } else if *viewer == self.payee {
            ViewerRole::Payee
        } else {
            ViewerRole::Observer
        }
    }

    pub fn pending_milestones(&self) -> Vec<usize> {
        self.milestones
            .iter()
            .positions(|milestone| !milestone.released)
            .collect()
    }

    pub fn first_milestone_released(&self) -> bool {
        self.milestones
            .first()
            .map(|milestone| milestone.released)
            .unwrap_or(false)
    }

    pub fn all_milestones_released(&self) -> bool {
        !self.milestones.is_empty() && self.milestones.iter().all(|m| m.released)
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_percentages(self.milestones.iter().map(|m| m.percentage))
    }
}

pub(crate) fn validate_percentages(
    percentages: impl ExactSizeIterator<Item = u8>,
) -> Result<(), ValidationError> {
    let count = percentages.len();
    if count == 0 || count > MAX_MILESTONES {
        return Err(ValidationError::MilestoneCount { count });
    }
    let sum: u32 = percentages.map(u32::from).sum();
    if sum != 100 {
        return Err(ValidationError::MilestoneSum { sum });
    }
    Ok(())
}
