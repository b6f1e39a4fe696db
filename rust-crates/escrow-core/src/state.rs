//! Derives the escrow's semantic state and the viewer's legal actions from a
//! raw contract snapshot. Everything here is pure: the same snapshot, viewer,
//! clock reading and window always produce the same [`Assessment`].

use crate::{
    address::Address,
    amount::TokenAmount,
    snapshot::{
        ContractSnapshot,
        ViewerRole,
    },
};
use chrono::{
    DateTime,
    TimeDelta,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    Payer,
    Payee,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosureReason {
    MilestonesCompleted,
    Cancelled,
    /// Refund, post-deadline claim or accepted settlement emptied the escrow.
    FundsDisbursed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractState {
    AwaitingFeePayment,
    AwaitingConfirmation(Party),
    AwaitingDeposit,
    Active,
    CancelPending {
        approved_by: Party,
        expires_at: DateTime<Utc>,
    },
    SettlementPending {
        amount: TokenAmount,
        expires_at: DateTime<Utc>,
    },
    Closed(ClosureReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    PayPlatformFee,
    ConfirmPayer,
    ConfirmPayee,
    Deposit,
    ReleaseMilestone(usize),
    Refund,
    ProposeSettlement,
    ApproveSettlement,
    ApproveCancel,
    ClaimAfterDeadline,
    CheckStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub state: ContractState,
    pub legal_actions: Vec<Action>,
}

impl Action {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Action::CheckStatus)
    }

    pub fn takes_amount(&self) -> bool {
        matches!(self, Action::Deposit | Action::ProposeSettlement)
    }
}

impl Assessment {
    fn new(state: ContractState, legal_actions: Vec<Action>) -> Self {
        Self {
            state,
            legal_actions,
        }
    }

    pub fn allows(&self, action: &Action) -> bool {
        self.legal_actions.contains(action)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ContractState::Closed(_))
    }
}

/// Evaluates the ordered rule set; the first matching rule decides.
pub fn determine_state(
    snapshot: &ContractSnapshot,
    viewer: &Address,
    now: DateTime<Utc>,
    window: TimeDelta,
) -> Assessment {
    use Action::*;

    let role = snapshot.role_of(viewer);

    if !snapshot.platform_fee_paid {
        let actions = match role {
            ViewerRole::Payer | ViewerRole::Payee => vec![PayPlatformFee],
            ViewerRole::Observer => vec![CheckStatus],
        };
        return Assessment::new(ContractState::AwaitingFeePayment, actions);
    }

    match (snapshot.confirmed_payer, snapshot.confirmed_payee, role) {
        (false, _, ViewerRole::Payer) => {
            return Assessment::new(
                ContractState::AwaitingConfirmation(Party::Payer),
                vec![ConfirmPayer],
            );
        }
        (_, false, ViewerRole::Payee) => {
            return Assessment::new(
                ContractState::AwaitingConfirmation(Party::Payee),
                vec![ConfirmPayee],
            );
        }
        (false, _, _) => {
            return Assessment::new(
                ContractState::AwaitingConfirmation(Party::Payer),
                vec![CheckStatus],
            );
        }
        (true, false, _) => {
            return Assessment::new(
                ContractState::AwaitingConfirmation(Party::Payee),
                vec![CheckStatus],
            );
        }
        (true, true, _) => {}
    }

    if !snapshot.deposited {
        let actions = match role {
            ViewerRole::Payer => vec![Deposit],
            ViewerRole::Payee | ViewerRole::Observer => vec![CheckStatus],
        };
        return Assessment::new(ContractState::AwaitingDeposit, actions);
    }

    if let Some(reason) = closure_reason(snapshot, window) {
        return Assessment::new(ContractState::Closed(reason), Vec::new());
    }

    let legal_actions = match role {
        ViewerRole::Payer => {
            let mut actions: Vec<Action> = snapshot
                .pending_milestones()
                .into_iter()
                .map(ReleaseMilestone)
                .collect();
            if !snapshot.first_milestone_released() {
                actions.push(Refund);
            }
            actions.push(ProposeSettlement);
            actions.push(ApproveCancel);
            if snapshot.deadline_passed(now) {
                actions.push(ClaimAfterDeadline);
            }
            actions
        }
        ViewerRole::Payee => vec![ApproveCancel, ApproveSettlement],
        ViewerRole::Observer => vec![CheckStatus],
    };

    Assessment::new(pending_state(snapshot, now, window), legal_actions)
}

fn closure_reason(snapshot: &ContractSnapshot, window: TimeDelta) -> Option<ClosureReason> {
    if snapshot.all_milestones_released() {
        return Some(ClosureReason::MilestonesCompleted);
    }
    if let (Some(payer_at), Some(payee_at)) = (
        snapshot.cancel_payer_approved_at,
        snapshot.cancel_payee_approved_at,
    ) {
        let (first, second) = if payer_at <= payee_at {
            (payer_at, payee_at)
        } else {
            (payee_at, payer_at)
        };
        if first.checked_add_signed(window).is_some_and(|expiry| second < expiry) {
            return Some(ClosureReason::Cancelled);
        }
    }
    if snapshot.remaining_amount.is_zero() {
        return Some(ClosureReason::FundsDisbursed);
    }
    None
}

fn pending_state(
    snapshot: &ContractSnapshot,
    now: DateTime<Utc>,
    window: TimeDelta,
) -> ContractState {
    // An approval stamped exactly one window ago has expired.
    let live_until =
        |at: DateTime<Utc>| at.checked_add_signed(window).filter(|expiry| now < *expiry);

    if let Some(proposal) = snapshot.settlement
        && let Some(expires_at) = live_until(proposal.proposed_at)
    {
        return ContractState::SettlementPending {
            amount: proposal.amount,
            expires_at,
        };
    }

    let payer = snapshot
        .cancel_payer_approved_at
        .and_then(live_until)
        .map(|expires_at| (Party::Payer, expires_at));
    let payee = snapshot
        .cancel_payee_approved_at
        .and_then(live_until)
        .map(|expires_at| (Party::Payee, expires_at));

    match (payer, payee) {
        (Some((approved_by, expires_at)), None) | (None, Some((approved_by, expires_at))) => {
            ContractState::CancelPending {
                approved_by,
                expires_at,
            }
        }
        _ => ContractState::Active,
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Payer => write!(f, "payer"),
            Party::Payee => write!(f, "payee"),
        }
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractState::AwaitingFeePayment => write!(f, "Awaiting platform fee"),
            ContractState::AwaitingConfirmation(party) => {
                write!(f, "Awaiting {party} confirmation")
            }
            ContractState::AwaitingDeposit => write!(f, "Awaiting deposit"),
            ContractState::Active => write!(f, "Active"),
            ContractState::CancelPending {
                approved_by,
                expires_at,
            } => write!(
                f,
                "Cancel approved by {approved_by}, open until {}",
                expires_at.format("%Y-%m-%d %H:%M UTC")
            ),
            ContractState::SettlementPending { amount, expires_at } => write!(
                f,
                "Settlement of {amount} USDC proposed, open until {}",
                expires_at.format("%Y-%m-%d %H:%M UTC")
            ),
            ContractState::Closed(ClosureReason::MilestonesCompleted) => {
                write!(f, "Closed: all milestones released")
            }
            ContractState::Closed(ClosureReason::Cancelled) => {
                write!(f, "Closed: cancelled, funds refunded")
            }
            ContractState::Closed(ClosureReason::FundsDisbursed) => {
                write!(f, "Closed: funds disbursed")
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::PayPlatformFee => write!(f, "Pay platform fee"),
            Action::ConfirmPayer => write!(f, "Confirm as payer"),
            Action::ConfirmPayee => write!(f, "Confirm as payee"),
            Action::Deposit => write!(f, "Deposit"),
            Action::ReleaseMilestone(index) => write!(f, "Release milestone {}", index + 1),
            Action::Refund => write!(f, "Refund"),
            Action::ProposeSettlement => write!(f, "Propose settlement"),
            Action::ApproveSettlement => write!(f, "Approve settlement"),
            Action::ApproveCancel => write!(f, "Approve cancel"),
            Action::ClaimAfterDeadline => write!(f, "Claim after deadline"),
            Action::CheckStatus => write!(f, "Check status"),
        }
    }
}
