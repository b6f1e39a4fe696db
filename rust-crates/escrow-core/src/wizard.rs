//! Linear create-escrow flow. Forward moves are gated by the current step's
//! validation, backward moves never are.

use crate::{
    address::Address,
    amount::TokenAmount,
    chain::{
        DeployRequest,
        Deployment,
    },
    error::ValidationError,
    snapshot::{
        MAX_MILESTONES,
        validate_percentages,
    },
};
use tracing::debug;

pub const SECONDS_PER_DAY: u64 = 86_400;
pub const MAX_DURATION_DAYS: u16 = 365;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WizardStep {
    #[default]
    Payee,
    Amount,
    Duration,
    Milestones,
    Review,
    Success,
}

impl WizardStep {
    pub const ALL: [WizardStep; 6] = [
        WizardStep::Payee,
        WizardStep::Amount,
        WizardStep::Duration,
        WizardStep::Milestones,
        WizardStep::Review,
        WizardStep::Success,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn title(self) -> &'static str {
        match self {
            WizardStep::Payee => "Payee",
            WizardStep::Amount => "Amount",
            WizardStep::Duration => "Duration",
            WizardStep::Milestones => "Milestones",
            WizardStep::Review => "Review",
            WizardStep::Success => "Done",
        }
    }
}

/// Form input as typed; parsed only when a step is validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WizardDraft {
    pub payee_address: String,
    pub amount: String,
    pub duration_days: String,
    milestones: Vec<u8>,
}

impl Default for WizardDraft {
    fn default() -> Self {
        Self {
            payee_address: String::new(),
            amount: "100".to_string(),
            duration_days: String::new(),
            milestones: vec![50, 50],
        }
    }
}

impl WizardDraft {
    pub fn milestones(&self) -> &[u8] {
        &self.milestones
    }

    pub fn milestone_total(&self) -> u32 {
        self.milestones.iter().copied().map(u32::from).sum()
    }

    pub fn add_milestone(&mut self) -> Result<(), ValidationError> {
        if self.milestones.len() >= MAX_MILESTONES {
            return Err(ValidationError::MilestoneCount {
                count: self.milestones.len() + 1,
            });
        }
        self.milestones.push(0);
        Ok(())
    }

    pub fn remove_milestone(&mut self, index: usize) -> Result<(), ValidationError> {
        if self.milestones.len() <= 1 {
            return Err(ValidationError::MilestoneCount { count: 0 });
        }
        if index < self.milestones.len() {
            self.milestones.remove(index);
        }
        Ok(())
    }

    pub fn set_percentage(&mut self, index: usize, percentage: u8) -> Result<(), ValidationError> {
        if percentage > 100 {
            return Err(ValidationError::PercentageOutOfRange);
        }
        if let Some(slot) = self.milestones.get_mut(index) {
            *slot = percentage;
        }
        Ok(())
    }
}

pub fn validate_payee(input: &str) -> Result<Address, ValidationError> {
    input.trim().parse().map_err(ValidationError::InvalidPayee)
}

pub fn validate_amount(input: &str) -> Result<TokenAmount, ValidationError> {
    let amount = TokenAmount::parse_decimal(input).map_err(ValidationError::InvalidAmount)?;
    if amount.is_zero() {
        return Err(ValidationError::NonPositiveAmount);
    }
    Ok(amount)
}

pub fn validate_duration(input: &str) -> Result<u16, ValidationError> {
    match input.trim().parse::<u16>() {
        Ok(days) if (1..=MAX_DURATION_DAYS).contains(&days) => Ok(days),
        _ => Err(ValidationError::DurationOutOfRange),
    }
}

pub fn validate_milestones(percentages: &[u8]) -> Result<(), ValidationError> {
    validate_percentages(percentages.iter().copied())
}

/// A finished deployment together with what was deployed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployedEscrow {
    pub deployment: Deployment,
    pub request: DeployRequest,
}

#[derive(Clone, Debug, Default)]
pub struct CreateWizard {
    step: WizardStep,
    draft: WizardDraft,
    in_flight: Option<DeployRequest>,
    deployed: Option<DeployedEscrow>,
}

impl CreateWizard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> WizardStep {
        self.step
    }

    pub fn draft(&self) -> &WizardDraft {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut WizardDraft {
        &mut self.draft
    }

    pub fn is_deploying(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn deployed(&self) -> Option<&DeployedEscrow> {
        self.deployed.as_ref()
    }

    /// `Success` is not a form step, so it never counts towards progress.
    pub fn progress_percent(&self) -> u8 {
        let total = WizardStep::ALL.len() - 1;
        let current = (self.step.index() + 1).min(total);
        ((current as f64 / total as f64) * 100.0).round() as u8
    }

    pub fn validate_step(&self, step: WizardStep) -> Result<(), ValidationError> {
        match step {
            WizardStep::Payee => validate_payee(&self.draft.payee_address).map(|_| ()),
            WizardStep::Amount => validate_amount(&self.draft.amount).map(|_| ()),
            WizardStep::Duration => validate_duration(&self.draft.duration_days).map(|_| ()),
            WizardStep::Milestones => validate_milestones(&self.draft.milestones),
            WizardStep::Review => WizardStep::ALL[..WizardStep::Review.index()]
                .iter()
                .try_for_each(|step| self.validate_step(*step)),
            WizardStep::Success => Ok(()),
        }
    }

    /// Advances one step when the current one validates. Stops at `Review`;
    /// only a finished deployment reaches `Success`.
    pub fn next(&mut self) -> Result<WizardStep, ValidationError> {
        self.validate_step(self.step)?;
        if self.step.index() < WizardStep::Review.index() {
            self.step = WizardStep::ALL[self.step.index() + 1];
            debug!(step = ?self.step, "wizard advanced");
        }
        Ok(self.step)
    }

    pub fn back(&mut self) -> WizardStep {
        if let Some(previous) = self.step.index().checked_sub(1) {
            self.step = WizardStep::ALL[previous];
        }
        self.step
    }

    /// Validates the whole draft and marks a deployment as in flight.
    /// `Ok(None)` while another deployment is still in flight or when not on
    /// the review step.
    pub fn begin_deploy(
        &mut self,
        payer: Address,
        token: Address,
    ) -> Result<Option<DeployRequest>, ValidationError> {
        if self.in_flight.is_some() || self.step != WizardStep::Review {
            return Ok(None);
        }
        self.validate_step(WizardStep::Review)?;

        let days = validate_duration(&self.draft.duration_days)?;
        let request = DeployRequest {
            payer,
            payee: validate_payee(&self.draft.payee_address)?,
            token,
            amount: validate_amount(&self.draft.amount)?,
            duration_secs: u64::from(days) * SECONDS_PER_DAY,
            milestone_percentages: self.draft.milestones.clone(),
        };
        self.in_flight = Some(request.clone());
        Ok(Some(request))
    }

    /// Success discards the draft and shows `Success`; failure keeps the
    /// draft on `Review` for another attempt.
    pub fn finish_deploy(&mut self, deployment: Option<Deployment>) {
        let Some(request) = self.in_flight.take() else {
            return;
        };
        if let Some(deployment) = deployment {
            self.draft = WizardDraft::default();
            self.deployed = Some(DeployedEscrow {
                deployment,
                request,
            });
            self.step = WizardStep::Success;
        }
    }

    /// Drops all progress, as when leaving the create screen.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        chain::TxHash,
        test_helpers::{
            ALICE,
            BOB,
            DEPLOYED,
        },
    };

    const USDC: Address = crate::config::USDC_POLYGON;

    fn filled_wizard() -> CreateWizard {
        let mut wizard = CreateWizard::new();
        wizard.draft_mut().payee_address = BOB.to_string();
        wizard.draft_mut().amount = "250.5".to_string();
        wizard.draft_mut().duration_days = "30".to_string();
        for _ in 0..4 {
            wizard.next().unwrap();
        }
        wizard
    }

    fn deployment() -> Deployment {
        Deployment {
            tx_hash: TxHash("0xabc".to_string()),
            contract_address: DEPLOYED,
        }
    }

    #[test]
    fn next__milestones_not_summing_to_100__blocks_forward() {
        // given
        let mut wizard = CreateWizard::new();
        wizard.draft_mut().payee_address = BOB.to_string();
        wizard.draft_mut().duration_days = "10".to_string();
        for _ in 0..3 {
            wizard.next().unwrap();
        }
        wizard.draft_mut().set_percentage(0, 60).unwrap();
        wizard.draft_mut().set_percentage(1, 30).unwrap();

        // when
        let result = wizard.next();

        // then
        assert_eq!(result, Err(ValidationError::MilestoneSum { sum: 90 }));
        assert_eq!(wizard.step(), WizardStep::Milestones);
    }

    #[test]
    fn next__invalid_payee__stays_on_first_step() {
        // given
        let mut wizard = CreateWizard::new();
        wizard.draft_mut().payee_address = "0x1234".to_string();

        // when
        let result = wizard.next();

        // then
        assert!(matches!(result, Err(ValidationError::InvalidPayee(_))));
        assert_eq!(wizard.step(), WizardStep::Payee);
    }

    #[test]
    fn next__stops_at_review() {
        // given
        let mut wizard = filled_wizard();

        // when
        let step = wizard.next().unwrap();

        // then
        assert_eq!(step, WizardStep::Review);
    }

    #[test]
    fn back__is_unconditional() {
        // given
        let mut wizard = filled_wizard();
        wizard.draft_mut().amount = "0".to_string();

        // then
        assert_eq!(wizard.back(), WizardStep::Milestones);
        assert_eq!(wizard.back(), WizardStep::Duration);
        assert_eq!(wizard.back(), WizardStep::Amount);
        assert_eq!(wizard.back(), WizardStep::Payee);
        assert_eq!(wizard.back(), WizardStep::Payee);
    }

    #[test]
    fn progress_percent__excludes_success_step() {
        // given
        let mut wizard = filled_wizard();

        // then
        assert_eq!(wizard.progress_percent(), 100);
        wizard.back();
        assert_eq!(wizard.progress_percent(), 80);
        wizard.reset();
        assert_eq!(wizard.progress_percent(), 20);
    }

    #[test]
    fn validators__field_rules() {
        assert_eq!(validate_amount("0"), Err(ValidationError::NonPositiveAmount));
        assert!(matches!(
            validate_amount("abc"),
            Err(ValidationError::InvalidAmount(_))
        ));
        assert_eq!(validate_duration("0"), Err(ValidationError::DurationOutOfRange));
        assert_eq!(validate_duration("366"), Err(ValidationError::DurationOutOfRange));
        assert_eq!(validate_duration("2.5"), Err(ValidationError::DurationOutOfRange));
        assert_eq!(validate_duration(" 365 "), Ok(365));
        assert_eq!(validate_milestones(&[100]), Ok(()));
    }

    #[test]
    fn milestone_editor__respects_bounds() {
        // given
        let mut draft = WizardDraft::default();

        // then
        assert_eq!(draft.milestones(), &[50, 50]);
        for _ in 0..8 {
            draft.add_milestone().unwrap();
        }
        assert!(draft.add_milestone().is_err());
        assert_eq!(
            draft.set_percentage(0, 101),
            Err(ValidationError::PercentageOutOfRange)
        );

        for _ in 0..9 {
            draft.remove_milestone(0).unwrap();
        }
        assert!(draft.remove_milestone(0).is_err());
        assert_eq!(draft.milestones().len(), 1);
    }

    #[test]
    fn begin_deploy__builds_request_in_contract_units() {
        // given
        let mut wizard = filled_wizard();

        // when
        let request = wizard.begin_deploy(ALICE, USDC).unwrap().unwrap();

        // then
        assert_eq!(
            request,
            DeployRequest {
                payer: ALICE,
                payee: BOB,
                token: USDC,
                amount: TokenAmount::from_units(250_500_000),
                duration_secs: 30 * 86_400,
                milestone_percentages: vec![50, 50],
            }
        );
        assert!(wizard.is_deploying());
    }

    #[test]
    fn begin_deploy__while_in_flight__is_a_no_op() {
        // given
        let mut wizard = filled_wizard();
        wizard.begin_deploy(ALICE, USDC).unwrap();

        // when
        let second = wizard.begin_deploy(ALICE, USDC);

        // then
        assert_eq!(second, Ok(None));
    }

    #[test]
    fn finish_deploy__success__discards_draft() {
        // given
        let mut wizard = filled_wizard();
        wizard.begin_deploy(ALICE, USDC).unwrap();

        // when
        wizard.finish_deploy(Some(deployment()));

        // then
        assert_eq!(wizard.step(), WizardStep::Success);
        assert_eq!(wizard.draft(), &WizardDraft::default());
        assert!(!wizard.is_deploying());
        assert_eq!(
            wizard.deployed().unwrap().deployment.contract_address,
            DEPLOYED
        );
        assert_eq!(wizard.progress_percent(), 100);
    }

    #[test]
    fn finish_deploy__failure__stays_on_review_for_retry() {
        // given
        let mut wizard = filled_wizard();
        wizard.begin_deploy(ALICE, USDC).unwrap();

        // when
        wizard.finish_deploy(None);

        // then
        assert_eq!(wizard.step(), WizardStep::Review);
        assert!(!wizard.is_deploying());
        assert!(wizard.begin_deploy(ALICE, USDC).unwrap().is_some());
    }
}
