use crate::{
    Result,
    address::Address,
    amount::TokenAmount,
    chain::{
        ContractCall,
        DeployRequest,
        Deployment,
        EscrowGateway,
        TxHash,
        TxReceipt,
        WalletProvider,
    },
    config::EscrowConfig,
    error::{
        Error,
        ValidationError,
    },
    poller::{
        ContractView,
        PollHandle,
        TickOutcome,
    },
    state::Action,
};
use tokio::sync::watch;
use tracing::{
    error,
    info,
    warn,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActionParams {
    pub amount: Option<TokenAmount>,
}

impl ActionParams {
    pub fn amount(amount: TokenAmount) -> Self {
        Self {
            amount: Some(amount),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub action: Action,
    pub tx_hash: Option<TxHash>,
    /// `None` when the poll loop was gone by the time the transaction landed.
    pub refresh: Option<TickOutcome>,
}

/// Sends legal actions for one viewer of one escrow.
#[derive(Clone)]
pub struct ActionDispatcher<G, W> {
    gateway: G,
    wallet: W,
    config: EscrowConfig,
    contract: Address,
    viewer: Address,
    view: watch::Receiver<Option<ContractView>>,
    poll: PollHandle,
}

impl<G, W> ActionDispatcher<G, W>
where
    G: EscrowGateway + Sync,
    W: WalletProvider + Sync,
{
    pub fn new(
        gateway: G,
        wallet: W,
        config: EscrowConfig,
        contract: Address,
        viewer: Address,
        view: watch::Receiver<Option<ContractView>>,
        poll: PollHandle,
    ) -> Self {
        Self {
            gateway,
            wallet,
            config,
            contract,
            viewer,
            view,
            poll,
        }
    }

    pub async fn dispatch(&self, action: Action, params: ActionParams) -> Result<DispatchOutcome> {
        let call = self.prepare(action, params)?;

        let tx_hash = match call {
            None => None,
            Some(call) => Some(self.send(call).await.inspect_err(|err| {
                if err.is_user_rejection() {
                    info!(%action, "action rejected in wallet");
                } else {
                    error!(%action, %err, "action failed");
                }
            })?),
        };

        let refresh = match self.poll.refresh_now().await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(%err, "could not refresh contract view after action");
                None
            }
        };
        Ok(DispatchOutcome {
            action,
            tx_hash,
            refresh,
        })
    }

    /// Checks the action against the rendered view and builds the call.
    /// `None` means the action only refreshes.
    fn prepare(&self, action: Action, params: ActionParams) -> Result<Option<ContractCall>> {
        let view = self.view.borrow();
        let view = view.as_ref().ok_or(Error::NoState)?;
        if !view.assessment.allows(&action) {
            warn!(%action, state = %view.assessment.state, "refusing action outside legal set");
            return Err(Error::StateViolation { action });
        }

        let call = match action {
            Action::CheckStatus => return Ok(None),
            Action::PayPlatformFee => ContractCall::PayPlatformFee,
            Action::ConfirmPayer => ContractCall::ConfirmPayer,
            Action::ConfirmPayee => ContractCall::ConfirmPayee,
            Action::Deposit => {
                let amount = params.amount.unwrap_or(view.snapshot.amount);
                if amount.is_zero() {
                    return Err(ValidationError::NonPositiveAmount.into());
                }
                ContractCall::Deposit { amount }
            }
            Action::ReleaseMilestone(index) => ContractCall::ReleaseMilestone { index },
            Action::Refund => ContractCall::Refund,
            Action::ProposeSettlement => {
                let amount = params
                    .amount
                    .ok_or(ValidationError::MissingAmount { action })?;
                let remaining = view.snapshot.remaining_amount;
                if amount.is_zero() || amount > remaining {
                    return Err(ValidationError::SettlementAmount { remaining }.into());
                }
                ContractCall::ProposeSettlement { amount }
            }
            Action::ApproveSettlement => ContractCall::ApproveSettlement,
            Action::ApproveCancel => ContractCall::ApproveCancel,
            Action::ClaimAfterDeadline => ContractCall::ClaimAfterDeadline,
        };
        Ok(Some(call))
    }

    async fn send(&self, call: ContractCall) -> Result<TxHash> {
        ensure_network(&self.wallet, self.config.target_chain_id).await?;

        let token_spend = match call {
            ContractCall::Deposit { amount } => Some(amount),
            ContractCall::PayPlatformFee => Some(self.config.platform_fee),
            _ => None,
        };
        if let Some(required) = token_spend {
            self.ensure_token_funds(required).await?;
        }

        info!(method = call.method(), contract = %self.contract, "submitting transaction");
        let tx_hash = self.gateway.submit(&self.contract, &self.viewer, &call).await?;
        await_success(&self.gateway, &tx_hash, self.config.confirmations).await?;
        info!(method = call.method(), %tx_hash, "transaction confirmed");
        Ok(tx_hash)
    }

    async fn ensure_token_funds(&self, required: TokenAmount) -> Result<()> {
        let token = self.config.token_address;
        let balance = self.gateway.token_balance(&token, &self.viewer).await?;
        if balance < required {
            return Err(Error::InsufficientBalance {
                have: balance,
                need: required,
            });
        }

        let allowance = self
            .gateway
            .token_allowance(&token, &self.viewer, &self.contract)
            .await?;
        if allowance < required {
            info!(%allowance, %required, "approving escrow to spend tokens");
            let approval = self
                .gateway
                .approve_token(&token, &self.viewer, &self.contract, required)
                .await?;
            await_success(&self.gateway, &approval, self.config.confirmations).await?;
        }
        Ok(())
    }
}

/// Deploys a new escrow and waits for its address.
pub async fn deploy_escrow<G, W>(
    gateway: &G,
    wallet: &W,
    config: &EscrowConfig,
    request: &DeployRequest,
) -> Result<Deployment>
where
    G: EscrowGateway + Sync,
    W: WalletProvider + Sync,
{
    ensure_network(wallet, config.target_chain_id).await?;
    info!(payer = %request.payer, payee = %request.payee, amount = %request.amount, "deploying escrow");
    let tx_hash = gateway.deploy(request).await?;
    let receipt = await_success(gateway, &tx_hash, config.confirmations).await?;
    let contract_address = receipt.contract_address.ok_or_else(|| {
        Error::ChainRejection(format!("deployment {tx_hash} produced no contract address"))
    })?;
    info!(%contract_address, "escrow deployed");
    Ok(Deployment {
        tx_hash,
        contract_address,
    })
}

async fn ensure_network<W: WalletProvider>(wallet: &W, expected: u64) -> Result<()> {
    let actual = wallet.chain_id().await?;
    if actual != expected {
        return Err(Error::NetworkMismatch { expected, actual });
    }
    Ok(())
}

async fn await_success<G: EscrowGateway>(
    gateway: &G,
    tx_hash: &TxHash,
    confirmations: u64,
) -> Result<TxReceipt> {
    let receipt = gateway.wait_for_receipt(tx_hash, confirmations).await?;
    if !receipt.success {
        let reason = receipt
            .revert_reason
            .clone()
            .unwrap_or_else(|| format!("transaction {tx_hash} reverted"));
        return Err(Error::ChainRejection(reason));
    }
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        chain::ChainError,
        poller::{
            Poller,
            Reconciler,
        },
        snapshot::ContractSnapshot,
        test_helpers::{
            ALICE,
            BOB,
            DEPLOYED,
            ESCROW,
            FakeGateway,
            FakeWallet,
            FixedClock,
            RecordedCall,
            funded_snapshot,
            t0,
        },
    };
    use std::time::Duration;

    struct Harness {
        gateway: FakeGateway,
        wallet: FakeWallet,
        dispatcher: ActionDispatcher<FakeGateway, FakeWallet>,
        _poller: Poller,
    }

    async fn harness(snapshot: ContractSnapshot, viewer: Address) -> Harness {
        let gateway = FakeGateway::with_snapshot(snapshot);
        gateway.set_balance(TokenAmount::whole_tokens(1_000));
        let wallet = FakeWallet::on_chain(viewer, 137);
        let config = EscrowConfig::default();
        let reconciler = Reconciler::new(
            gateway.clone(),
            FixedClock::at(t0()),
            ESCROW,
            viewer,
            &config,
        );
        let view = reconciler.subscribe();
        let mut poller = Poller::new();
        poller.start(reconciler, Duration::from_secs(3600));
        let poll = poller.handle().unwrap();
        poll.refresh_now().await.unwrap();
        let dispatcher =
            ActionDispatcher::new(gateway.clone(), wallet.clone(), config, ESCROW, viewer, view, poll);
        Harness {
            gateway,
            wallet,
            dispatcher,
            _poller: poller,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__illegal_action__state_violation_without_chain_call() {
        // given
        let mut snapshot = funded_snapshot(&[50, 50]);
        snapshot.milestones[0].released = true;
        let h = harness(snapshot, ALICE).await;

        // when
        let result = h.dispatcher.dispatch(Action::Refund, ActionParams::default()).await;

        // then
        assert!(matches!(
            result,
            Err(Error::StateViolation {
                action: Action::Refund
            })
        ));
        assert!(h.gateway.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__release_milestone__confirms_then_refreshes() {
        // given
        let h = harness(funded_snapshot(&[50, 50]), ALICE).await;
        let reads_before = h.gateway.read_count();

        // when
        let outcome = h
            .dispatcher
            .dispatch(Action::ReleaseMilestone(1), ActionParams::default())
            .await
            .unwrap();

        // then
        assert_eq!(
            h.gateway.submitted(),
            vec![ContractCall::ReleaseMilestone { index: 1 }]
        );
        let tx_hash = outcome.tx_hash.unwrap();
        assert!(
            h.gateway
                .calls()
                .contains(&RecordedCall::WaitForReceipt(tx_hash))
        );
        assert_eq!(outcome.refresh, Some(TickOutcome::Unchanged));
        assert_eq!(h.gateway.read_count(), reads_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__signer_rejects__user_rejected() {
        // given
        let h = harness(funded_snapshot(&[100]), ALICE).await;
        h.gateway.fail_submits_with(ChainError::user_rejected());

        // when
        let result = h
            .dispatcher
            .dispatch(Action::ApproveCancel, ActionParams::default())
            .await;

        // then
        assert!(matches!(result, Err(Error::UserRejected)));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__reverted_receipt__chain_rejection_with_reason() {
        // given
        let h = harness(funded_snapshot(&[100]), BOB).await;
        h.gateway.revert_with("Cancel window expired");

        // when
        let result = h
            .dispatcher
            .dispatch(Action::ApproveCancel, ActionParams::default())
            .await;

        // then
        match result {
            Err(Error::ChainRejection(reason)) => assert_eq!(reason, "Cancel window expired"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__wrong_network__never_submits() {
        // given
        let h = harness(funded_snapshot(&[100]), ALICE).await;
        let wrong_chain = FakeWallet::on_chain(ALICE, 1);
        let dispatcher = ActionDispatcher {
            wallet: wrong_chain,
            ..h.dispatcher.clone()
        };

        // when
        let result = dispatcher
            .dispatch(Action::ApproveCancel, ActionParams::default())
            .await;

        // then
        assert!(matches!(
            result,
            Err(Error::NetworkMismatch {
                expected: 137,
                actual: 1
            })
        ));
        assert!(h.gateway.submitted().is_empty());
        assert!(h.wallet.switch_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__deposit_with_short_allowance__approves_first() {
        // given
        let mut snapshot = funded_snapshot(&[50, 50]);
        snapshot.deposited = false;
        let h = harness(snapshot, ALICE).await;

        // when
        h.dispatcher
            .dispatch(Action::Deposit, ActionParams::default())
            .await
            .unwrap();

        // then
        let amount = TokenAmount::whole_tokens(100);
        let calls = h.gateway.calls();
        let approve_at = calls
            .iter()
            .position(|call| {
                *call
                    == RecordedCall::Approve {
                        spender: ESCROW,
                        amount,
                    }
            })
            .unwrap();
        let submit_at = calls
            .iter()
            .position(|call| matches!(call, RecordedCall::Submit { .. }))
            .unwrap();
        assert!(approve_at < submit_at);
        assert_eq!(h.gateway.submitted(), vec![ContractCall::Deposit { amount }]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__deposit_with_enough_allowance__skips_approval() {
        // given
        let mut snapshot = funded_snapshot(&[50, 50]);
        snapshot.deposited = false;
        let h = harness(snapshot, ALICE).await;
        h.gateway.set_allowance(TokenAmount::whole_tokens(500));

        // when
        h.dispatcher
            .dispatch(Action::Deposit, ActionParams::default())
            .await
            .unwrap();

        // then
        assert!(
            !h.gateway
                .calls()
                .iter()
                .any(|call| matches!(call, RecordedCall::Approve { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__fee_without_balance__insufficient_balance() {
        // given
        let mut snapshot = funded_snapshot(&[100]);
        snapshot.platform_fee_paid = false;
        let h = harness(snapshot, BOB).await;
        h.gateway.set_balance(TokenAmount::from_units(999_999));

        // when
        let result = h
            .dispatcher
            .dispatch(Action::PayPlatformFee, ActionParams::default())
            .await;

        // then
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
        assert!(h.gateway.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__settlement_amount_checked_against_remaining() {
        // given
        let mut snapshot = funded_snapshot(&[50, 50]);
        snapshot.remaining_amount = TokenAmount::whole_tokens(50);
        let h = harness(snapshot, ALICE).await;

        // when
        let missing = h
            .dispatcher
            .dispatch(Action::ProposeSettlement, ActionParams::default())
            .await;
        let too_much = h
            .dispatcher
            .dispatch(
                Action::ProposeSettlement,
                ActionParams::amount(TokenAmount::whole_tokens(51)),
            )
            .await;
        let ok = h
            .dispatcher
            .dispatch(
                Action::ProposeSettlement,
                ActionParams::amount(TokenAmount::whole_tokens(50)),
            )
            .await;

        // then
        assert!(matches!(
            missing,
            Err(Error::Validation(ValidationError::MissingAmount { .. }))
        ));
        assert!(matches!(
            too_much,
            Err(Error::Validation(ValidationError::SettlementAmount { .. }))
        ));
        assert!(ok.is_ok());
        assert_eq!(
            h.gateway.submitted(),
            vec![ContractCall::ProposeSettlement {
                amount: TokenAmount::whole_tokens(50)
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch__check_status__only_refreshes() {
        // given
        let h = harness(funded_snapshot(&[100]), BOB).await;
        let mut snapshot = funded_snapshot(&[100]);
        snapshot.confirmed_payer = false;
        h.gateway.set_snapshot(snapshot.clone());
        h.dispatcher.poll.refresh_now().await.unwrap();
        let reads_before = h.gateway.read_count();

        // when
        let outcome = h
            .dispatcher
            .dispatch(Action::CheckStatus, ActionParams::default())
            .await
            .unwrap();

        // then
        assert_eq!(outcome.tx_hash, None);
        assert_eq!(h.gateway.read_count(), reads_before + 1);
        assert!(h.gateway.submitted().is_empty());
    }

    #[tokio::test]
    async fn deploy_escrow__returns_address_from_receipt() {
        // given
        let gateway = FakeGateway::default();
        let wallet = FakeWallet::on_chain(ALICE, 137);
        let request = DeployRequest {
            payer: ALICE,
            payee: BOB,
            token: EscrowConfig::default().token_address,
            amount: TokenAmount::whole_tokens(100),
            duration_secs: 30 * 86_400,
            milestone_percentages: vec![50, 50],
        };

        // when
        let deployment = deploy_escrow(&gateway, &wallet, &EscrowConfig::default(), &request)
            .await
            .unwrap();

        // then
        assert_eq!(deployment.contract_address, DEPLOYED);
        assert_eq!(gateway.calls()[0], RecordedCall::Deploy(request));
    }

    #[tokio::test]
    async fn deploy_escrow__wrong_network__not_sent() {
        // given
        let gateway = FakeGateway::default();
        let wallet = FakeWallet::on_chain(ALICE, 80_002);
        let request = DeployRequest {
            payer: ALICE,
            payee: BOB,
            token: EscrowConfig::default().token_address,
            amount: TokenAmount::whole_tokens(5),
            duration_secs: 86_400,
            milestone_percentages: vec![100],
        };

        // when
        let result = deploy_escrow(&gateway, &wallet, &EscrowConfig::default(), &request).await;

        // then
        assert!(matches!(result, Err(Error::NetworkMismatch { .. })));
        assert!(gateway.calls().is_empty());
    }
}
