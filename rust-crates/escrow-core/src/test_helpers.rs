//! Fixtures and fake collaborators shared by unit tests and downstream crates.

use crate::{
    address::Address,
    amount::TokenAmount,
    chain::{
        ChainError,
        ContractCall,
        ContractReader,
        DeployRequest,
        EscrowGateway,
        TxHash,
        TxReceipt,
        WalletProvider,
    },
    poller::Clock,
    snapshot::{
        ContractSnapshot,
        Milestone,
    },
    wallet::WalletSession,
};
use chrono::{
    DateTime,
    TimeDelta,
    Utc,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
    },
};

const fn address(last: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = last;
    Address::new(bytes)
}

pub const ALICE: Address = address(0xa1);
pub const BOB: Address = address(0xb2);
pub const CAROL: Address = address(0xc3);
pub const ESCROW: Address = address(0xe5);
pub const DEPLOYED: Address = address(0xd7);

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600, 0).unwrap()
}

pub fn window() -> TimeDelta {
    TimeDelta::seconds(3600)
}

/// Fee paid, both parties confirmed, deposited, nothing released, deadline
/// thirty days after [`t0`]. ALICE pays, BOB receives 100 USDC.
pub fn funded_snapshot(percentages: &[u8]) -> ContractSnapshot {
    ContractSnapshot {
        payer: ALICE,
        payee: BOB,
        amount: TokenAmount::whole_tokens(100),
        remaining_amount: TokenAmount::whole_tokens(100),
        deposited: true,
        platform_fee_paid: true,
        confirmed_payer: true,
        confirmed_payee: true,
        deadline: t0() + TimeDelta::days(30),
        milestones: percentages
            .iter()
            .map(|&percentage| Milestone {
                percentage,
                released: false,
            })
            .collect(),
        cancel_payer_approved_at: None,
        cancel_payee_approved_at: None,
        settlement: None,
    }
}

#[derive(Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCall {
    Read(Address),
    Submit {
        contract: Address,
        from: Address,
        call: ContractCall,
    },
    WaitForReceipt(TxHash),
    Deploy(DeployRequest),
    Balance,
    Allowance {
        spender: Address,
    },
    Approve {
        spender: Address,
        amount: TokenAmount,
    },
}

#[derive(Default)]
struct GatewayState {
    reads: VecDeque<Result<ContractSnapshot, ChainError>>,
    current: Option<ContractSnapshot>,
    submit_error: Option<ChainError>,
    revert_reason: Option<String>,
    balance: TokenAmount,
    allowance: TokenAmount,
    calls: Vec<RecordedCall>,
    next_tx: u64,
}

/// Scripted escrow gateway. Reads pop queued results first and fall back to
/// the last good snapshot; every call is recorded.
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl FakeGateway {
    pub fn with_snapshot(snapshot: ContractSnapshot) -> Self {
        let gateway = Self::default();
        gateway.set_snapshot(snapshot);
        gateway
    }

    pub fn set_snapshot(&self, snapshot: ContractSnapshot) {
        self.state.lock().unwrap().current = Some(snapshot);
    }

    pub fn push_read(&self, result: Result<ContractSnapshot, ChainError>) {
        self.state.lock().unwrap().reads.push_back(result);
    }

    pub fn fail_submits_with(&self, err: ChainError) {
        self.state.lock().unwrap().submit_error = Some(err);
    }

    pub fn revert_with(&self, reason: &str) {
        self.state.lock().unwrap().revert_reason = Some(reason.to_string());
    }

    pub fn set_balance(&self, balance: TokenAmount) {
        self.state.lock().unwrap().balance = balance;
    }

    pub fn set_allowance(&self, allowance: TokenAmount) {
        self.state.lock().unwrap().allowance = allowance;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn read_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, RecordedCall::Read(_)))
            .count()
    }

    pub fn submitted(&self) -> Vec<ContractCall> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Submit { call, .. } => Some(call),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RecordedCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn next_tx_hash(&self) -> TxHash {
        let mut state = self.state.lock().unwrap();
        state.next_tx += 1;
        TxHash(format!("0x{:064x}", state.next_tx))
    }
}

impl ContractReader for FakeGateway {
    async fn contract_details(
        &self,
        contract: &Address,
    ) -> Result<ContractSnapshot, ChainError> {
        self.record(RecordedCall::Read(*contract));
        let mut state = self.state.lock().unwrap();
        match state.reads.pop_front() {
            Some(Ok(snapshot)) => {
                state.current = Some(snapshot.clone());
                Ok(snapshot)
            }
            Some(Err(err)) => Err(err),
            None => state
                .current
                .clone()
                .ok_or_else(|| ChainError::new(None, "contract not found")),
        }
    }
}

impl EscrowGateway for FakeGateway {
    async fn submit(
        &self,
        contract: &Address,
        from: &Address,
        call: &ContractCall,
    ) -> Result<TxHash, ChainError> {
        self.record(RecordedCall::Submit {
            contract: *contract,
            from: *from,
            call: *call,
        });
        if let Some(err) = self.state.lock().unwrap().submit_error.clone() {
            return Err(err);
        }
        Ok(self.next_tx_hash())
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: &TxHash,
        _confirmations: u64,
    ) -> Result<TxReceipt, ChainError> {
        self.record(RecordedCall::WaitForReceipt(tx_hash.clone()));
        let revert_reason = self.state.lock().unwrap().revert_reason.clone();
        Ok(TxReceipt {
            tx_hash: tx_hash.clone(),
            block_number: 1,
            success: revert_reason.is_none(),
            revert_reason,
            contract_address: Some(DEPLOYED),
        })
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<TxHash, ChainError> {
        self.record(RecordedCall::Deploy(request.clone()));
        if let Some(err) = self.state.lock().unwrap().submit_error.clone() {
            return Err(err);
        }
        Ok(self.next_tx_hash())
    }

    async fn token_balance(
        &self,
        _token: &Address,
        _owner: &Address,
    ) -> Result<TokenAmount, ChainError> {
        self.record(RecordedCall::Balance);
        Ok(self.state.lock().unwrap().balance)
    }

    async fn token_allowance(
        &self,
        _token: &Address,
        _owner: &Address,
        spender: &Address,
    ) -> Result<TokenAmount, ChainError> {
        self.record(RecordedCall::Allowance { spender: *spender });
        Ok(self.state.lock().unwrap().allowance)
    }

    async fn approve_token(
        &self,
        _token: &Address,
        _owner: &Address,
        spender: &Address,
        amount: TokenAmount,
    ) -> Result<TxHash, ChainError> {
        self.record(RecordedCall::Approve {
            spender: *spender,
            amount,
        });
        self.state.lock().unwrap().allowance = amount;
        Ok(self.next_tx_hash())
    }
}

struct WalletState {
    account: Address,
    chain_id: u64,
    connect_error: Option<ChainError>,
    switch_outcome: Result<bool, ChainError>,
    switch_requests: Vec<u64>,
}

/// Scripted wallet provider. A successful switch moves it to the requested
/// chain.
#[derive(Clone)]
pub struct FakeWallet {
    state: Arc<Mutex<WalletState>>,
}

impl FakeWallet {
    pub fn on_chain(account: Address, chain_id: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(WalletState {
                account,
                chain_id,
                connect_error: None,
                switch_outcome: Ok(true),
                switch_requests: Vec::new(),
            })),
        }
    }

    pub fn reject_connect(&self) {
        self.state.lock().unwrap().connect_error = Some(ChainError::user_rejected());
    }

    pub fn switch_outcome(&self, outcome: Result<bool, ChainError>) {
        self.state.lock().unwrap().switch_outcome = outcome;
    }

    pub fn switch_requests(&self) -> Vec<u64> {
        self.state.lock().unwrap().switch_requests.clone()
    }
}

impl WalletProvider for FakeWallet {
    async fn connect(&self) -> Result<WalletSession, ChainError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = state.connect_error.clone() {
            return Err(err);
        }
        Ok(WalletSession {
            address: state.account,
            chain_id: state.chain_id,
        })
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().chain_id)
    }

    async fn switch_network(&self, chain_id: u64) -> Result<bool, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.switch_requests.push(chain_id);
        let outcome = state.switch_outcome.clone();
        if let Ok(true) = outcome {
            state.chain_id = chain_id;
        }
        outcome
    }
}
