use crate::{
    gateway_client::GatewayClient,
    ui::{
        self,
        UserEvent,
        WizardEvent,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::{
    DeploymentEnv,
    DeploymentStore,
    EscrowRecord,
};
use escrow_core::{
    Action,
    Address,
    EscrowConfig,
    TokenAmount,
    chain::{
        Deployment,
        EscrowGateway,
        WalletProvider,
    },
    dispatcher::{
        ActionDispatcher,
        ActionParams,
        DispatchOutcome,
        deploy_escrow,
    },
    poller::{
        ContractView,
        PollNotice,
        Poller,
        Reconciler,
        SystemClock,
    },
    wallet::{
        WalletConnection,
        WalletSession,
    },
    wizard::{
        CreateWizard,
        WizardStep,
    },
};
use std::sync::Arc;
use tokio::sync::{
    mpsc,
    watch,
};
use tracing::{
    error,
    info,
    warn,
};
use url::Url;

pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8787";
const MAX_ERRORS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Screen {
    Manage,
    Create,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub network: DeploymentEnv,
    pub gateway_url: Url,
    pub contract: Option<Address>,
    pub escrow: EscrowConfig,
    pub start_in_create: bool,
}

/// Everything one frame needs.
#[derive(Clone, Debug)]
pub struct AppSnapshot {
    pub screen: Screen,
    pub network: DeploymentEnv,
    pub session: Option<WalletSession>,
    pub connecting: bool,
    pub contract: Option<Address>,
    pub view: Option<ContractView>,
    pub polling: bool,
    pub in_flight: Option<Action>,
    pub wizard: CreateWizard,
    pub platform_fee: TokenAmount,
    pub fee_recipient: Address,
    pub status: String,
    pub errors: Vec<String>,
}

/// Results of background work, delivered to the UI loop.
#[derive(Debug)]
enum AppEvent {
    View(ContractView),
    Session(Option<WalletSession>),
    ConnectFailed(escrow_core::Error),
    Dispatched {
        action: Action,
        result: escrow_core::Result<DispatchOutcome>,
    },
    Deployed(escrow_core::Result<Deployment>),
}

pub struct Inbox {
    events: mpsc::UnboundedReceiver<AppEvent>,
    notices: mpsc::UnboundedReceiver<PollNotice>,
}

pub struct AppController<G = GatewayClient, W = GatewayClient> {
    gateway: G,
    wallet: Arc<WalletConnection<W>>,
    config: EscrowConfig,
    network: DeploymentEnv,
    store: DeploymentStore,
    screen: Screen,
    session: Option<WalletSession>,
    contract: Option<Address>,
    // Opened (not deployed) here and not yet in the store.
    unrecorded: Option<Address>,
    poller: Poller,
    latest_view: Option<ContractView>,
    dispatcher: Option<ActionDispatcher<G, W>>,
    in_flight: Option<Action>,
    wizard: CreateWizard,
    status: String,
    errors: Vec<String>,
    events: mpsc::UnboundedSender<AppEvent>,
    notices: mpsc::UnboundedSender<PollNotice>,
}

impl<G, W> AppController<G, W>
where
    G: EscrowGateway + Clone + Send + Sync + 'static,
    W: WalletProvider + Clone + Send + Sync + 'static,
{
    pub fn new(
        gateway: G,
        wallet: W,
        config: EscrowConfig,
        network: DeploymentEnv,
        store: DeploymentStore,
    ) -> (Self, Inbox) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let wallet = Arc::new(WalletConnection::new(wallet, config.target_chain_id));
        let controller = Self {
            gateway,
            wallet,
            config,
            network,
            store,
            screen: Screen::Manage,
            session: None,
            contract: None,
            unrecorded: None,
            poller: Poller::new(),
            latest_view: None,
            dispatcher: None,
            in_flight: None,
            wizard: CreateWizard::new(),
            status: String::new(),
            errors: Vec::new(),
            events,
            notices,
        };
        let inbox = Inbox {
            events: events_rx,
            notices: notices_rx,
        };
        (controller, inbox)
    }

    /// Opens `contract` (or the last recorded one) and starts connecting the
    /// wallet.
    pub fn start(&mut self, contract: Option<Address>, create: bool) {
        tokio::spawn(forward_sessions(self.wallet.subscribe(), self.events.clone()));

        let latest = self.store.latest().unwrap_or_else(|err| {
            warn!(%err, "could not read escrow records");
            None
        });
        self.contract = contract.or_else(|| latest.map(|r| r.contract_address));
        if let Some(contract) = self.contract
            && !self.is_recorded(contract)
        {
            self.unrecorded = Some(contract);
        }
        self.screen = if create || self.contract.is_none() {
            Screen::Create
        } else {
            Screen::Manage
        };
        self.connect_wallet();
    }

    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            screen: self.screen,
            network: self.network,
            session: self.session,
            connecting: self.wallet.is_connecting(),
            contract: self.contract,
            view: self.latest_view.clone(),
            polling: self.poller.is_running(),
            in_flight: self.in_flight,
            wizard: self.wizard.clone(),
            platform_fee: self.config.platform_fee,
            fee_recipient: self.config.fee_recipient,
            status: self.status.clone(),
            errors: self.errors.clone(),
        }
    }

    pub fn shutdown(&mut self) {
        self.stop_polling();
        info!("controller shut down");
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
        info!(status = %self.status);
    }

    fn push_errors(&mut self, mut items: Vec<String>) {
        if items.is_empty() {
            return;
        }
        for item in &items {
            error!("{}", item);
        }
        self.errors.append(&mut items);
        if self.errors.len() > MAX_ERRORS {
            let drain = self.errors.len() - MAX_ERRORS;
            self.errors.drain(0..drain);
        }
    }

    fn report_failure(&mut self, what: &str, err: escrow_core::Error) {
        if err.is_user_rejection() {
            self.set_status(format!("{what} cancelled in wallet"));
        } else {
            self.push_errors(vec![format!("{what} failed: {err}")]);
        }
    }

    pub fn handle_user_event(&mut self, event: UserEvent) {
        match event {
            UserEvent::Quit | UserEvent::Redraw => {}
            UserEvent::ConnectWallet => self.connect_wallet(),
            UserEvent::ShowManage => self.show_manage(),
            UserEvent::ShowCreate => self.show_create(),
            UserEvent::Refresh => self.refresh(),
            UserEvent::OpenContract(contract) => self.open_contract(contract, true),
            UserEvent::Dispatch { action, params } => self.dispatch(action, params),
            UserEvent::Wizard(event) => self.wizard_event(event),
        }
    }

    fn connect_wallet(&mut self) {
        if self.wallet.is_connecting() {
            self.set_status("Wallet connection already in progress");
            return;
        }
        self.set_status("Connecting wallet...");
        let wallet = self.wallet.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(err) = wallet.connect().await {
                let _ = events.send(AppEvent::ConnectFailed(err));
            }
        });
    }

    fn show_manage(&mut self) {
        self.screen = Screen::Manage;
        self.restart_polling();
    }

    fn show_create(&mut self) {
        self.stop_polling();
        self.screen = Screen::Create;
    }

    fn open_contract(&mut self, contract: Address, record: bool) {
        info!(%contract, "opening contract");
        self.contract = Some(contract);
        self.latest_view = None;
        self.unrecorded = (record && !self.is_recorded(contract)).then_some(contract);
        self.screen = Screen::Manage;
        self.restart_polling();
    }

    fn is_recorded(&self, contract: Address) -> bool {
        self.store
            .load_all()
            .map(|records| records.iter().any(|r| r.contract_address == contract))
            .unwrap_or(false)
    }

    /// Polls the open contract for the connected account while the manage
    /// screen is shown.
    fn restart_polling(&mut self) {
        self.stop_polling();
        if self.screen != Screen::Manage {
            return;
        }
        let (Some(contract), Some(session)) = (self.contract, self.session) else {
            return;
        };

        let reconciler = Reconciler::new(
            self.gateway.clone(),
            SystemClock,
            contract,
            session.address,
            &self.config,
        )
        .with_notices(self.notices.clone());
        let view = reconciler.subscribe();
        if !self.poller.start(reconciler, self.config.poll_interval()) {
            return;
        }
        let Some(poll) = self.poller.handle() else {
            return;
        };
        tokio::spawn(forward_views(view.clone(), self.events.clone()));
        self.dispatcher = Some(ActionDispatcher::new(
            self.gateway.clone(),
            self.wallet.provider().clone(),
            self.config.clone(),
            contract,
            session.address,
            view,
            poll,
        ));
    }

    fn stop_polling(&mut self) {
        self.poller.stop();
        self.dispatcher = None;
    }

    fn refresh(&mut self) {
        let Some(poll) = self.poller.handle() else {
            self.set_status("Not polling; open a contract with a connected wallet");
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = poll.refresh_now().await {
                warn!(%err, "manual refresh failed");
            }
        });
    }

    fn dispatch(&mut self, action: Action, params: ActionParams) {
        if let Some(current) = self.in_flight {
            self.set_status(format!("Still waiting for {current}"));
            return;
        }
        let Some(dispatcher) = self.dispatcher.clone() else {
            self.push_errors(vec![
                "Connect a wallet and open a contract first".to_string(),
            ]);
            return;
        };
        self.in_flight = Some(action);
        if action.is_mutating() {
            self.set_status(format!("{action}: confirm in your wallet..."));
        } else {
            self.set_status("Refreshing...");
        }
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = dispatcher.dispatch(action, params).await;
            let _ = events.send(AppEvent::Dispatched { action, result });
        });
    }

    fn wizard_field(&mut self) -> Option<&mut String> {
        let step = self.wizard.step();
        let draft = self.wizard.draft_mut();
        match step {
            WizardStep::Payee => Some(&mut draft.payee_address),
            WizardStep::Amount => Some(&mut draft.amount),
            WizardStep::Duration => Some(&mut draft.duration_days),
            _ => None,
        }
    }

    fn wizard_event(&mut self, event: WizardEvent) {
        let outcome = match event {
            WizardEvent::Input(c) => {
                if let Some(field) = self.wizard_field() {
                    field.push(c);
                }
                Ok(())
            }
            WizardEvent::Erase => {
                if let Some(field) = self.wizard_field() {
                    field.pop();
                }
                Ok(())
            }
            WizardEvent::Next => self.wizard.next().map(|_| ()),
            WizardEvent::Back => {
                self.wizard.back();
                Ok(())
            }
            WizardEvent::AddMilestone => self.wizard.draft_mut().add_milestone(),
            WizardEvent::RemoveMilestone(index) => {
                self.wizard.draft_mut().remove_milestone(index)
            }
            WizardEvent::AdjustMilestone { index, delta } => {
                let draft = self.wizard.draft_mut();
                match draft.milestones().get(index) {
                    Some(&current) => {
                        let next = (i16::from(current) + delta).clamp(0, 100) as u8;
                        draft.set_percentage(index, next)
                    }
                    None => Ok(()),
                }
            }
            WizardEvent::Deploy => {
                self.deploy();
                Ok(())
            }
            WizardEvent::OpenDeployed => {
                if let Some(contract) = self
                    .wizard
                    .deployed()
                    .map(|d| d.deployment.contract_address)
                {
                    self.wizard.reset();
                    self.open_contract(contract, false);
                }
                Ok(())
            }
            WizardEvent::Restart => {
                self.wizard.reset();
                Ok(())
            }
        };
        if let Err(err) = outcome {
            self.set_status(err.to_string());
        }
    }

    fn deploy(&mut self) {
        let Some(session) = self.session else {
            self.push_errors(vec!["Connect a wallet before deploying".to_string()]);
            return;
        };
        let request = match self
            .wizard
            .begin_deploy(session.address, self.config.token_address)
        {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                self.push_errors(vec![format!("Cannot deploy: {err}")]);
                return;
            }
        };

        self.set_status("Deploying escrow: confirm in your wallet...");
        let gateway = self.gateway.clone();
        let wallet = self.wallet.provider().clone();
        let config = self.config.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = deploy_escrow(&gateway, &wallet, &config, &request).await;
            let _ = events.send(AppEvent::Deployed(result));
        });
    }

    fn handle_app_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::View(view) => {
                let current_viewer = self.session.map(|s| s.address);
                if Some(view.contract) != self.contract || Some(view.viewer) != current_viewer {
                    return;
                }
                if self.unrecorded == Some(view.contract) {
                    self.unrecorded = None;
                    let record = EscrowRecord::opened(view.contract, &view.snapshot);
                    if let Err(err) = self.store.record(record) {
                        self.push_errors(vec![format!("Could not record contract: {err}")]);
                    }
                }
                self.latest_view = Some(view);
            }
            AppEvent::Session(session) => {
                let account_changed = self.session.map(|s| s.address) != session.map(|s| s.address);
                self.session = session;
                match session {
                    Some(s) => {
                        self.set_status(format!(
                            "Connected {} on chain {}",
                            s.address.short(),
                            s.chain_id
                        ));
                        if account_changed || !self.poller.is_running() {
                            self.latest_view = None;
                            self.restart_polling();
                        }
                    }
                    None => {
                        self.stop_polling();
                        self.set_status("Wallet disconnected");
                    }
                }
            }
            AppEvent::ConnectFailed(err) => self.report_failure("Wallet connection", err),
            AppEvent::Dispatched { action, result } => {
                self.in_flight = None;
                match result {
                    Ok(outcome) => match outcome.tx_hash {
                        Some(tx_hash) => self.set_status(format!("{action} confirmed ({tx_hash})")),
                        None => self.set_status("Status refreshed"),
                    },
                    Err(err) => self.report_failure(&action.to_string(), err),
                }
            }
            AppEvent::Deployed(result) => match result {
                Ok(deployment) => {
                    let contract = deployment.contract_address;
                    self.wizard.finish_deploy(Some(deployment));
                    let record = self
                        .wizard
                        .deployed()
                        .map(|d| EscrowRecord::deployed(&d.request, &d.deployment));
                    if let Some(record) = record
                        && let Err(err) = self.store.record(record)
                    {
                        self.push_errors(vec![format!("Could not record deployment: {err}")]);
                    }
                    self.set_status(format!("Escrow deployed at {contract}"));
                }
                Err(err) => {
                    self.wizard.finish_deploy(None);
                    self.report_failure("Deployment", err);
                }
            },
        }
    }

    fn handle_notice(&mut self, notice: PollNotice) {
        match notice {
            PollNotice::ReadFailing {
                consecutive,
                message,
            } => self.push_errors(vec![format!(
                "Contract reads failing ({consecutive} in a row): {message}"
            )]),
            PollNotice::Recovered => self.set_status("Contract reads recovered"),
        }
    }
}

async fn forward_sessions(
    mut sessions: watch::Receiver<Option<WalletSession>>,
    events: mpsc::UnboundedSender<AppEvent>,
) {
    while sessions.changed().await.is_ok() {
        let session = *sessions.borrow_and_update();
        if events.send(AppEvent::Session(session)).is_err() {
            break;
        }
    }
}

/// Ends when the poll loop that owns the view is dropped.
async fn forward_views(
    mut views: watch::Receiver<Option<ContractView>>,
    events: mpsc::UnboundedSender<AppEvent>,
) {
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        if let Some(view) = view
            && events.send(AppEvent::View(view)).is_err()
        {
            break;
        }
    }
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let gateway = GatewayClient::new(&config.gateway_url)?;
    let store = DeploymentStore::new(config.network).map_err(|e| eyre!(e))?;
    let (mut controller, inbox) = AppController::new(
        gateway.clone(),
        gateway,
        config.escrow,
        config.network,
        store,
    );
    controller.start(config.contract, config.start_in_create);

    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();

    info!("Starting UI");
    ui::terminal_enter(&mut ui_state)?;
    let res = run_loop(controller, inbox, &mut ui_state, &mut input_events).await;
    ui::terminal_exit()?;
    res
}

async fn run_loop<G, W>(
    mut controller: AppController<G, W>,
    mut inbox: Inbox,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
) -> Result<()>
where
    G: EscrowGateway + Clone + Send + Sync + 'static,
    W: WalletProvider + Clone + Send + Sync + 'static,
{
    info!("Running app loop");
    ui::draw(ui_state, &controller.snapshot()).wrap_err("initial draw failed")?;

    loop {
        tokio::select! {
            Some(event) = inbox.events.recv() => {
                controller.handle_app_event(event);
            }
            Some(notice) = inbox.notices.recv() => {
                controller.handle_notice(notice);
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            raw_ev = ui::next_raw_event(input_events) => {
                let event = raw_ev?;
                let Some(ev) = ui::interpret_event(ui_state, event) else {
                    continue;
                };
                if ev == UserEvent::Quit {
                    break;
                }
                controller.handle_user_event(ev);
            }
        }
        ui::draw(ui_state, &controller.snapshot()).wrap_err("draw failed")?;
    }

    controller.shutdown();
    Ok(())
}
