//! Periodic snapshot refresh. A single task owns fetch, assessment and
//! publication of the rendered view, so a periodic tick and an explicit
//! refresh can never race each other.

use crate::{
    Result,
    address::Address,
    chain::ContractReader,
    config::EscrowConfig,
    error::Error,
    snapshot::{
        ContractSnapshot,
        ViewerRole,
    },
    state::{
        Assessment,
        determine_state,
    },
};
use chrono::{
    DateTime,
    TimeDelta,
    Utc,
};
use std::time::Duration;
use tokio::{
    sync::{
        mpsc,
        oneshot,
        watch,
    },
    task::JoinHandle,
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What the renderer shows for one contract and one viewer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractView {
    pub contract: Address,
    pub viewer: Address,
    pub viewer_role: ViewerRole,
    pub assessment: Assessment,
    pub snapshot: ContractSnapshot,
    pub observed_at: DateTime<Utc>,
}

impl ContractView {
    fn renders_like(&self, other: &ContractView) -> bool {
        self.contract == other.contract
            && self.viewer_role == other.viewer_role
            && self.assessment == other.assessment
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollNotice {
    ReadFailing { consecutive: u32, message: String },
    Recovered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Rendered,
    Unchanged,
    Skipped { consecutive_failures: u32 },
}

pub struct Reconciler<R, C = SystemClock> {
    reader: R,
    clock: C,
    contract: Address,
    viewer: Address,
    window: TimeDelta,
    failure_threshold: u32,
    consecutive_failures: u32,
    view: watch::Sender<Option<ContractView>>,
    notices: Option<mpsc::UnboundedSender<PollNotice>>,
}

impl<R: ContractReader, C: Clock> Reconciler<R, C> {
    pub fn new(
        reader: R,
        clock: C,
        contract: Address,
        viewer: Address,
        config: &EscrowConfig,
    ) -> Self {
        let (view, _) = watch::channel(None);
        Self {
            reader,
            clock,
            contract,
            viewer,
            window: config.approval_window(),
            failure_threshold: config.failure_threshold.max(1),
            consecutive_failures: 0,
            view,
            notices: None,
        }
    }

    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<PollNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ContractView>> {
        self.view.subscribe()
    }

    /// Fetches, assesses and publishes. A failed read leaves the published
    /// view untouched.
    pub async fn tick(&mut self) -> TickOutcome {
        let snapshot = match self.fetch().await {
            Ok(snapshot) => snapshot,
            Err(message) => return self.record_failure(message),
        };
        if self.consecutive_failures >= self.failure_threshold {
            info!(contract = %self.contract, "contract reads recovered");
            self.notify(PollNotice::Recovered);
        }
        self.consecutive_failures = 0;

        let observed_at = self.clock.now();
        let assessment = determine_state(&snapshot, &self.viewer, observed_at, self.window);
        let next = ContractView {
            contract: self.contract,
            viewer: self.viewer,
            viewer_role: snapshot.role_of(&self.viewer),
            assessment,
            snapshot,
            observed_at,
        };

        // The stored view always carries the freshest snapshot; subscribers
        // are only woken when what they render changed.
        let changed = self.view.send_if_modified(|current| {
            let changed = match current {
                Some(previous) => !previous.renders_like(&next),
                None => true,
            };
            *current = Some(next);
            changed
        });
        if changed {
            debug!(contract = %self.contract, "contract view changed");
            TickOutcome::Rendered
        } else {
            TickOutcome::Unchanged
        }
    }

    async fn fetch(&self) -> std::result::Result<ContractSnapshot, String> {
        let snapshot = self
            .reader
            .contract_details(&self.contract)
            .await
            .map_err(|err| err.to_string())?;
        snapshot
            .validate()
            .map_err(|err| format!("malformed snapshot: {err}"))?;
        Ok(snapshot)
    }

    fn record_failure(&mut self, message: String) -> TickOutcome {
        self.consecutive_failures += 1;
        warn!(
            contract = %self.contract,
            consecutive = self.consecutive_failures,
            error = %message,
            "contract read failed, skipping tick"
        );
        if self.consecutive_failures == self.failure_threshold {
            self.notify(PollNotice::ReadFailing {
                consecutive: self.consecutive_failures,
                message: Error::TransientReadFailure(message).to_string(),
            });
        }
        TickOutcome::Skipped {
            consecutive_failures: self.consecutive_failures,
        }
    }

    fn notify(&self, notice: PollNotice) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(notice);
        }
    }
}

enum PollCommand {
    RefreshNow(oneshot::Sender<TickOutcome>),
    Shutdown,
}

/// Requests work from a running poll loop.
#[derive(Clone, Debug)]
pub struct PollHandle {
    commands: mpsc::UnboundedSender<PollCommand>,
}

impl PollHandle {
    /// Runs one tick inside the loop, after any tick already in progress.
    pub async fn refresh_now(&self) -> Result<TickOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(PollCommand::RefreshNow(reply))
            .map_err(|_| Error::PollerStopped)?;
        outcome.await.map_err(|_| Error::PollerStopped)
    }
}

/// Owner of the poll task. At most one loop runs per poller.
#[derive(Default)]
pub struct Poller {
    running: Option<(JoinHandle<()>, PollHandle)>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` and drops `reconciler` when a loop is already running.
    pub fn start<R, C>(&mut self, reconciler: Reconciler<R, C>, interval: Duration) -> bool
    where
        R: ContractReader + Send + Sync + 'static,
        C: Clock,
    {
        if self.is_running() {
            debug!("poll loop already running");
            return false;
        }
        let (commands, receiver) = mpsc::unbounded_channel();
        info!(contract = %reconciler.contract, ?interval, "starting poll loop");
        let task = tokio::spawn(poll_worker(reconciler, interval, receiver));
        self.running = Some((task, PollHandle { commands }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|(task, _)| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn handle(&self) -> Option<PollHandle> {
        self.running.as_ref().map(|(_, handle)| handle.clone())
    }

    pub fn stop(&mut self) {
        if let Some((task, handle)) = self.running.take() {
            let _ = handle.commands.send(PollCommand::Shutdown);
            task.abort();
            info!("poll loop stopped");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_worker<R, C>(
    mut reconciler: Reconciler<R, C>,
    interval: Duration,
    mut commands: mpsc::UnboundedReceiver<PollCommand>,
) where
    R: ContractReader + Send + Sync + 'static,
    C: Clock,
{
    let mut ticker = time::interval(interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconciler.tick().await;
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(PollCommand::RefreshNow(reply)) => {
                        let outcome = reconciler.tick().await;
                        let _ = reply.send(outcome);
                        ticker.reset();
                    }
                    Some(PollCommand::Shutdown) | None => break,
                }
            }
        }
    }
}
