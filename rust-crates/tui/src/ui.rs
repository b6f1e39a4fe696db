use crate::client::{
    AppSnapshot,
    Screen,
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        Event,
        EventStream,
        KeyCode,
        KeyEvent,
        KeyEventKind,
        KeyModifiers,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use escrow_core::{
    Action,
    Address,
    ContractState,
    TokenAmount,
    ViewerRole,
    dispatcher::ActionParams,
    poller::ContractView,
    wizard::{
        CreateWizard,
        WizardStep,
    },
};
use futures::StreamExt;
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::io::{
    Stdout,
    stdout,
};
use unicode_width::UnicodeWidthChar;

const MILESTONE_STEP: i16 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserEvent {
    Quit,
    Redraw,
    ConnectWallet,
    ShowManage,
    ShowCreate,
    Refresh,
    OpenContract(Address),
    Dispatch { action: Action, params: ActionParams },
    Wizard(WizardEvent),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WizardEvent {
    Input(char),
    Erase,
    Next,
    Back,
    AddMilestone,
    RemoveMilestone(usize),
    AdjustMilestone { index: usize, delta: i16 },
    Deploy,
    OpenDeployed,
    Restart,
}

pub struct UiState {
    mode: Mode,
    screen: Screen,
    actions: Vec<Action>,
    selected: usize,
    wizard_step: WizardStep,
    milestone_count: usize,
    milestone_idx: usize,
    terminal: Option<Terminal<CrosstermBackend<Stdout>>>,
}

impl Default for UiState {
    fn default() -> Self {
        UiState {
            mode: Mode::Normal,
            screen: Screen::Manage,
            actions: Vec::new(),
            selected: 0,
            wizard_step: WizardStep::default(),
            milestone_count: 0,
            milestone_idx: 0,
            terminal: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    AmountPrompt(AmountPrompt),
    ConfirmAction(Action),
    ContractPrompt(TextPrompt),
    QuitModal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct AmountPrompt {
    action: Action,
    input: String,
    error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct TextPrompt {
    input: String,
    error: Option<String>,
}

pub type InputEventReceiver = EventStream;

pub fn input_event_stream() -> InputEventReceiver {
    EventStream::new()
}

pub async fn next_raw_event(events: &mut InputEventReceiver) -> Result<Event> {
    match events.next().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input stream closed")),
    }
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(
        std::io::stdout(),
        crossterm::terminal::EnterAlternateScreen,
        crossterm::event::EnableMouseCapture
    )?;
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(
        std::io::stdout(),
        crossterm::event::DisableMouseCapture,
        crossterm::terminal::LeaveAlternateScreen
    )?;
    Ok(())
}

pub fn draw(state: &mut UiState, snap: &AppSnapshot) -> Result<()> {
    sync_state(state, snap);
    if let Some(mut term) = state.terminal.take() {
        term.draw(|f| ui(f, state, snap))?;
        state.terminal = Some(term);
    }
    Ok(())
}

/// Caches what key handling needs from the last rendered snapshot.
fn sync_state(state: &mut UiState, snap: &AppSnapshot) {
    if state.screen != snap.screen {
        state.mode = match state.mode {
            Mode::QuitModal => Mode::QuitModal,
            _ => Mode::Normal,
        };
        state.screen = snap.screen;
    }
    state.actions = snap
        .view
        .as_ref()
        .map(|view| view.assessment.legal_actions.clone())
        .unwrap_or_default();
    state.selected = state.selected.min(state.actions.len().saturating_sub(1));
    state.wizard_step = snap.wizard.step();
    state.milestone_count = snap.wizard.draft().milestones().len();
    state.milestone_idx = state
        .milestone_idx
        .min(state.milestone_count.saturating_sub(1));
}

pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let k = match event {
        Event::Key(k) if k.kind == KeyEventKind::Press => k,
        Event::Resize(..) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    if k.modifiers.contains(KeyModifiers::CONTROL) && k.code == KeyCode::Char('c') {
        return Some(UserEvent::Quit);
    }

    match &mut state.mode {
        Mode::QuitModal => match k.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => Some(UserEvent::Quit),
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            _ => None,
        },
        Mode::ConfirmAction(action) => match k.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
                let action = *action;
                state.mode = Mode::Normal;
                Some(UserEvent::Dispatch {
                    action,
                    params: ActionParams::default(),
                })
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            _ => None,
        },
        Mode::AmountPrompt(prompt) => match k.code {
            KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            KeyCode::Enter => {
                let action = prompt.action;
                let params = if prompt.input.is_empty() && action == Action::Deposit {
                    ActionParams::default()
                } else {
                    match TokenAmount::parse_decimal(&prompt.input) {
                        Ok(amount) => ActionParams::amount(amount),
                        Err(err) => {
                            prompt.error = Some(err.to_string());
                            return Some(UserEvent::Redraw);
                        }
                    }
                };
                state.mode = Mode::Normal;
                Some(UserEvent::Dispatch { action, params })
            }
            KeyCode::Backspace => {
                prompt.input.pop();
                prompt.error = None;
                Some(UserEvent::Redraw)
            }
            KeyCode::Char(c) if c.is_ascii_digit() || c == '.' => {
                prompt.input.push(c);
                prompt.error = None;
                Some(UserEvent::Redraw)
            }
            _ => None,
        },
        Mode::ContractPrompt(prompt) => match k.code {
            KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            KeyCode::Enter => match prompt.input.trim().parse::<Address>() {
                Ok(address) => {
                    state.mode = Mode::Normal;
                    Some(UserEvent::OpenContract(address))
                }
                Err(err) => {
                    prompt.error = Some(err.to_string());
                    Some(UserEvent::Redraw)
                }
            },
            KeyCode::Backspace => {
                prompt.input.pop();
                prompt.error = None;
                Some(UserEvent::Redraw)
            }
            KeyCode::Char(c) if !c.is_whitespace() => {
                prompt.input.push(c);
                prompt.error = None;
                Some(UserEvent::Redraw)
            }
            _ => None,
        },
        Mode::Normal => match state.screen {
            Screen::Manage => manage_key(state, k),
            Screen::Create => create_key(state, k),
        },
    }
}

fn manage_key(state: &mut UiState, k: KeyEvent) -> Option<UserEvent> {
    Some(match k.code {
        KeyCode::Char('q') | KeyCode::Esc => {
            state.mode = Mode::QuitModal;
            UserEvent::Redraw
        }
        KeyCode::Up | KeyCode::Char('k') => {
            state.selected = state.selected.saturating_sub(1);
            UserEvent::Redraw
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if state.selected + 1 < state.actions.len() {
                state.selected += 1;
            }
            UserEvent::Redraw
        }
        KeyCode::Enter => {
            let action = *state.actions.get(state.selected)?;
            if action.takes_amount() {
                state.mode = Mode::AmountPrompt(AmountPrompt {
                    action,
                    input: String::new(),
                    error: None,
                });
                UserEvent::Redraw
            } else if matches!(action, Action::Refund | Action::ClaimAfterDeadline) {
                state.mode = Mode::ConfirmAction(action);
                UserEvent::Redraw
            } else {
                UserEvent::Dispatch {
                    action,
                    params: ActionParams::default(),
                }
            }
        }
        KeyCode::Char('o') => {
            state.mode = Mode::ContractPrompt(TextPrompt::default());
            UserEvent::Redraw
        }
        KeyCode::Char('c') => UserEvent::ConnectWallet,
        KeyCode::Char('r') => UserEvent::Refresh,
        KeyCode::Char('n') => UserEvent::ShowCreate,
        _ => return None,
    })
}

fn create_key(state: &mut UiState, k: KeyEvent) -> Option<UserEvent> {
    let step = state.wizard_step;
    let text_step = matches!(
        step,
        WizardStep::Payee | WizardStep::Amount | WizardStep::Duration
    );
    if text_step {
        return Some(match k.code {
            KeyCode::Enter => UserEvent::Wizard(WizardEvent::Next),
            KeyCode::Esc if step == WizardStep::Payee => UserEvent::ShowManage,
            KeyCode::Esc => UserEvent::Wizard(WizardEvent::Back),
            KeyCode::Backspace => UserEvent::Wizard(WizardEvent::Erase),
            KeyCode::Char(c) if accepts_char(step, c) => UserEvent::Wizard(WizardEvent::Input(c)),
            _ => return None,
        });
    }

    let common = match k.code {
        KeyCode::Char('q') => {
            state.mode = Mode::QuitModal;
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('m') => Some(UserEvent::ShowManage),
        KeyCode::Char('c') => Some(UserEvent::ConnectWallet),
        _ => None,
    };
    if common.is_some() {
        return common;
    }

    let index = state.milestone_idx;
    let adjust = |delta| UserEvent::Wizard(WizardEvent::AdjustMilestone { index, delta });
    Some(match (step, k.code) {
        (WizardStep::Milestones, KeyCode::Up | KeyCode::Char('k')) => {
            state.milestone_idx = state.milestone_idx.saturating_sub(1);
            UserEvent::Redraw
        }
        (WizardStep::Milestones, KeyCode::Down | KeyCode::Char('j')) => {
            if state.milestone_idx + 1 < state.milestone_count {
                state.milestone_idx += 1;
            }
            UserEvent::Redraw
        }
        (WizardStep::Milestones, KeyCode::Right) => adjust(1),
        (WizardStep::Milestones, KeyCode::Left) => adjust(-1),
        (WizardStep::Milestones, KeyCode::Char('+')) => adjust(MILESTONE_STEP),
        (WizardStep::Milestones, KeyCode::Char('-')) => adjust(-MILESTONE_STEP),
        (WizardStep::Milestones, KeyCode::Char('a')) => UserEvent::Wizard(WizardEvent::AddMilestone),
        (WizardStep::Milestones, KeyCode::Char('x') | KeyCode::Delete) => {
            UserEvent::Wizard(WizardEvent::RemoveMilestone(index))
        }
        (WizardStep::Milestones, KeyCode::Enter) => UserEvent::Wizard(WizardEvent::Next),
        (WizardStep::Milestones | WizardStep::Review, KeyCode::Esc) => {
            UserEvent::Wizard(WizardEvent::Back)
        }
        (WizardStep::Review, KeyCode::Enter | KeyCode::Char('d')) => {
            UserEvent::Wizard(WizardEvent::Deploy)
        }
        (WizardStep::Success, KeyCode::Enter | KeyCode::Char('o')) => {
            UserEvent::Wizard(WizardEvent::OpenDeployed)
        }
        (WizardStep::Success, KeyCode::Char('n')) => UserEvent::Wizard(WizardEvent::Restart),
        _ => return None,
    })
}

fn accepts_char(step: WizardStep, c: char) -> bool {
    match step {
        WizardStep::Amount => c.is_ascii_digit() || c == '.',
        WizardStep::Duration => c.is_ascii_digit(),
        _ => !c.is_whitespace() && !c.is_control(),
    }
}

fn ui(f: &mut Frame, state: &UiState, snap: &AppSnapshot) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // wallet + network
            Constraint::Min(14),   // screen body
            Constraint::Length(6), // status/errors
            Constraint::Length(3), // help
        ])
        .split(f.area());

    draw_header(f, chunks[0], snap);
    match snap.screen {
        Screen::Manage => draw_manage(f, state, chunks[1], snap),
        Screen::Create => draw_create(f, state, chunks[1], snap),
    }
    draw_status(f, chunks[2], snap);
    draw_help(f, chunks[3], snap);
    draw_modals(f, state, snap);
}

fn draw_header(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let wallet = match (&snap.session, snap.connecting) {
        (_, true) => "connecting...".to_string(),
        (Some(session), false) => format!("{} (chain {})", session.address.short(), session.chain_id),
        (None, false) => "not connected (c to connect)".to_string(),
    };
    let screen = match snap.screen {
        Screen::Manage => "Manage",
        Screen::Create => "Create",
    };
    let text = format!("Network: {} | Wallet: {} | {}", snap.network, wallet, screen);
    let widget = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title("Escrow"));
    f.render_widget(widget, area);
}

fn draw_manage(f: &mut Frame, state: &UiState, area: Rect, snap: &AppSnapshot) {
    let Some(view) = snap.view.as_ref().filter(|v| Some(v.contract) == snap.contract) else {
        let text = match (snap.contract, snap.session) {
            (None, _) => "No contract open. Press o to open one or n to create one.".to_string(),
            (Some(contract), None) => {
                format!("Contract {contract}\nConnect a wallet (c) to load it.")
            }
            (Some(contract), Some(_)) => format!("Loading contract {contract}..."),
        };
        let widget = Paragraph::new(text)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Contract"));
        f.render_widget(widget, area);
        return;
    };

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);
    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Min(3)])
        .split(columns[0]);
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(3)])
        .split(columns[1]);

    draw_contract_panel(f, left[0], view, snap);
    draw_milestones_panel(f, left[1], view);
    draw_state_panel(f, right[0], view, snap);
    draw_actions_panel(f, state, right[1], snap);
}

fn role_marker(view: &ContractView, role: ViewerRole) -> &'static str {
    if view.viewer_role == role { " (you)" } else { "" }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn draw_contract_panel(f: &mut Frame, area: Rect, view: &ContractView, snap: &AppSnapshot) {
    let s = &view.snapshot;
    let deadline_note = if s.deadline_passed(view.observed_at) {
        " (passed)"
    } else {
        ""
    };
    let lines = vec![
        Line::from(format!("Contract: {}", view.contract)),
        Line::from(format!("Payer: {}{}", s.payer, role_marker(view, ViewerRole::Payer))),
        Line::from(format!("Payee: {}{}", s.payee, role_marker(view, ViewerRole::Payee))),
        Line::from(format!(
            "Amount: {} USDC | Remaining: {} USDC",
            s.amount, s.remaining_amount
        )),
        Line::from(format!(
            "Deadline: {}{}",
            s.deadline.format("%Y-%m-%d %H:%M UTC"),
            deadline_note
        )),
        Line::from(format!(
            "Platform fee: {} USDC to {} paid: {} | Deposited: {}",
            snap.platform_fee,
            snap.fee_recipient.short(),
            yes_no(s.platform_fee_paid),
            yes_no(s.deposited)
        )),
        Line::from(format!(
            "Confirmed: payer {} | payee {}",
            yes_no(s.confirmed_payer),
            yes_no(s.confirmed_payee)
        )),
    ];
    let widget = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Contract"));
    f.render_widget(widget, area);
}

fn draw_milestones_panel(f: &mut Frame, area: Rect, view: &ContractView) {
    let lines: Vec<Line> = view
        .snapshot
        .milestones
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let (label, style) = if m.released {
                ("released", Style::default().fg(Color::Green))
            } else {
                ("pending", Style::default())
            };
            Line::styled(format!("{}. {:>3}% {}", i + 1, m.percentage, label), style)
        })
        .collect();
    let widget = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Milestones"));
    f.render_widget(widget, area);
}

fn state_style(state: &ContractState) -> Style {
    match state {
        ContractState::Closed(_) => Style::default().fg(Color::DarkGray),
        ContractState::CancelPending { .. } | ContractState::SettlementPending { .. } => {
            Style::default().fg(Color::Yellow)
        }
        ContractState::Active => Style::default().fg(Color::Green),
        _ => Style::default().fg(Color::Cyan),
    }
}

fn draw_state_panel(f: &mut Frame, area: Rect, view: &ContractView, snap: &AppSnapshot) {
    let state = &view.assessment.state;
    let polling = if snap.polling { "live" } else { "paused" };
    let lines = vec![
        Line::styled(state.to_string(), state_style(state)),
        Line::from(format!(
            "Updated {} ({polling})",
            view.observed_at.format("%H:%M:%S")
        )),
    ];
    let widget = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("State"));
    f.render_widget(widget, area);
}

fn draw_actions_panel(f: &mut Frame, state: &UiState, area: Rect, snap: &AppSnapshot) {
    let title = match snap.in_flight {
        Some(action) => format!("Actions (waiting for {action})"),
        None => "Actions".to_string(),
    };
    let mut lines = Vec::new();
    if state.actions.is_empty() {
        lines.push(Line::from("No actions available"));
    }
    for (i, action) in state.actions.iter().enumerate() {
        let cur = if i == state.selected { ">" } else { " " };
        let text = format!("{cur} {action}");
        if snap.in_flight.is_some() {
            lines.push(Line::styled(text, Style::default().fg(Color::DarkGray)));
        } else if i == state.selected {
            lines.push(Line::styled(text, Style::default().add_modifier(Modifier::BOLD)));
        } else {
            lines.push(Line::from(text));
        }
    }
    let widget =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(widget, area);
}

fn draw_create(f: &mut Frame, state: &UiState, area: Rect, snap: &AppSnapshot) {
    let wizard = &snap.wizard;
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(8)])
        .split(area);

    let step = wizard.step();
    let form_steps = WizardStep::ALL.len() - 1;
    let label = if step == WizardStep::Success {
        step.title().to_string()
    } else {
        format!("Step {} of {}: {}", step.index() + 1, form_steps, step.title())
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("New Escrow"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(u16::from(wizard.progress_percent()))
        .label(label);
    f.render_widget(gauge, rows[0]);

    let width = rows[1].width.saturating_sub(4) as usize;
    let lines = match step {
        WizardStep::Payee => input_lines(
            "Payee address (0x...)",
            &wizard.draft().payee_address,
            step_hint(wizard, step),
            width,
        ),
        WizardStep::Amount => input_lines(
            "Amount (USDC)",
            &wizard.draft().amount,
            step_hint(wizard, step),
            width,
        ),
        WizardStep::Duration => input_lines(
            "Duration in days (1-365)",
            &wizard.draft().duration_days,
            step_hint(wizard, step),
            width,
        ),
        WizardStep::Milestones => milestone_lines(state, wizard),
        WizardStep::Review => review_lines(snap),
        WizardStep::Success => success_lines(wizard),
    };
    let widget = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title(step.title()));
    f.render_widget(widget, rows[1]);
}

fn step_hint(wizard: &CreateWizard, step: WizardStep) -> Option<String> {
    wizard.validate_step(step).err().map(|err| err.to_string())
}

fn input_lines(
    label: &str,
    value: &str,
    hint: Option<String>,
    width: usize,
) -> Vec<Line<'static>> {
    let mut lines = vec![
        Line::from(label.to_string()),
        Line::from(format!("> {}_", tail_to_width(value, width.saturating_sub(3)))),
        Line::from(""),
    ];
    if let Some(hint) = hint.filter(|_| !value.is_empty()) {
        lines.push(Line::styled(hint, Style::default().fg(Color::DarkGray)));
    }
    lines.push(Line::from("Enter=next Esc=back"));
    lines
}

/// Keeps the end of `text` that fits in `width` terminal columns.
fn tail_to_width(text: &str, width: usize) -> String {
    let mut used = 0;
    let mut kept: Vec<char> = Vec::new();
    for c in text.chars().rev() {
        let w = c.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        used += w;
        kept.push(c);
    }
    kept.into_iter().rev().collect()
}

fn milestone_lines(state: &UiState, wizard: &CreateWizard) -> Vec<Line<'static>> {
    let draft = wizard.draft();
    let mut lines = Vec::new();
    for (i, percentage) in draft.milestones().iter().enumerate() {
        let cur = if i == state.milestone_idx { ">" } else { " " };
        lines.push(Line::from(format!("{cur} Milestone {}: {percentage}%", i + 1)));
    }
    let total = draft.milestone_total();
    let total_style = if total == 100 {
        Style::default().fg(Color::Green)
    } else {
        Style::default().fg(Color::Red)
    };
    lines.push(Line::from(""));
    lines.push(Line::styled(format!("Total: {total}% (must be 100%)"), total_style));
    lines.push(Line::from(
        "↑/↓ select ←/→ ±1 +/- ±5 a add x remove Enter=next Esc=back",
    ));
    lines
}

fn review_lines(snap: &AppSnapshot) -> Vec<Line<'static>> {
    let wizard = &snap.wizard;
    let draft = wizard.draft();
    let payer = snap
        .session
        .map(|s| s.address.to_string())
        .unwrap_or_else(|| "connect a wallet (c)".to_string());
    let milestones = draft
        .milestones()
        .iter()
        .map(|p| format!("{p}%"))
        .collect::<Vec<_>>()
        .join(" / ");
    let mut lines = vec![
        Line::from(format!("Payer: {payer}")),
        Line::from(format!("Payee: {}", draft.payee_address)),
        Line::from(format!("Amount: {} USDC", draft.amount)),
        Line::from(format!("Duration: {} days", draft.duration_days)),
        Line::from(format!("Milestones: {milestones}")),
        Line::from(format!(
            "Each party pays a {} USDC platform fee before funding.",
            snap.platform_fee
        )),
        Line::from(""),
    ];
    if wizard.is_deploying() {
        lines.push(Line::styled(
            "Deploying... confirm in your wallet",
            Style::default().fg(Color::Yellow),
        ));
    } else if let Some(hint) = step_hint(wizard, WizardStep::Review) {
        lines.push(Line::styled(hint, Style::default().fg(Color::Red)));
    } else {
        lines.push(Line::from("Enter=deploy Esc=back"));
    }
    lines
}

fn success_lines(wizard: &CreateWizard) -> Vec<Line<'static>> {
    let Some(deployed) = wizard.deployed() else {
        return vec![Line::from("Nothing deployed yet")];
    };
    vec![
        Line::styled(
            format!("Escrow deployed at {}", deployed.deployment.contract_address),
            Style::default().fg(Color::Green),
        ),
        Line::from(format!("Transaction: {}", deployed.deployment.tx_hash)),
        Line::from(format!(
            "Payee {} | {} USDC",
            deployed.request.payee, deployed.request.amount
        )),
        Line::from(""),
        Line::from("Enter=manage this escrow n=create another"),
    ]
}

fn draw_status(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let status_widget = if snap.errors.is_empty() {
        let mut lines: Vec<Line> = Vec::new();
        if snap.status.trim().is_empty() {
            lines.push(Line::from("Ready"));
        } else {
            for line in snap.status.lines() {
                lines.push(Line::from(line.to_string()));
            }
        }
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Status"))
            .style(Style::default().fg(Color::Green))
    } else {
        let visible = area.height.saturating_sub(2) as usize;
        let skip = snap.errors.len().saturating_sub(visible);
        let lines: Vec<Line> = snap.errors[skip..]
            .iter()
            .map(|e| Line::from(e.clone()))
            .collect();
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Errors"))
            .style(Style::default().fg(Color::Red))
    };
    f.render_widget(status_widget, area);
}

fn draw_help(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let text = match (snap.screen, snap.wizard.step()) {
        (Screen::Manage, _) => {
            "↑/↓ select | Enter act | r refresh | o open | n new escrow | c connect | q/Esc quit"
        }
        (Screen::Create, WizardStep::Payee) => "type to edit | Enter next | Esc back to manage",
        (Screen::Create, WizardStep::Amount | WizardStep::Duration) => {
            "type to edit | Enter next | Esc back"
        }
        (Screen::Create, _) => "m manage | c connect | q quit",
    };
    let help = Paragraph::new(text).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, area);
}

fn draw_modals(f: &mut Frame, state: &UiState, snap: &AppSnapshot) {
    match &state.mode {
        Mode::AmountPrompt(prompt) => {
            let area = centered_rect(50, 30, f.area());
            let block = Block::default()
                .borders(Borders::ALL)
                .title(prompt.action.to_string());
            let mut lines = vec![Line::from(format!("Amount (USDC): {}_", prompt.input))];
            if let Some(view) = &snap.view {
                let hint = if prompt.action == Action::Deposit {
                    format!("Empty = full amount ({} USDC)", view.snapshot.amount)
                } else {
                    format!("At most {} USDC", view.snapshot.remaining_amount)
                };
                lines.push(Line::from(hint));
            }
            if let Some(error) = &prompt.error {
                lines.push(Line::styled(error.clone(), Style::default().fg(Color::Red)));
            }
            lines.push(Line::from("Enter=confirm Esc=cancel"));
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(Paragraph::new(lines), block.inner(area));
        }
        Mode::ConfirmAction(action) => {
            let area = centered_rect(40, 20, f.area());
            let block = Block::default().borders(Borders::ALL).title("Confirm");
            let p = Paragraph::new(format!("{action}? This cannot be undone. (Y/N)"))
                .wrap(Wrap { trim: false });
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(p, block.inner(area));
        }
        Mode::ContractPrompt(prompt) => {
            let area = centered_rect(60, 25, f.area());
            let block = Block::default()
                .borders(Borders::ALL)
                .title("Open Contract");
            let mut lines = vec![Line::from(format!("Address: {}_", prompt.input))];
            if let Some(error) = &prompt.error {
                lines.push(Line::styled(error.clone(), Style::default().fg(Color::Red)));
            }
            lines.push(Line::from("Enter=open Esc=cancel"));
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(Paragraph::new(lines), block.inner(area));
        }
        Mode::QuitModal => {
            let area = centered_rect(40, 20, f.area());
            let block = Block::default().borders(Borders::ALL).title("Confirm Quit");
            let p = Paragraph::new("Quit? (Y/N)");
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(p, block.inner(area));
        }
        Mode::Normal => {}
    }
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::client::tests::app_snapshot;
    use escrow_core::{
        determine_state,
        test_helpers::{
            ALICE,
            ESCROW,
            funded_snapshot,
            t0,
            window,
        },
    };
    use ratatui::backend::TestBackend;

    fn key(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn manage_state(actions: Vec<Action>) -> UiState {
        UiState {
            actions,
            ..UiState::default()
        }
    }

    fn create_state(step: WizardStep) -> UiState {
        UiState {
            screen: Screen::Create,
            wizard_step: step,
            milestone_count: 2,
            ..UiState::default()
        }
    }

    fn rendered(state: &UiState, snap: &AppSnapshot) -> String {
        let mut terminal = Terminal::new(TestBackend::new(120, 40)).unwrap();
        terminal.draw(|f| ui(f, state, snap)).unwrap();
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn interpret_event__enter_on_plain_action__dispatches_it() {
        // given
        let mut state = manage_state(vec![Action::ReleaseMilestone(0), Action::ApproveCancel]);
        interpret_event(&mut state, key(KeyCode::Down));

        // when
        let event = interpret_event(&mut state, key(KeyCode::Enter));

        // then
        assert_eq!(
            event,
            Some(UserEvent::Dispatch {
                action: Action::ApproveCancel,
                params: ActionParams::default(),
            })
        );
    }

    #[test]
    fn interpret_event__refund__asks_for_confirmation_first() {
        // given
        let mut state = manage_state(vec![Action::Refund]);

        // when
        let first = interpret_event(&mut state, key(KeyCode::Enter));
        let second = interpret_event(&mut state, key(KeyCode::Char('y')));

        // then
        assert_eq!(first, Some(UserEvent::Redraw));
        assert_eq!(
            second,
            Some(UserEvent::Dispatch {
                action: Action::Refund,
                params: ActionParams::default(),
            })
        );
        assert_eq!(state.mode, Mode::Normal);
    }

    #[test]
    fn interpret_event__declined_confirmation__dispatches_nothing() {
        // given
        let mut state = manage_state(vec![Action::ClaimAfterDeadline]);
        interpret_event(&mut state, key(KeyCode::Enter));

        // when
        let event = interpret_event(&mut state, key(KeyCode::Char('n')));

        // then
        assert_eq!(event, Some(UserEvent::Redraw));
        assert_eq!(state.mode, Mode::Normal);
    }

    #[test]
    fn interpret_event__settlement_prompt__parses_decimal_amount() {
        // given
        let mut state = manage_state(vec![Action::ProposeSettlement]);
        interpret_event(&mut state, key(KeyCode::Enter));

        // when
        for c in "12.5".chars() {
            interpret_event(&mut state, key(KeyCode::Char(c)));
        }
        let event = interpret_event(&mut state, key(KeyCode::Enter));

        // then
        assert_eq!(
            event,
            Some(UserEvent::Dispatch {
                action: Action::ProposeSettlement,
                params: ActionParams::amount(TokenAmount::from_units(12_500_000)),
            })
        );
    }

    #[test]
    fn interpret_event__empty_deposit_prompt__uses_default_amount() {
        // given
        let mut state = manage_state(vec![Action::Deposit]);
        interpret_event(&mut state, key(KeyCode::Enter));

        // when
        let event = interpret_event(&mut state, key(KeyCode::Enter));

        // then
        assert_eq!(
            event,
            Some(UserEvent::Dispatch {
                action: Action::Deposit,
                params: ActionParams::default(),
            })
        );
    }

    #[test]
    fn interpret_event__empty_settlement_prompt__stays_open_with_error() {
        // given
        let mut state = manage_state(vec![Action::ProposeSettlement]);
        interpret_event(&mut state, key(KeyCode::Enter));

        // when
        let event = interpret_event(&mut state, key(KeyCode::Enter));

        // then
        assert_eq!(event, Some(UserEvent::Redraw));
        let Mode::AmountPrompt(prompt) = &state.mode else {
            panic!("expected amount prompt, got {:?}", state.mode);
        };
        assert!(prompt.error.is_some());
    }

    #[test]
    fn interpret_event__contract_prompt__opens_parsed_address() {
        // given
        let mut state = manage_state(Vec::new());
        interpret_event(&mut state, key(KeyCode::Char('o')));

        // when
        for c in ESCROW.to_string().chars() {
            interpret_event(&mut state, key(KeyCode::Char(c)));
        }
        let event = interpret_event(&mut state, key(KeyCode::Enter));

        // then
        assert_eq!(event, Some(UserEvent::OpenContract(ESCROW)));
    }

    #[test]
    fn interpret_event__no_actions__enter_is_ignored() {
        let mut state = manage_state(Vec::new());
        assert_eq!(interpret_event(&mut state, key(KeyCode::Enter)), None);
    }

    #[test]
    fn interpret_event__text_step__captures_command_letters() {
        // given
        let mut state = create_state(WizardStep::Payee);

        // when
        let event = interpret_event(&mut state, key(KeyCode::Char('c')));

        // then
        assert_eq!(event, Some(UserEvent::Wizard(WizardEvent::Input('c'))));
    }

    #[test]
    fn interpret_event__amount_step__ignores_letters() {
        let mut state = create_state(WizardStep::Amount);
        assert_eq!(interpret_event(&mut state, key(KeyCode::Char('x'))), None);
        assert_eq!(
            interpret_event(&mut state, key(KeyCode::Char('.'))),
            Some(UserEvent::Wizard(WizardEvent::Input('.')))
        );
    }

    #[test]
    fn interpret_event__milestone_step__adjusts_selected_milestone() {
        // given
        let mut state = create_state(WizardStep::Milestones);
        interpret_event(&mut state, key(KeyCode::Down));

        // when
        let event = interpret_event(&mut state, key(KeyCode::Char('-')));

        // then
        assert_eq!(
            event,
            Some(UserEvent::Wizard(WizardEvent::AdjustMilestone {
                index: 1,
                delta: -MILESTONE_STEP,
            }))
        );
    }

    #[test]
    fn interpret_event__review_enter__deploys() {
        let mut state = create_state(WizardStep::Review);
        assert_eq!(
            interpret_event(&mut state, key(KeyCode::Enter)),
            Some(UserEvent::Wizard(WizardEvent::Deploy))
        );
    }

    #[test]
    fn interpret_event__ctrl_c__quits_from_any_mode() {
        // given
        let mut state = manage_state(vec![Action::ProposeSettlement]);
        interpret_event(&mut state, key(KeyCode::Enter));

        // when
        let event = interpret_event(
            &mut state,
            Event::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
        );

        // then
        assert_eq!(event, Some(UserEvent::Quit));
    }

    #[test]
    fn sync_state__leaving_manage__closes_prompt_and_clamps_selection() {
        // given
        let mut state = manage_state(vec![Action::Refund, Action::ApproveCancel]);
        state.selected = 1;
        state.mode = Mode::ConfirmAction(Action::Refund);
        let mut snap = app_snapshot();
        snap.screen = Screen::Create;

        // when
        sync_state(&mut state, &snap);

        // then
        assert_eq!(state.mode, Mode::Normal);
        assert_eq!(state.screen, Screen::Create);
        assert!(state.actions.is_empty());
        assert_eq!(state.selected, 0);
        assert_eq!(state.milestone_count, 2);
    }

    #[test]
    fn ui__manage_screen__shows_state_and_legal_actions() {
        // given
        let snapshot = funded_snapshot(&[50, 50]);
        let assessment = determine_state(&snapshot, &ALICE, t0(), window());
        let mut snap = app_snapshot();
        snap.view = Some(ContractView {
            contract: ESCROW,
            viewer: ALICE,
            viewer_role: ViewerRole::Payer,
            assessment,
            snapshot,
            observed_at: t0(),
        });
        let mut state = UiState::default();
        sync_state(&mut state, &snap);

        // when
        let screen = rendered(&state, &snap);

        // then
        assert!(screen.contains("Release milestone 1"), "{screen}");
        assert!(screen.contains("(you)"));
        assert!(screen.contains("Milestones"));
    }

    #[test]
    fn ui__manage_screen__shows_fee_recipient() {
        // given
        let snapshot = funded_snapshot(&[100]);
        let assessment = determine_state(&snapshot, &ALICE, t0(), window());
        let mut snap = app_snapshot();
        snap.fee_recipient = ESCROW;
        snap.view = Some(ContractView {
            contract: ESCROW,
            viewer: ALICE,
            viewer_role: ViewerRole::Payer,
            assessment,
            snapshot,
            observed_at: t0(),
        });
        let mut state = UiState::default();
        sync_state(&mut state, &snap);

        // when
        let screen = rendered(&state, &snap);

        // then
        assert!(
            screen.contains(&format!("1 USDC to {}", ESCROW.short())),
            "{screen}"
        );
    }

    #[test]
    fn ui__create_screen__shows_progress_label() {
        // given
        let mut snap = app_snapshot();
        snap.screen = Screen::Create;
        let mut state = UiState::default();
        sync_state(&mut state, &snap);

        // when
        let screen = rendered(&state, &snap);

        // then
        assert!(screen.contains("Step 1 of 5"), "{screen}");
    }

    #[test]
    fn tail_to_width__keeps_the_end() {
        assert_eq!(tail_to_width("0xabcdef", 4), "cdef");
        assert_eq!(tail_to_width("abc", 10), "abc");
    }
}
