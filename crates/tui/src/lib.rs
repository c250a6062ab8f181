pub mod client;

use std::io::{self, Stdout};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use mend_core::attempt_history::{TrialOutcome, TrialRecord};
use mend_core::diagnostics::{ActionReport, Diagnostics};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use ratatui::{Frame, Terminal};
use thiserror::Error;

use crate::client::{ConsoleClient, ConsoleError};

const TICK_RATE: Duration = Duration::from_millis(120);
const REFRESH_EVERY_TICKS: u16 = 25;
const ATTEMPTS_SHOWN: usize = 12;

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Browse,
    EditOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Msg {
    Quit,
    ToggleHelp,
    Refresh,
    Retry,
    EditOverride,
    Input(char),
    Backspace,
    Submit,
    Cancel,
    Tick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    FetchDiagnostics,
    SubmitOverride(String),
    Retry,
}

#[derive(Debug)]
enum Reply {
    Diagnostics(Result<Diagnostics, ConsoleError>),
    Action(Result<ActionReport, ConsoleError>),
}

#[derive(Debug)]
struct ConsoleApp {
    server: String,
    mode: Mode,
    diagnostics: Option<Diagnostics>,
    override_input: String,
    show_help: bool,
    should_quit: bool,
    fetch_in_flight: bool,
    action_in_flight: bool,
    ticks_since_refresh: u16,
    status_line: String,
}

impl ConsoleApp {
    fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            mode: Mode::Browse,
            diagnostics: None,
            override_input: String::new(),
            show_help: false,
            should_quit: false,
            fetch_in_flight: false,
            action_in_flight: false,
            ticks_since_refresh: 0,
            status_line: "Loading diagnostics...".to_string(),
        }
    }

    fn handle(&mut self, msg: Msg) -> Option<Request> {
        match msg {
            Msg::Quit => {
                self.should_quit = true;
                None
            }
            Msg::ToggleHelp => {
                self.show_help = !self.show_help;
                None
            }
            Msg::Refresh => self.fetch(),
            Msg::Retry => {
                if self.action_in_flight {
                    self.status_line = "A resolution request is already running".to_string();
                    return None;
                }
                self.action_in_flight = true;
                self.status_line = "Retrying connection...".to_string();
                Some(Request::Retry)
            }
            Msg::EditOverride => {
                self.mode = Mode::EditOverride;
                self.status_line = "Enter a connection URL and press Enter".to_string();
                None
            }
            Msg::Input(ch) => {
                self.override_input.push(ch);
                None
            }
            Msg::Backspace => {
                self.override_input.pop();
                None
            }
            Msg::Cancel => {
                self.mode = Mode::Browse;
                self.status_line = "Override edit cancelled".to_string();
                None
            }
            Msg::Submit => self.submit_override(),
            Msg::Tick => {
                self.ticks_since_refresh = self.ticks_since_refresh.saturating_add(1);
                if self.ticks_since_refresh >= REFRESH_EVERY_TICKS {
                    return self.fetch();
                }
                None
            }
        }
    }

    fn fetch(&mut self) -> Option<Request> {
        self.ticks_since_refresh = 0;
        if self.fetch_in_flight {
            return None;
        }
        self.fetch_in_flight = true;
        Some(Request::FetchDiagnostics)
    }

    fn submit_override(&mut self) -> Option<Request> {
        let url = self.override_input.trim().to_string();
        if url.is_empty() {
            self.status_line = "URL is required".to_string();
            return None;
        }
        if self.action_in_flight {
            self.status_line = "A resolution request is already running".to_string();
            return None;
        }

        self.mode = Mode::Browse;
        self.action_in_flight = true;
        self.status_line = "Testing connection...".to_string();
        Some(Request::SubmitOverride(url))
    }

    fn apply(&mut self, reply: Reply) -> Option<Request> {
        match reply {
            Reply::Diagnostics(result) => {
                self.fetch_in_flight = false;
                match result {
                    Ok(diagnostics) => {
                        if !self.action_in_flight {
                            self.status_line = summary_line(&diagnostics);
                        }
                        self.diagnostics = Some(diagnostics);
                    }
                    Err(error) => self.status_line = format!("Diagnostics unavailable: {error}"),
                }
                None
            }
            Reply::Action(result) => {
                self.action_in_flight = false;
                match result {
                    Ok(report) => {
                        self.status_line = match report.error {
                            Some(error) if !report.connected => {
                                format!("{} ({error})", report.message)
                            }
                            _ => report.message,
                        };
                        if report.connected {
                            self.override_input.clear();
                        }
                    }
                    Err(error) => self.status_line = format!("Request failed: {error}"),
                }
                self.fetch()
            }
        }
    }
}

fn summary_line(diagnostics: &Diagnostics) -> String {
    if diagnostics.connected {
        format!(
            "Connected via {}",
            diagnostics.strategy.as_deref().unwrap_or("unknown candidate")
        )
    } else {
        format!(
            "Disconnected: {}",
            diagnostics.error.as_deref().unwrap_or("no error reported")
        )
    }
}

struct Dispatcher {
    runtime: tokio::runtime::Runtime,
    client: ConsoleClient,
    replies: Sender<Reply>,
}

impl Dispatcher {
    fn dispatch(&self, request: Request) {
        let client = self.client.clone();
        let replies = self.replies.clone();
        self.runtime.spawn(async move {
            let reply = match request {
                Request::FetchDiagnostics => Reply::Diagnostics(client.diagnostics().await),
                Request::SubmitOverride(url) => {
                    Reply::Action(client.submit_override(&url).await)
                }
                Request::Retry => Reply::Action(client.retry().await),
            };
            // The receiver is gone once the console has quit.
            let _ = replies.send(reply);
        });
    }
}

pub fn run(server_url: &str) -> Result<(), TuiError> {
    let client = ConsoleClient::new(server_url)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    let (replies, inbox) = mpsc::channel();
    let dispatcher = Dispatcher {
        runtime,
        client,
        replies,
    };

    let mut terminal = setup_terminal()?;
    let run_result = run_loop(&mut terminal, &dispatcher, &inbox, server_url);
    let restore_result = restore_terminal(&mut terminal);

    if let Err(error) = run_result {
        restore_result?;
        return Err(error);
    }

    restore_result?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), TuiError> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    dispatcher: &Dispatcher,
    inbox: &Receiver<Reply>,
    server_url: &str,
) -> Result<(), TuiError> {
    let mut app = ConsoleApp::new(server_url);
    if let Some(request) = app.fetch() {
        dispatcher.dispatch(request);
    }
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|frame| render(frame, &app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(request) = map_key_event(key, app.mode).and_then(|m| app.handle(m))
                    {
                        dispatcher.dispatch(request);
                    }
                }
            }
        }

        while let Ok(reply) = inbox.try_recv() {
            if let Some(request) = app.apply(reply) {
                dispatcher.dispatch(request);
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            if let Some(request) = app.handle(Msg::Tick) {
                dispatcher.dispatch(request);
            }
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn render(frame: &mut Frame<'_>, app: &ConsoleApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(4),
        ])
        .split(frame.area());

    let (state_label, state_color) = match &app.diagnostics {
        Some(diagnostics) if diagnostics.connected => ("CONNECTED", Color::Green),
        Some(_) => ("DISCONNECTED", Color::Red),
        None => ("UNKNOWN", Color::DarkGray),
    };
    let diagnostics = app.diagnostics.as_ref();
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            format!(" {state_label} "),
            Style::default()
                .fg(state_color)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | "),
        Span::raw(format!(
            "Strategy: {}",
            diagnostics
                .and_then(|d| d.strategy.as_deref())
                .unwrap_or("-")
        )),
        Span::raw(" | "),
        Span::raw(format!(
            "Override: {}",
            if diagnostics.is_some_and(|d| d.manual_override_set) {
                "set"
            } else {
                "none"
            }
        )),
        Span::raw(" | "),
        Span::raw(format!(
            "Runs: {}{}",
            diagnostics.map_or(0, |d| d.runs),
            if diagnostics.is_some_and(|d| d.resolving) {
                " (resolving)"
            } else {
                ""
            }
        )),
        Span::raw(" | "),
        Span::raw(format!("Server: {}", app.server)),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("Database Connection"),
    );
    frame.render_widget(header, chunks[0]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[1]);

    let candidates = Paragraph::new(candidate_lines(diagnostics))
        .block(Block::default().borders(Borders::ALL).title("Candidates"))
        .alignment(Alignment::Left);
    frame.render_widget(candidates, body[0]);

    let attempts = Paragraph::new(attempt_lines(diagnostics))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Recent Attempts"),
        )
        .alignment(Alignment::Left);
    frame.render_widget(attempts, body[1]);

    let input_line = match app.mode {
        Mode::EditOverride => Line::from(vec![
            Span::styled("URL> ", Style::default().fg(Color::Yellow)),
            Span::raw(app.override_input.as_str()),
            Span::styled("_", Style::default().add_modifier(Modifier::SLOW_BLINK)),
        ]),
        Mode::Browse => Line::from("e: set override | r: retry | g: refresh | ?: help | q: quit"),
    };
    let footer = Paragraph::new(vec![
        input_line,
        Line::from(format!("Status: {}", app.status_line)),
    ])
    .block(Block::default().borders(Borders::ALL).title("Manual Override"));
    frame.render_widget(footer, chunks[2]);

    if app.show_help {
        render_help_popup(frame);
    }
}

fn candidate_lines(diagnostics: Option<&Diagnostics>) -> Vec<Line<'static>> {
    let Some(diagnostics) = diagnostics else {
        return vec![Line::from("Waiting for server...")];
    };
    if diagnostics.candidate_names.is_empty() {
        return vec![Line::from("No candidates configured")];
    }

    diagnostics
        .candidate_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let active = diagnostics.strategy.as_deref() == Some(name.as_str());
            let marker = if active { ">" } else { " " };
            let style = if active {
                Style::default().fg(Color::Green)
            } else {
                Style::default()
            };
            Line::styled(format!("{marker} {:>2}. {name}", index + 1), style)
        })
        .collect()
}

fn attempt_lines(diagnostics: Option<&Diagnostics>) -> Vec<Line<'static>> {
    let records = diagnostics.map_or(&[][..], |d| d.recent_attempts.as_slice());
    if records.is_empty() {
        return vec![Line::from("No attempts recorded")];
    }

    records
        .iter()
        .rev()
        .take(ATTEMPTS_SHOWN)
        .map(attempt_line)
        .collect()
}

fn attempt_line(record: &TrialRecord) -> Line<'static> {
    let (label, color) = match record.outcome {
        TrialOutcome::Succeeded => ("ok", Color::Green),
        TrialOutcome::Failed => ("fail", Color::Red),
        TrialOutcome::TimedOut => ("timeout", Color::Yellow),
    };
    let mut spans = vec![
        Span::raw(format!("#{:<3} ", record.run)),
        Span::styled(format!("{label:<8}"), Style::default().fg(color)),
        Span::raw(format!("{} ({}ms)", record.candidate, record.elapsed_ms)),
    ];
    if let Some(error) = &record.error {
        spans.push(Span::styled(
            format!(" {error}"),
            Style::default().fg(Color::DarkGray),
        ));
    }
    Line::from(spans)
}

fn render_help_popup(frame: &mut Frame<'_>) {
    let area = centered_rect(60, 50, frame.area());
    frame.render_widget(Clear, area);
    let help = Paragraph::new(vec![
        Line::from("Keymap"),
        Line::from("q: quit"),
        Line::from("?: toggle help"),
        Line::from("g: refresh diagnostics"),
        Line::from("r: retry resolution"),
        Line::from("e: edit manual override URL"),
        Line::from("Enter: submit override (while editing)"),
        Line::from("Esc: cancel editing"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(help, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100_u16 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100_u16 - height_percent) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100_u16 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100_u16 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

fn map_key_event(key: KeyEvent, mode: Mode) -> Option<Msg> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') => Some(Msg::Quit),
            _ => None,
        };
    }

    match mode {
        Mode::EditOverride => match key.code {
            KeyCode::Enter => Some(Msg::Submit),
            KeyCode::Esc => Some(Msg::Cancel),
            KeyCode::Backspace => Some(Msg::Backspace),
            KeyCode::Char(ch) => Some(Msg::Input(ch)),
            _ => None,
        },
        Mode::Browse => match key.code {
            KeyCode::Char('q') | KeyCode::Esc => Some(Msg::Quit),
            KeyCode::Char('?') => Some(Msg::ToggleHelp),
            KeyCode::Char('g') => Some(Msg::Refresh),
            KeyCode::Char('r') => Some(Msg::Retry),
            KeyCode::Char('e') => Some(Msg::EditOverride),
            _ => None,
        },
    }
}
