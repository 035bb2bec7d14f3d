//! Terminal front end: shows the modem fields and maps keys to session triggers.

use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use color_eyre::eyre::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::{Frame, Terminal};

use dc_unlock::device::BLANK;
use dc_unlock::{ConnectionState, LockStatus, Notification, SessionState};

use crate::Session;

// Upper bound on how long a key press waits before the session is polled again.
const TICK: Duration = Duration::from_millis(50);
const HISTORY: usize = 6;

const HELP: &str = "c connect  d disconnect  r refresh  u unlock  q quit";

// Everything on screen. Only ever changed by session notifications.
#[derive(Debug, Default)]
struct View {
    connected: bool,
    status: Option<LockStatus>,
    attempts: Option<u8>,
    imei: Option<String>,
    nck: Option<String>,
    messages: Vec<String>,
}

impl View {
    fn apply(&mut self, notification: Notification) {
        match notification {
            Notification::StatusMessage(text) => {
                self.messages.push(text);
                if self.messages.len() > HISTORY {
                    self.messages.remove(0);
                }
            }
            Notification::Identity(imei) => self.imei = Some(imei.to_string()),
            Notification::LockStatus { status, attempts } => {
                self.status = Some(status);
                self.attempts = Some(attempts);
            }
            Notification::UnlockCode(code) => self.nck = Some(code),
            Notification::Connection(open) => {
                self.connected = open;
                // A new connection starts from an unknown modem.
                if open {
                    self.status = None;
                    self.attempts = None;
                    self.imei = None;
                    self.nck = None;
                }
            }
        }
    }
}

pub fn run(mut session: Session, port: &str) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = event_loop(&mut terminal, &mut session, port);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    session: &mut Session,
    port: &str,
) -> Result<()> {
    let mut view = View::default();
    loop {
        session.poll(Instant::now());
        for notification in session.sink_mut().drain(..) {
            view.apply(notification);
        }

        let state = session.state();
        terminal.draw(|frame| draw(frame, &view, state, port))?;

        let wait = session
            .next_deadline()
            .map_or(TICK, |d| d.saturating_duration_since(Instant::now()).min(TICK));
        if !event::poll(wait)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let now = Instant::now();
        // Failures reach the view as status messages.
        let _ = match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                if session.connection() == ConnectionState::Open {
                    let _ = session.disconnect();
                }
                return Ok(());
            }
            KeyCode::Char('c') => session.connect(port, now),
            KeyCode::Char('d') => session.disconnect(),
            KeyCode::Char('r') => session.refresh_status(now),
            KeyCode::Char('u') => session.unlock(now),
            _ => Ok(()),
        };
    }
}

fn draw(frame: &mut Frame, view: &View, state: SessionState, port: &str) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(frame.size());

    let link = if view.connected { "connected" } else { "disconnected" };
    let header = Paragraph::new(format!("{}: {} ({:?})", port, link, state))
        .block(Block::default().borders(Borders::ALL).title("Port"));
    frame.render_widget(header, chunks[0]);

    let status_style = match view.status {
        Some(LockStatus::Blocked) => Style::default().fg(Color::Red),
        Some(LockStatus::Unblocked) => Style::default().fg(Color::Green),
        Some(LockStatus::Custom) => Style::default().fg(Color::Yellow),
        _ => Style::default(),
    };
    let fields = vec![
        field("Status", view.status.unwrap_or_default().to_string(), status_style),
        field(
            "Attempts",
            view.attempts.map_or_else(|| BLANK.to_owned(), |n| n.to_string()),
            Style::default(),
        ),
        field("IMEI", text_or_blank(&view.imei), Style::default()),
        field("NCK", text_or_blank(&view.nck), Style::default()),
    ];
    let modem = Paragraph::new(fields).block(Block::default().borders(Borders::ALL).title("Modem"));
    frame.render_widget(modem, chunks[1]);

    let messages: Vec<Line> = view.messages.iter().map(|m| Line::from(m.as_str())).collect();
    let log = Paragraph::new(messages).block(Block::default().borders(Borders::ALL).title("Messages"));
    frame.render_widget(log, chunks[2]);

    frame.render_widget(
        Paragraph::new(HELP).style(Style::default().add_modifier(Modifier::DIM)),
        chunks[3],
    );
}

fn field(label: &str, value: String, style: Style) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{:<10}", label), Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(value, style),
    ])
}

fn text_or_blank(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| BLANK.to_owned())
}
