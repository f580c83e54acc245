//! Terminal dashboard for the tandem server

use crate::config::ServerConfig;
use crate::metrics::{ClientInfo, LogEntry, LogLevel, Metrics, ServerStatus};
use crate::network;
use chrono::Local;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Margin, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
    Frame, Terminal,
};
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::sync::PlaybackPhase;
use tandem_core::time::current_time_ms;

const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

/// Lines moved by PageUp / PageDown
const PAGE: usize = 10;

/// Log scrolling. `log_scroll` counts the newest entries hidden below the view.
#[derive(Debug)]
struct DashboardState {
    log_scroll: usize,
    /// Pinned to the newest entry
    follow: bool,
}

impl DashboardState {
    fn new() -> Self {
        Self {
            log_scroll: 0,
            follow: true,
        }
    }

    fn scroll_older(&mut self, lines: usize, log_count: usize) {
        if log_count == 0 {
            return;
        }
        self.log_scroll = (self.log_scroll + lines).min(log_count - 1);
        self.follow = false;
    }

    fn scroll_newer(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
        if self.log_scroll == 0 {
            self.follow = true;
        }
    }

    fn toggle_follow(&mut self) {
        self.follow = !self.follow;
        if self.follow {
            self.log_scroll = 0;
        }
    }

    /// Apply a key press. Returns `true` when the dashboard should exit.
    fn handle_key(&mut self, key: KeyEvent, log_count: usize) -> bool {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Up | KeyCode::Char('k') => self.scroll_older(1, log_count),
            KeyCode::Down | KeyCode::Char('j') => self.scroll_newer(1),
            KeyCode::PageUp => self.scroll_older(PAGE, log_count),
            KeyCode::PageDown => self.scroll_newer(PAGE),
            KeyCode::Home => self.scroll_older(log_count, log_count),
            KeyCode::End => self.scroll_newer(usize::MAX),
            KeyCode::Char('a') => self.toggle_follow(),
            _ => {}
        }
        false
    }
}

/// Raw mode + alternate screen for as long as it lives
struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut out = io::stdout();
        execute!(out, EnterAlternateScreen)?;
        Ok(Self {
            terminal: Terminal::new(CrosstermBackend::new(out))?,
        })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Run the server behind the dashboard until the user quits
pub async fn run(config: ServerConfig, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    let mut guard = TerminalGuard::enter()?;

    let server_metrics = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = network::run(config, Arc::clone(&server_metrics)).await {
            let mut m = server_metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Server error: {}", e));
        }
    });

    let mut state = DashboardState::new();
    loop {
        if state.follow {
            state.log_scroll = 0;
        }
        guard.terminal.draw(|f| draw(f, &metrics, &state))?;

        if !event::poll(REDRAW_INTERVAL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let log_count = metrics.read().logs.len();
        if state.handle_key(key, log_count) {
            return Ok(());
        }
    }
}

fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, state: &DashboardState) {
    let m = metrics.read();

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(8),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(f.area());
    let bottom = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(38), Constraint::Min(30)])
        .split(rows[2]);

    draw_header(f, rows[0], &m);
    draw_stats(f, rows[1], &m);
    draw_clients(f, bottom[0], &m.client_list);
    draw_logs(f, bottom[1], &m, state);
    draw_footer(f, rows[3], state);
}

fn status_label(status: ServerStatus) -> (&'static str, Color) {
    match status {
        ServerStatus::Starting => ("STARTING", Color::Yellow),
        ServerStatus::Running => ("RUNNING", Color::Green),
        ServerStatus::Error => ("ERROR", Color::Red),
    }
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status, color) = status_label(m.status);
    let line = Line::from(vec![
        Span::styled("Tandem Server", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  "),
        Span::styled(status, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::raw("  │  up "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
        Span::raw("  │  reference clock "),
        Span::styled(Local::now().format("%H:%M:%S").to_string(), Style::default().fg(Color::Cyan)),
    ]);

    f.render_widget(Paragraph::new(line).block(Block::default().borders(Borders::ALL)), area);
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    // Server Info
    let listen = m.listen_addr.clone().unwrap_or_else(|| "binding...".to_string());
    let source = m
        .playback
        .as_ref()
        .and_then(|p| p.source.as_ref().map(|s| (s.name.clone(), p.source_bytes)));
    let (source_name, source_size) = match source {
        Some((name, bytes)) => (name, format_bytes(bytes as u64)),
        None => ("none".to_string(), "-".to_string()),
    };

    let server_info = vec![
        Line::from(vec![
            Span::raw("Listening: "),
            Span::styled(listen, Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Audio: "),
            Span::styled(source_name, Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![
            Span::raw("Size: "),
            Span::styled(source_size, Style::default().fg(Color::Cyan)),
        ]),
    ];

    let server_block = Paragraph::new(server_info)
        .block(Block::default().borders(Borders::ALL).title(" Server "));
    f.render_widget(server_block, chunks[0]);

    // Connections
    let conn_info = vec![
        Line::from(vec![
            Span::raw("Active: "),
            Span::styled(
                m.connected_clients.to_string(),
                Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::raw("Total: "),
            Span::styled(m.total_connections.to_string(), Style::default().fg(Color::White)),
        ]),
        Line::from(vec![
            Span::raw("Peak: "),
            Span::styled(m.peak_connections.to_string(), Style::default().fg(Color::Magenta)),
        ]),
        Line::from(vec![
            Span::raw("Probes: "),
            Span::styled(m.probes_answered.to_string(), Style::default().fg(Color::Cyan)),
        ]),
    ];

    let conn_block = Paragraph::new(conn_info)
        .block(Block::default().borders(Borders::ALL).title(" Connections "));
    f.render_widget(conn_block, chunks[1]);

    // Playback
    let (phase_text, phase_style, position, seq) = match &m.playback {
        Some(p) => {
            let state = p.update.state;
            let (text, style) = match state.phase() {
                PlaybackPhase::Playing => ("PLAYING", Style::default().fg(Color::Green)),
                PlaybackPhase::Paused => ("PAUSED", Style::default().fg(Color::Yellow)),
                PlaybackPhase::Stopped => ("STOPPED", Style::default().fg(Color::DarkGray)),
            };
            let position = format_position(state.position_at(current_time_ms()));
            (text, style, position, p.update.seq.to_string())
        }
        None => ("...", Style::default(), "-".to_string(), "-".to_string()),
    };

    let playback_info = vec![
        Line::from(vec![
            Span::raw("State: "),
            Span::styled(phase_text, phase_style.add_modifier(Modifier::BOLD)),
        ]),
        Line::from(vec![
            Span::raw("Position: "),
            Span::styled(position, Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Seq: "),
            Span::styled(seq, Style::default().fg(Color::White)),
        ]),
        Line::from(vec![
            Span::raw("Commands: "),
            Span::styled(
                format!("{} applied / {} ignored", m.commands_applied, m.commands_ignored),
                Style::default().fg(Color::Magenta),
            ),
        ]),
        Line::from(vec![
            Span::raw("Uploads: "),
            Span::styled(m.uploads.to_string(), Style::default().fg(Color::Green)),
        ]),
    ];

    let playback_block = Paragraph::new(playback_info)
        .block(Block::default().borders(Borders::ALL).title(" Playback "));
    f.render_widget(playback_block, chunks[2]);
}

fn draw_clients(f: &mut Frame, area: Rect, clients: &[ClientInfo]) {
    let now = Local::now();
    let items: Vec<ListItem> = clients
        .iter()
        .map(|c| {
            let connected_for = now.signed_duration_since(c.connected_at).num_seconds();
            ListItem::new(Line::from(vec![
                Span::styled(format!("#{:<4}", c.client_id), Style::default().fg(Color::Yellow)),
                Span::raw(format!("{} ", c.addr)),
                Span::styled(format_age(connected_for), Style::default().fg(Color::DarkGray)),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Clients ({}) ", clients.len())),
    );
    f.render_widget(list, area);
}

fn level_color(level: LogLevel) -> Color {
    match level {
        LogLevel::Info => Color::Blue,
        LogLevel::Warning => Color::Yellow,
        LogLevel::Error => Color::Red,
        LogLevel::Connection => Color::Green,
        LogLevel::Playback => Color::Magenta,
    }
}

fn log_line(entry: &LogEntry) -> ListItem<'_> {
    ListItem::new(Line::from(vec![
        Span::styled(
            entry.timestamp.format("%H:%M:%S ").to_string(),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled(
            format!("{:<5} ", entry.level.as_str()),
            Style::default().fg(level_color(entry.level)),
        ),
        Span::raw(entry.message.as_str()),
    ]))
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let rows = area.height.saturating_sub(2) as usize;
    let total = m.logs.len();

    let mut visible: Vec<ListItem> = m.logs.iter().rev().skip(state.log_scroll).take(rows).map(log_line).collect();
    // Oldest at the top
    visible.reverse();

    let title = match (state.follow, total) {
        (true, _) => " Activity (following) ".to_string(),
        (false, 0) => " Activity ".to_string(),
        (false, _) => format!(" Activity ({}/{}) ", total - state.log_scroll, total),
    };
    f.render_widget(
        List::new(visible).block(Block::default().borders(Borders::ALL).title(title)),
        area,
    );

    if total > rows {
        let mut scroll = ScrollbarState::new(total).position(total.saturating_sub(state.log_scroll + rows));
        f.render_stateful_widget(
            Scrollbar::new(ScrollbarOrientation::VerticalRight),
            area.inner(Margin { vertical: 1, horizontal: 0 }),
            &mut scroll,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    const KEYS: [(&str, &str); 5] = [
        ("q", "quit"),
        ("j/k", "scroll"),
        ("PgUp/PgDn", "page"),
        ("Home/End", "oldest/newest"),
        ("a", "follow"),
    ];
    let key_style = Style::default().fg(Color::Black).bg(Color::Gray);

    let mut spans = Vec::with_capacity(KEYS.len() * 2 + 1);
    for (key, action) in KEYS {
        spans.push(Span::styled(format!(" {} ", key), key_style));
        spans.push(Span::raw(format!(" {}  ", action)));
    }
    spans.push(if state.follow {
        Span::styled("following", Style::default().fg(Color::Green))
    } else {
        Span::styled("paused", Style::default().fg(Color::Yellow))
    });

    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Compact age such as `42s`, `5m` or `3h12m`
fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// `m:ss.t`, negative while a start is still pending
fn format_position(position_ms: i64) -> String {
    let sign = if position_ms < 0 { "-" } else { "" };
    let ms = position_ms.unsigned_abs();
    format!("{}{}:{:02}.{}", sign, ms / 60_000, (ms / 1000) % 60, (ms % 1000) / 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_position() {
        assert_eq!(format_position(0), "0:00.0");
        assert_eq!(format_position(83_450), "1:23.4");
        assert_eq!(format_position(-1_500), "-0:01.5");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(-3), "0s");
        assert_eq!(format_age(42), "42s");
        assert_eq!(format_age(300), "5m");
        assert_eq!(format_age(3 * 3600 + 12 * 60), "3h12m");
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_scrolling_stops_and_resumes_following() {
        let mut state = DashboardState::new();

        assert!(!state.handle_key(press(KeyCode::Up), 0));
        assert!(state.follow);

        state.handle_key(press(KeyCode::PageUp), 25);
        assert_eq!(state.log_scroll, PAGE);
        assert!(!state.follow);

        state.handle_key(press(KeyCode::Home), 25);
        assert_eq!(state.log_scroll, 24);

        state.handle_key(press(KeyCode::Char('j')), 25);
        assert_eq!(state.log_scroll, 23);

        state.handle_key(press(KeyCode::End), 25);
        assert_eq!(state.log_scroll, 0);
        assert!(state.follow);
    }

    #[test]
    fn test_quit_keys() {
        let mut state = DashboardState::new();
        assert!(state.handle_key(press(KeyCode::Char('q')), 0));
        assert!(state.handle_key(press(KeyCode::Esc), 0));
        assert!(state.handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL), 0));
        assert!(!state.handle_key(press(KeyCode::Char('c')), 0));
    }
}
