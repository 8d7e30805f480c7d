use std::{
    collections::VecDeque,
    sync::mpsc::{Receiver, TryRecvError},
    time::Duration,
};

use anyhow::Result;
use crossterm::{
    event::{self, Event as CEvent, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Terminal,
};
use tintcam_recorder::format_recording_time;
use tintcam_types::events::{EventPayload, SystemEvent};

const MAX_LOG_ENTRIES: usize = 120;

pub enum UiMessage {
    Event(SystemEvent),
    Shutdown,
}

/// Values shown in the header; updated from FPS and recording events.
#[derive(Debug, Default, PartialEq)]
struct Dashboard {
    fps: u32,
    recording: Option<(String, u64)>,
}

impl Dashboard {
    /// Returns a log line for events that belong in the event list.
    fn apply(&mut self, event: &SystemEvent) -> Option<String> {
        match &event.payload {
            EventPayload::Fps(fps) => {
                self.fps = fps.fps;
                None
            }
            EventPayload::Recording(rec) => {
                self.recording = Some((rec.state.clone(), rec.elapsed_ms / 1000));
                None
            }
            _ => Some(format_event(event)),
        }
    }

    fn recording_label(&self) -> String {
        match &self.recording {
            Some((state, secs)) => format!("{} {}", state, format_recording_time(*secs)),
            None => "off".to_string(),
        }
    }
}

pub fn run(receiver: Receiver<UiMessage>, summary: String) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;

    let res = run_loop(&mut terminal, receiver, summary.as_str());

    terminal.show_cursor()?;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    res
}

fn run_loop<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    receiver: Receiver<UiMessage>,
    summary: &str,
) -> Result<()> {
    let mut logs: VecDeque<String> = VecDeque::with_capacity(MAX_LOG_ENTRIES);
    let mut dashboard = Dashboard::default();

    loop {
        let mut should_close = false;
        loop {
            match receiver.try_recv() {
                Ok(UiMessage::Event(event)) => {
                    if let Some(line) = dashboard.apply(&event) {
                        if logs.len() == MAX_LOG_ENTRIES {
                            logs.pop_front();
                        }
                        logs.push_back(line);
                    }
                }
                Ok(UiMessage::Shutdown) | Err(TryRecvError::Disconnected) => {
                    should_close = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
                .split(f.size());

            let header = Paragraph::new(Line::from(vec![
                Span::styled(
                    format!("{:>3} fps", dashboard.fps),
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw("  "),
                Span::styled("rec:", Style::default().fg(Color::Red)),
                Span::raw(" "),
                Span::raw(dashboard.recording_label()),
                Span::raw("  "),
                Span::styled("camera:", Style::default().fg(Color::Magenta)),
                Span::raw(" "),
                Span::raw(summary),
                Span::raw("  "),
                Span::styled("q", Style::default().fg(Color::Yellow)),
                Span::raw(" to quit"),
            ]))
            .block(Block::default().borders(Borders::ALL).title("tintcam"));
            f.render_widget(header, chunks[0]);

            let items: Vec<ListItem> = logs
                .iter()
                .rev()
                .map(|entry| ListItem::new(entry.clone()))
                .collect();

            let list = List::new(items)
                .block(Block::default().borders(Borders::ALL).title("Recent events"));

            f.render_widget(list, chunks[1]);
        })?;

        if should_close {
            break;
        }

        if event::poll(Duration::from_millis(100))? {
            if let CEvent::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }

    Ok(())
}

fn format_event(event: &SystemEvent) -> String {
    let timestamp = event.timestamp.format("%H:%M:%S");
    match &event.payload {
        EventPayload::Lifecycle(lifecycle) => format!(
            "[{}] {:?} {}",
            timestamp,
            lifecycle.phase,
            lifecycle.details.clone().unwrap_or_default()
        ),
        EventPayload::Fps(fps) => format!("[{}] {} fps", timestamp, fps.fps),
        EventPayload::Recording(rec) => format!(
            "[{}] Recording {} {}",
            timestamp,
            rec.state,
            format_recording_time(rec.elapsed_ms / 1000)
        ),
        EventPayload::ClipSaved(clip) => format!(
            "[{}] Saved {} ({} bytes, {})",
            timestamp, clip.path, clip.bytes, clip.mime_type
        ),
        EventPayload::RecordingFailed(failed) => {
            format!("[{}] Recording failed: {}", timestamp, failed.detail)
        }
        EventPayload::Unknown(value) => format!("[{}] Unknown payload {}", timestamp, value),
    }
}
