use std::{
    io::{self, stdout},
    time::{Duration, Instant},
};

use crate::{
    gui::error::MonitorError,
    run_controller::{RunController, RunState},
    stimulus::{Channel, Position},
};

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{block::Title, *},
    Terminal,
};

const TICK_RATE: Duration = Duration::from_millis(100);
const LOG_LINES: usize = 8;

struct App<'a> {
    run: &'a RunController,
    status: String,
}

impl<'a> App<'a> {
    /// Act on one key. Returns true when the operator wants to leave.
    fn on_key(&mut self, code: KeyCode) -> bool {
        let outcome = match code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('s') => self.run.start().map(|_| "started".to_owned()),
            KeyCode::Char('p') => match self.run.state() {
                RunState::Paused => self.run.resume().map(|_| "resumed".to_owned()),
                _ => self.run.pause().map(|_| "paused".to_owned()),
            },
            KeyCode::Char('x') => self.run.stop().map(|_| "stopped".to_owned()),
            KeyCode::Char(c) => match Channel::from_letter(c.to_ascii_uppercase()) {
                Some(channel) => self
                    .run
                    .play_channel_now(channel)
                    .map(|p| format!("playing Song {channel} on perch {p}")),
                None => return false,
            },
            _ => return false,
        };
        self.status = match outcome {
            Ok(msg) => msg,
            Err(e) => e.to_string(),
        };
        false
    }
}

/// Show the live state of `run` until the operator quits.
pub fn monitor(run: &RunController) -> Result<(), MonitorError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut app = App {
        run,
        status: String::new(),
    };
    let res = run_app(&mut terminal, &mut app);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(res?)
}

fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && app.on_key(key.code) {
                    return Ok(());
                }
            }
        }
        if last_tick.elapsed() >= TICK_RATE {
            last_tick = Instant::now();
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let run = app.run;
    let assignment = run.assignment();
    let counts = run.counts();
    let states = run.position_states();

    let title = Title::from(" 4CT Perch Monitor ".magenta().bold());
    let instructions = Title::from(Line::from(vec![
        " Start ".into(),
        "<S>".magenta().bold(),
        " Pause/Resume ".into(),
        "<P>".magenta().bold(),
        " Stop ".into(),
        "<X>".magenta().bold(),
        " Play ".into(),
        "<A>-<D>".magenta().bold(),
        " Quit ".into(),
        "<Q> ".magenta().bold(),
    ]));
    let outer = Block::default()
        .title(title.alignment(Alignment::Center))
        .title(
            instructions
                .alignment(Alignment::Center)
                .position(block::Position::Bottom),
        )
        .borders(Borders::ALL);
    let area = outer.inner(f.size());
    f.render_widget(outer, f.size());

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(7),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(area);

    let header = Paragraph::new(vec![
        Line::from(vec![
            "State: ".into(),
            Span::styled(run.state().to_string(), Style::default().add_modifier(Modifier::BOLD)),
            "   Time: ".into(),
            Span::raw(run.now().format("%Y-%m-%d %H:%M:%S").to_string()),
            match run.link_failures() {
                0 => "".into(),
                n => Span::styled(
                    format!("   Controller: {n} commands failed"),
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                ),
            },
        ]),
        Line::from(vec![
            "Window: ".into(),
            Span::styled(assignment.window.to_string(), Style::default().add_modifier(Modifier::BOLD)),
            "   Rotation: ".into(),
            Span::raw(assignment.rotation.to_string()),
            if assignment.pinned {
                " (pinned)".yellow()
            } else {
                "".into()
            },
        ]),
    ]);
    f.render_widget(header, chunks[0]);

    let totals = counts.totals();
    let rows = Position::ALL.iter().map(|&p| {
        let channel = assignment
            .channel_at(p)
            .map_or_else(|| "-".to_owned(), |c| format!("Song {c}"));
        Row::new(vec![
            format!("Perch {p}"),
            channel,
            states[p.index()].to_string(),
            counts.get(assignment.window, p).to_string(),
            totals.get(&p).copied().unwrap_or(0).to_string(),
        ])
    });
    let table = Table::new(
        rows,
        [
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Length(10),
            Constraint::Length(10),
        ],
    )
    .header(
        Row::new(vec!["Position", "Channel", "State", "Window", "Total"])
            .style(Style::default().fg(Color::Magenta)),
    )
    .block(Block::default().title("Perches").borders(Borders::TOP));
    f.render_widget(table, chunks[1]);

    let records = run.log().records();
    let recent: Vec<Line> = records[records.len().saturating_sub(LOG_LINES)..]
        .iter()
        .map(|r| Line::from(format!("{} {}", r.timestamp, r.message)))
        .collect();
    let log = Paragraph::new(recent)
        .wrap(Wrap { trim: true })
        .block(Block::default().title("Log").borders(Borders::TOP));
    f.render_widget(log, chunks[2]);

    f.render_widget(Paragraph::new(app.status.as_str().cyan()), chunks[3]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dummy_controller::DummyController,
        playback::ClipTimer,
        rotation::Rotation,
        schedule::ScheduleTable,
        serial_link::{LinkHandle, LinkSettings},
        run_controller::RunSettings,
        stimulus::StimulusLibrary,
    };
    use ratatui::backend::TestBackend;
    use std::sync::Arc;

    fn screen(terminal: &Terminal<TestBackend>) -> String {
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|c| c.symbol())
            .collect()
    }

    #[test]
    fn keys_drive_the_run_and_the_screen_follows() {
        let (link, events) = LinkHandle::spawn(DummyController::new(), LinkSettings::default());
        let run = RunController::new(
            RunSettings::default(),
            link,
            events,
            ScheduleTable::all_day("A-4, B-1, C-2, D-3".parse::<Rotation>().unwrap()),
            StimulusLibrary::new(),
            Arc::new(ClipTimer),
        );
        let mut app = App {
            run: &run,
            status: String::new(),
        };
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();

        assert!(!app.on_key(KeyCode::Char('s')));
        assert_eq!(app.status, "started");
        terminal.draw(|f| ui(f, &app)).unwrap();
        let text = screen(&terminal);
        assert!(text.contains("State: running"));
        assert!(text.contains("A-4, B-1, C-2, D-3"));

        app.on_key(KeyCode::Char('p'));
        assert_eq!(run.state(), RunState::Paused);
        app.on_key(KeyCode::Char('p'));
        assert_eq!(run.state(), RunState::Running);

        app.on_key(KeyCode::Char('x'));
        app.on_key(KeyCode::Char('x'));
        assert_eq!(app.status, "no experiment is running");

        assert!(app.on_key(KeyCode::Char('q')));
        run.shutdown();
    }
}
