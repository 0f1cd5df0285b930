use std::{io::stdout, path::PathBuf, time::Duration};

use crate::gui::error::MonitorError;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// Let the operator pick the controller's serial port from a list.
/// Returns `None` if they quit without choosing.
pub fn port_selector(mut available_ports: Vec<PathBuf>) -> Result<Option<PathBuf>, MonitorError> {
    let n_ports = available_ports.len();
    if n_ports == 0 {
        return Err(MonitorError::NothingToSelect);
    }

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut cursor = 0;
    let mut list_state = ListState::default().with_selected(Some(cursor));
    let mut selected_port = None;
    let outcome = loop {
        let title = Title::from(" Perch Controller Port ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Select ".into(),
            "<Enter>".magenta().bold(),
            " Quit ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let port_names = available_ports.iter().map(|p| p.to_string_lossy());
        let list = List::new(port_names)
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        list_state.select(Some(cursor));
        if let Err(e) = terminal.draw(|frame| {
            let area = frame.size();
            frame.render_stateful_widget(list, area, &mut list_state);
        }) {
            break Err(e);
        }

        match event::poll(Duration::from_millis(16)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => break Err(e),
        }
        match event::read() {
            Ok(event::Event::Key(key)) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Down => cursor = (cursor + 1) % n_ports,
                KeyCode::Up => cursor = (cursor + n_ports - 1) % n_ports,
                KeyCode::Enter => {
                    selected_port = Some(cursor);
                    break Ok(());
                }
                KeyCode::Char('q') | KeyCode::Esc => break Ok(()),
                _ => {}
            },
            Ok(_) => {}
            Err(e) => break Err(e),
        }
    };

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    outcome?;

    Ok(selected_port.map(|i| available_ports.swap_remove(i)))
}
