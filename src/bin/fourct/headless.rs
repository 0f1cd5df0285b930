//! Line commands on stdin, for running without a terminal UI.

use fourct::{
    rotation::{Rotation, RotationError},
    run_controller::RunController,
    schedule::WindowId,
    stimulus::{Channel, Position},
};

use log::warn;
use std::{
    borrow::Cow,
    fmt,
    io::{self, BufRead, Write},
    str::FromStr,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Start,
    Pause,
    Resume,
    Stop,
    Reset,
    Clear,
    Play(Channel),
    Rotation(WindowId, Rotation),
    Counts,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorError {
    Unknown(String),
    Usage(&'static str),
    Rotation(RotationError),
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            OperatorError::Unknown(word) => Cow::from(format!("unknown command \"{word}\"")),
            OperatorError::Usage(usage) => Cow::from(format!("usage: {usage}")),
            OperatorError::Rotation(e) => Cow::from(format!("{e}")),
        };
        write!(f, "{}", msg)
    }
}

impl From<RotationError> for OperatorError {
    fn from(value: RotationError) -> Self {
        Self::Rotation(value)
    }
}

impl FromStr for Operator {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (word, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
        let rest = rest.trim();
        match word.to_ascii_lowercase().as_str() {
            "start" => Ok(Operator::Start),
            "pause" => Ok(Operator::Pause),
            "resume" => Ok(Operator::Resume),
            "stop" => Ok(Operator::Stop),
            "reset" => Ok(Operator::Reset),
            "clear" => Ok(Operator::Clear),
            "counts" => Ok(Operator::Counts),
            "quit" | "exit" => Ok(Operator::Quit),
            "play" => {
                let mut letters = rest.chars();
                match (
                    letters
                        .next()
                        .and_then(|c| Channel::from_letter(c.to_ascii_uppercase())),
                    letters.next(),
                ) {
                    (Some(channel), None) => Ok(Operator::Play(channel)),
                    _ => Err(OperatorError::Usage("play <A-D>")),
                }
            }
            "rotation" => {
                const USAGE: &str = "rotation <window> <A-1, B-2, C-3, D-4>";
                let (window, label) = rest
                    .split_once(char::is_whitespace)
                    .ok_or(OperatorError::Usage(USAGE))?;
                let window = window
                    .parse()
                    .map_err(|_| OperatorError::Usage(USAGE))?;
                Ok(Operator::Rotation(WindowId(window), label.parse()?))
            }
            other => Err(OperatorError::Unknown(other.to_owned())),
        }
    }
}

/// Apply one command. Returns the reply for the operator and whether to
/// keep going.
pub fn apply(run: &RunController, op: Operator) -> (String, bool) {
    let reply = match op {
        Operator::Start => run.start().map(|_| "started".to_owned()),
        Operator::Pause => run.pause().map(|_| "paused".to_owned()),
        Operator::Resume => run.resume().map(|_| "resumed".to_owned()),
        Operator::Stop => run.stop().map(|_| "stopped".to_owned()),
        Operator::Reset => run.reset().map(|_| "reset".to_owned()),
        Operator::Clear => run.clear().map(|_| "cleared".to_owned()),
        Operator::Play(channel) => run
            .play_channel_now(channel)
            .map(|p| format!("playing Song {channel} on perch {p}")),
        Operator::Rotation(window, rotation) => run
            .set_window_rotation(window, rotation)
            .map(|_| format!("{window} now uses {rotation}")),
        Operator::Counts => Ok(describe(run)),
        Operator::Quit => return ("bye".to_owned(), false),
    };
    match reply {
        Ok(text) => (text, true),
        Err(e) => (format!("error: {e}"), true),
    }
}

fn describe(run: &RunController) -> String {
    let assignment = run.assignment();
    let counts = run.counts();
    let mut lines = vec![format!(
        "{} | {} | {}",
        run.state(),
        assignment.window,
        assignment.rotation
    )];
    if run.link_failures() > 0 {
        lines.push(format!("controller: {} commands failed in a row", run.link_failures()));
    }
    for (window, positions) in &counts.windows {
        let per_position: Vec<String> = Position::ALL
            .iter()
            .map(|p| format!("{p}: {}", positions.get(p).copied().unwrap_or(0)))
            .collect();
        lines.push(format!("{window}: {}", per_position.join(", ")));
    }
    lines.join("\n")
}

/// Read commands from stdin until `quit` or end of input.
pub fn headless(run: &RunController) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let keep_going = match line.parse::<Operator>() {
            Ok(op) => {
                let (reply, keep_going) = apply(run, op);
                writeln!(stdout, "{reply}")?;
                keep_going
            }
            Err(e) => {
                warn!("Bad operator command {line:?}: {e}");
                writeln!(stdout, "{e}")?;
                true
            }
        };
        stdout.flush()?;
        if !keep_going {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!("start".parse(), Ok(Operator::Start));
        assert_eq!("  Stop ".parse(), Ok(Operator::Stop));
        assert_eq!("play c".parse(), Ok(Operator::Play(Channel::C)));
        assert_eq!(
            "rotation 2 A-2, B-3, C-4, D-1".parse(),
            Ok(Operator::Rotation(
                WindowId(2),
                "A-2, B-3, C-4, D-1".parse().unwrap()
            ))
        );
    }

    #[test]
    fn rejects_bad_commands() {
        assert_eq!(
            "dance".parse::<Operator>(),
            Err(OperatorError::Unknown("dance".to_owned()))
        );
        assert!(matches!(
            "play E".parse::<Operator>(),
            Err(OperatorError::Usage(_))
        ));
        assert!(matches!(
            "rotation two A-1, B-2, C-3, D-4".parse::<Operator>(),
            Err(OperatorError::Usage(_))
        ));
        assert!(matches!(
            "rotation 1 A-1, B-1, C-3, D-4".parse::<Operator>(),
            Err(OperatorError::Rotation(_))
        ));
    }
}
