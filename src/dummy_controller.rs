//! An in-memory perch controller that speaks the same line protocol as the
//! real board. It answers every command with `ok`, keeps the relay and
//! counter state the commands imply, and can either be fed lines by hand or
//! generate random perch crossings on its own while running.

use crate::serial_link::Command;
use crate::stimulus::Position;

use rand::prelude::*;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

const IDLE_READ: Duration = Duration::from_millis(1);

struct Outbound {
    bytes: Vec<u8>,
    response: bool,
}

#[derive(Default)]
struct Board {
    outbound: VecDeque<Outbound>,
    partial_cmd: Vec<u8>,
    commands: Vec<String>,
    before_next_response: Vec<String>,
    muted: bool,
    running: bool,
    relays: [bool; 4],
    counts: [u32; 4],
    debounce_ms: Option<u32>,
    in_flight: usize,
    max_in_flight: usize,
}

impl Board {
    fn push_line(&mut self, line: &str, response: bool) {
        self.outbound.push_back(Outbound {
            bytes: format!("{line}\r\n").into_bytes(),
            response,
        });
    }

    fn apply(&mut self, cmd: &str) {
        match cmd.as_bytes() {
            [b's', b'a', pos, state] => {
                if let Some(position) = Position::new(pos.wrapping_sub(b'0')) {
                    self.relays[position.index()] = *state == b'1';
                }
            }
            [b's', b'd', ms @ ..] => {
                self.debounce_ms = std::str::from_utf8(ms).ok().and_then(|s| s.parse().ok());
            }
            b"n" => self.running = true,
            b"p" | b"r" => self.running = false,
            b"c" => self.counts = [0; 4],
            _ => {}
        }
    }

    fn crossing(&mut self, position: Position) -> String {
        self.counts[position.index()] += 1;
        format!("{}{}", position.sensor(), self.counts[position.index()])
    }
}

/// A simulated perch controller. Clones share the same board, so a test can
/// keep one clone while the link worker owns another.
#[derive(Clone, Default)]
pub struct DummyController {
    board: Arc<Mutex<Board>>,
}

impl DummyController {
    /// A controller that only speaks when spoken to, or when a line is
    /// injected.
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller that, while running, reports a crossing on a random
    /// perch roughly every `mean_interval`. The generator stops once every
    /// clone has been dropped.
    pub fn simulated(mean_interval: Duration) -> Self {
        let controller = Self::new();
        let board = Arc::downgrade(&controller.board);
        thread::spawn(move || generate_crossings(board, mean_interval));
        controller
    }

    /// Queue a raw line as if the hardware had sent it.
    pub fn inject(&self, line: &str) {
        self.board.lock().unwrap().push_line(line, false);
    }

    /// Report a crossing on `position`, bumping its cumulative count.
    /// Returns the line that was sent.
    pub fn cross(&self, position: Position) -> String {
        let mut board = self.board.lock().unwrap();
        let line = board.crossing(position);
        board.push_line(&line, false);
        line
    }

    /// Send `line` after the next command is received but before its
    /// response.
    pub fn inject_before_next_response(&self, line: &str) {
        self.board
            .lock()
            .unwrap()
            .before_next_response
            .push(line.to_owned());
    }

    /// Stop (or resume) answering commands.
    pub fn set_muted(&self, muted: bool) {
        self.board.lock().unwrap().muted = muted;
    }

    /// Every command received so far, without line endings.
    pub fn commands(&self) -> Vec<String> {
        self.board.lock().unwrap().commands.clone()
    }

    /// True if `command` was received at some point.
    pub fn received(&self, command: Command) -> bool {
        let wanted = command.to_string();
        self.board
            .lock()
            .unwrap()
            .commands
            .iter()
            .any(|c| *c == wanted)
    }

    /// The most commands ever waiting on a response at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.board.lock().unwrap().max_in_flight
    }

    #[allow(missing_docs)]
    pub fn relay_on(&self, position: Position) -> bool {
        self.board.lock().unwrap().relays[position.index()]
    }

    #[allow(missing_docs)]
    pub fn is_running(&self) -> bool {
        self.board.lock().unwrap().running
    }

    #[allow(missing_docs)]
    pub fn debounce_ms(&self) -> Option<u32> {
        self.board.lock().unwrap().debounce_ms
    }
}

impl Write for DummyController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut board = self.board.lock().unwrap();
        for &c in buf {
            if c != b'\n' {
                board.partial_cmd.push(c);
                continue;
            }
            let raw = std::mem::take(&mut board.partial_cmd);
            let cmd = String::from_utf8_lossy(&raw).trim().to_owned();
            if cmd.is_empty() {
                continue;
            }
            board.apply(&cmd);
            board.commands.push(cmd);

            for line in std::mem::take(&mut board.before_next_response) {
                board.push_line(&line, false);
            }
            if !board.muted {
                board.in_flight += 1;
                board.max_in_flight = board.max_in_flight.max(board.in_flight);
                board.push_line("ok", true);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for DummyController {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut board = self.board.lock().unwrap();
        if board.outbound.is_empty() {
            drop(board);
            thread::sleep(IDLE_READ);
            return Err(io::ErrorKind::TimedOut.into());
        }

        let mut n = 0;
        let mut finished = false;
        if let Some(front) = board.outbound.front_mut() {
            n = front.bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&front.bytes[..n]);
            front.bytes.drain(..n);
            finished = front.bytes.is_empty();
        }
        if finished {
            let done = board.outbound.pop_front();
            if done.is_some_and(|o| o.response) {
                board.in_flight = board.in_flight.saturating_sub(1);
            }
        }
        Ok(n)
    }
}

fn generate_crossings(board: Weak<Mutex<Board>>, mean_interval: Duration) {
    let mut rng = thread_rng();
    loop {
        let jitter = rng.gen_range(0.5..1.5);
        thread::sleep(mean_interval.mul_f64(jitter));

        let Some(board) = board.upgrade() else {
            break;
        };
        let mut board = board.lock().unwrap();
        if board.running {
            let position = Position::ALL[rng.gen_range(0..4)];
            let line = board.crossing(position);
            board.push_line(&line, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(controller: &mut DummyController) -> String {
        let mut out = Vec::new();
        let mut buf = [0; 4];
        while let Ok(n) = controller.read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn commands_are_answered_and_applied() {
        let mut controller = DummyController::new();
        controller.write_all(b"sa21\r\nsd250\r\nn\r\n").unwrap();

        assert_eq!(read_all(&mut controller), "ok\r\nok\r\nok\r\n");
        assert_eq!(controller.commands(), vec!["sa21", "sd250", "n"]);
        assert!(controller.relay_on(Position::new(2).unwrap()));
        assert_eq!(controller.debounce_ms(), Some(250));
        assert!(controller.is_running());
    }

    #[test]
    fn crossings_count_up_until_cleared() {
        let mut controller = DummyController::new();
        let p = Position::new(3).unwrap();
        assert_eq!(controller.cross(p), "C1");
        assert_eq!(controller.cross(p), "C2");
        controller.write_all(b"c\n").unwrap();
        assert_eq!(controller.cross(p), "C1");
        assert_eq!(read_all(&mut controller), "C1\r\nC2\r\nok\r\nC1\r\n");
    }

    #[test]
    fn muted_controller_stays_quiet() {
        let mut controller = DummyController::new();
        controller.set_muted(true);
        controller.write_all(b"p\n").unwrap();
        assert_eq!(read_all(&mut controller), "");
        assert!(controller.received(Command::Pause));
    }

    #[test]
    fn simulation_only_reports_while_running() {
        let mut controller = DummyController::simulated(Duration::from_millis(2));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(read_all(&mut controller), "");

        controller.write_all(b"n\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        let text = read_all(&mut controller);
        assert!(text.starts_with("ok\r\n"));
        assert!(text.lines().count() > 1);
    }
}
