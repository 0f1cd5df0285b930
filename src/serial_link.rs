//! The link to the perch controller.
//!
//! One worker thread owns the connection. Commands are queued to it and
//! answered strictly one at a time: the worker writes a command, then reads
//! until the single response line arrives or the timeout expires, and only
//! then looks at the next command. Everything the controller sends that
//! decodes as a perch event is forwarded to the event stream instead, even
//! while a response is pending, so responses and events are never mixed up.

use crate::hardware_message_decoder::looks_like_event;
use crate::stimulus::Position;

use log::{debug, error, info, warn};
use serial2::SerialPort;
use std::{
    borrow::Cow,
    fmt,
    io::{self, Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// How long a port is given to settle after opening. Most controller
/// boards reset when the port opens.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

/// How long to wait for the response to a single command.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Baud rates the controller firmware is built for.
pub const SUPPORTED_BAUD_RATES: [u32; 2] = [9600, 115200];

/// Consecutive failed commands after which the operator is warned.
pub const ESCALATE_AFTER: usize = 3;

const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// A command understood by the perch controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `sa{pos}{0|1}`: switch the relay of a speaker position off or on.
    SetRelay {
        #[allow(missing_docs)]
        position: Position,
        #[allow(missing_docs)]
        on: bool,
    },
    /// `sd{ms}`: perch debounce / timeout in milliseconds.
    SetDebounce(u32),
    /// `n`: start counting.
    Run,
    /// `p`: pause counting.
    Pause,
    /// `r`: reset.
    Reset,
    /// `c`: clear the counters.
    Clear,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetRelay { position, on } => write!(f, "sa{}{}", position, u8::from(*on)),
            Command::SetDebounce(ms) => write!(f, "sd{ms}"),
            Command::Run => write!(f, "n"),
            Command::Pause => write!(f, "p"),
            Command::Reset => write!(f, "r"),
            Command::Clear => write!(f, "c"),
        }
    }
}

/// Everything that can go wrong talking to the controller.
#[derive(Debug)]
pub enum LinkError {
    /// No serial ports were found at all.
    NoPortsAvailable,
    /// Every candidate port failed to open.
    AllPortsFailed(Vec<(PathBuf, io::Error)>),
    /// The command was written but no response arrived in time.
    Timeout(Command),
    /// Reading or writing the port failed.
    Io(io::Error),
    /// The link has been closed.
    Closed,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            LinkError::NoPortsAvailable => Cow::from("no serial ports available"),
            LinkError::AllPortsFailed(failures) => {
                let detail = failures
                    .iter()
                    .map(|(port, e)| format!("{}: {}", port.display(), e))
                    .collect::<Vec<_>>()
                    .join("; ");
                Cow::from(format!("could not open any serial port ({detail})"))
            }
            LinkError::Timeout(cmd) => Cow::from(format!("no response to \"{cmd}\"")),
            LinkError::Io(error) => Cow::from(format!("io error: {}", error)),
            LinkError::Closed => Cow::from("the link is closed"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for LinkError {}

impl From<io::Error> for LinkError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Anything the link worker can talk through: the serial port, or an
/// in-memory stand-in. Reads should time out rather than block forever,
/// returning `Ok(0)`, `TimedOut` or `WouldBlock` when nothing is pending.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Settings for the link worker.
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    /// How long [LinkHandle::send_command] waits for a response line.
    pub response_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Accumulates bytes and hands out complete lines, without their `\r\n`.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &c in bytes {
            if c == b'\n' {
                let line = String::from_utf8_lossy(&self.partial).trim().to_owned();
                self.partial.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            } else {
                self.partial.push(c);
            }
        }
        lines
    }
}

enum Request {
    Command {
        command: Command,
        reply: Sender<Result<String, LinkError>>,
    },
    Close,
}

/// The raw lines of unsolicited controller output. Ends when the link is
/// closed; a closed stream is not restarted, open a new link instead.
pub struct EventStream {
    rx: Receiver<String>,
}

impl EventStream {
    /// Wait up to `timeout` for the next line.
    pub fn next_timeout(&self, timeout: Duration) -> Option<String> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// The next line if one is already waiting.
    pub fn try_next(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Iterator for EventStream {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// A cloneable handle to the link worker. Clones share the same worker and
/// therefore the same ordered command queue.
#[derive(Clone)]
pub struct LinkHandle {
    requests: Sender<Request>,
    closed: Arc<AtomicBool>,
    failures: Arc<AtomicUsize>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LinkHandle {
    /// Start a worker on `transport`.
    pub fn spawn(transport: impl Transport + 'static, settings: LinkSettings) -> (Self, EventStream) {
        let (req_tx, req_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let worker = LinkWorker {
            transport: Box::new(transport),
            lines: LineBuffer::default(),
            requests: req_rx,
            events: event_tx,
            settings,
        };
        let handle = thread::spawn(move || worker.run());

        (
            LinkHandle {
                requests: req_tx,
                closed: Arc::new(AtomicBool::new(false)),
                failures: Arc::new(AtomicUsize::new(0)),
                worker: Arc::new(Mutex::new(Some(handle))),
            },
            EventStream { rx: event_rx },
        )
    }

    /// Try each candidate port in turn at `baud_rate`, letting each one
    /// settle after it opens, and start a worker on the first that works.
    /// With no candidates given, every port the system reports is tried.
    pub fn open(
        candidates: &[PathBuf],
        baud_rate: u32,
        settle: Duration,
        settings: LinkSettings,
    ) -> Result<(Self, EventStream), LinkError> {
        let port = open_first(candidates, baud_rate, settle)?;
        Ok(Self::spawn(port, settings))
    }

    /// Queue `command` and block until its response line arrives.
    ///
    /// Failures are returned, never retried here.
    pub fn send_command(&self, command: Command) -> Result<String, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.requests
            .send(Request::Command {
                command,
                reply: reply_tx,
            })
            .map_err(|_| LinkError::Closed)?;
        let result = reply_rx.recv().map_err(|_| LinkError::Closed)?;

        match &result {
            Ok(_) => self.failures.store(0, Ordering::SeqCst),
            Err(LinkError::Closed) => {}
            Err(e) => {
                let failed = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failed == ESCALATE_AFTER {
                    error!("{failed} controller commands in a row failed, last: {e}. Check the controller and its cable");
                }
            }
        }
        result
    }

    /// Commands that failed since the last one that got a response.
    pub fn consecutive_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    #[allow(missing_docs)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the worker and release the port. Safe to call any number of
    /// times from any clone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.requests.send(Request::Close);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                warn!("Serial link worker panicked");
            }
        }
        info!("Serial link closed");
    }
}

/// The system's serial ports.
pub fn available_ports() -> Result<Vec<PathBuf>, LinkError> {
    Ok(SerialPort::available_ports()?)
}

fn open_first(candidates: &[PathBuf], baud_rate: u32, settle: Duration) -> Result<SerialPort, LinkError> {
    let ports = if candidates.is_empty() {
        available_ports()?
    } else {
        candidates.to_vec()
    };
    if ports.is_empty() {
        return Err(LinkError::NoPortsAvailable);
    }

    let mut failures = Vec::new();
    for path in ports {
        let opened = SerialPort::open(&path, baud_rate).and_then(|mut port| {
            port.set_read_timeout(POLL_TIMEOUT)?;
            thread::sleep(settle);
            port.discard_buffers()?;
            Ok(port)
        });
        match opened {
            Ok(port) => {
                info!("Opened {} at {} baud", path.display(), baud_rate);
                return Ok(port);
            }
            Err(e) => {
                warn!("Could not open {}: {}", path.display(), e);
                failures.push((path, e));
            }
        }
    }
    Err(LinkError::AllPortsFailed(failures))
}

struct LinkWorker {
    transport: Box<dyn Transport>,
    lines: LineBuffer,
    requests: Receiver<Request>,
    events: Sender<String>,
    settings: LinkSettings,
}

impl LinkWorker {
    fn run(mut self) {
        loop {
            match self.requests.try_recv() {
                Ok(Request::Command { command, reply }) => {
                    let result = self.exchange(command);
                    if let Err(e) = &result {
                        warn!("Command \"{}\" failed: {}", command, e);
                    }
                    let _ = reply.send(result);
                }
                Ok(Request::Close) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {
                    for line in self.poll() {
                        self.forward(line);
                    }
                }
            }
        }
        // Anyone still queued behind the close gets a clean error.
        while let Ok(request) = self.requests.try_recv() {
            if let Request::Command { reply, .. } = request {
                let _ = reply.send(Err(LinkError::Closed));
            }
        }
        debug!("Serial link worker finished");
    }

    /// Write one command and wait for its single response line.
    fn exchange(&mut self, command: Command) -> Result<String, LinkError> {
        debug!("-> {}", command);
        self.transport.write_all(format!("{command}\r\n").as_bytes())?;
        self.transport.flush()?;

        let deadline = Instant::now() + self.settings.response_timeout;
        let mut response = None;
        while response.is_none() && Instant::now() < deadline {
            for line in self.poll() {
                if response.is_none() && !looks_like_event(&line) {
                    debug!("<- {}", line);
                    response = Some(line);
                } else {
                    self.forward(line);
                }
            }
        }
        response.ok_or(LinkError::Timeout(command))
    }

    /// One bounded read. Returns whatever complete lines it produced.
    fn poll(&mut self) -> Vec<String> {
        let mut buffer = [0; 256];
        match self.transport.read(&mut buffer) {
            Ok(0) => {
                thread::sleep(Duration::from_millis(1));
                Vec::new()
            }
            Ok(n) => self.lines.push(&buffer[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Vec::new()
            }
            Err(e) => {
                warn!("Serial read failed: {}", e);
                // don't spin on a dead port while waiting for close
                thread::sleep(POLL_TIMEOUT);
                Vec::new()
            }
        }
    }

    fn forward(&self, line: String) {
        debug!("<~ {}", line);
        let _ = self.events.send(line);
    }
}
