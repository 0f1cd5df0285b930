//! A periodic timer on its own thread.

use log::{debug, error};
use std::{
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

enum ThreadMessage {
    Stop,
}

/// Calls a closure every `interval` until stopped or dropped. Ticks do not
/// drift: each deadline is the previous one plus `interval`, and ticks that
/// are missed entirely are skipped rather than replayed.
pub struct Ticker {
    stop_tx: Sender<ThreadMessage>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Start ticking. The first call happens one `interval` from now.
    pub fn spawn<F>(interval: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let mut deadline = Instant::now() + interval;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match stop_rx.recv_timeout(wait) {
                    Ok(ThreadMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                on_tick();

                deadline += interval;
                let now = Instant::now();
                while deadline <= now {
                    deadline += interval;
                }
            }
            debug!("ticker stopped");
        });

        Self {
            stop_tx,
            thread: Some(thread),
        }
    }

    /// Stop ticking and wait for any tick in progress to finish.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let _ = self.stop_tx.send(ThreadMessage::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.halt();
    }
}
