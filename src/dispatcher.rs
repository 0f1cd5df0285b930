//! The perch-event dispatcher: one worker thread per physical position, each
//! running `Idle -> Arming -> Playing -> Disarming -> Idle` for every
//! trigger it takes off its own bounded queue.
//!
//! Positions never wait on each other. The only thing they share is the
//! [LinkHandle], which puts their relay commands on the wire one at a time.
//! A trigger that arrives while a position's queue is full is rejected with
//! a warning, but the hardware count it carried is still recorded.

use crate::assignment::AssignmentCell;
use crate::count_store::CountStore;
use crate::experiment_log::ExperimentLog;
use crate::hardware_message_decoder::PerchEvent;
use crate::playback::{CancelToken, Playback, PlaybackError};
use crate::schedule::WindowId;
use crate::serial_link::{Command, LinkHandle};
use crate::stimulus::{display_name, Channel, Position, StimulusLibrary};

use log::{debug, error, warn};
use std::{
    fmt,
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
        Arc, Condvar, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Queue depth used when the configuration does not give one.
pub const DEFAULT_QUEUE_DEPTH: usize = 1;

/// Where one position is in its play cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionState {
    #[default]
    #[allow(missing_docs)]
    Idle,
    /// Waiting for the relay to switch on.
    Arming,
    #[allow(missing_docs)]
    Playing,
    /// Waiting for the relay to switch off.
    Disarming,
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PositionState::Idle => "idle",
            PositionState::Arming => "arming",
            PositionState::Playing => "playing",
            PositionState::Disarming => "disarming",
        };
        write!(f, "{name}")
    }
}

/// What started a play cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A bird crossed the perch; the count is the controller's.
    Perch(PerchEvent),
    /// The operator asked for the position to play now. Not counted.
    Manual,
}

/// A trigger plus the window that was active when it arrived.
#[derive(Debug, Clone, Copy)]
struct Queued {
    trigger: Trigger,
    window: WindowId,
}

/// The result of handing a trigger to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The position's worker will run a cycle for it.
    Queued,
    /// The position was busy and its queue full.
    Rejected,
    /// The dispatcher has been shut down.
    Closed,
}

#[derive(Debug, Default)]
struct Board {
    states: [PositionState; 4],
    queued: [usize; 4],
}

impl Board {
    fn is_idle(&self) -> bool {
        self.states.iter().all(|s| *s == PositionState::Idle) && self.queued.iter().all(|q| *q == 0)
    }
}

/// Everything a position worker needs. Shared by all four workers.
struct Shared {
    link: LinkHandle,
    assignment: Arc<AssignmentCell>,
    counts: Arc<CountStore>,
    library: Arc<RwLock<StimulusLibrary>>,
    log: ExperimentLog,
    player: Arc<dyn Playback>,
    cancel: CancelToken,
    board: Mutex<Board>,
    settled: Condvar,
}

impl Shared {
    fn set_state(&self, position: Position, state: PositionState) {
        debug!("perch {position}: {state}");
        self.board.lock().unwrap().states[position.index()] = state;
        self.settled.notify_all();
    }

    fn take(&self, position: Position) {
        let mut board = self.board.lock().unwrap();
        board.queued[position.index()] = board.queued[position.index()].saturating_sub(1);
        board.states[position.index()] = PositionState::Arming;
    }

    fn record_count(&self, position: Position, queued: Queued) {
        if let Trigger::Perch(event) = queued.trigger {
            self.counts.record(queued.window, position, event.count);
        }
    }

    /// Run one full cycle for `position`.
    fn cycle(&self, position: Position, queued: Queued) {
        let assignment = self.assignment.load();
        let Some(channel) = assignment.channel_at(position) else {
            error!("perch {position} has no channel assigned, trigger dropped");
            self.log
                .record(format!("Perch {position} has no song assigned, event dropped"));
            self.record_count(position, queued);
            return;
        };
        if queued.trigger == Trigger::Manual {
            self.log.record(format!("Manual play of Song {channel}"));
        }

        let armed = self.link.send_command(Command::SetRelay {
            position,
            on: true,
        });
        let played = match armed {
            Ok(_) => {
                self.set_state(position, PositionState::Playing);
                self.play_channel(channel)
            }
            Err(e) => {
                error!("perch {position}: relay did not arm: {e}");
                self.log
                    .record(format!("Relay {position} could not be switched on: {e}"));
                Vec::new()
            }
        };

        self.set_state(position, PositionState::Disarming);
        if let Err(e) = self.link.send_command(Command::SetRelay {
            position,
            on: false,
        }) {
            error!("perch {position}: relay did not disarm: {e}");
            self.log
                .record(format!("Relay {position} could not be switched off: {e}"));
        }

        if let Trigger::Perch(event) = queued.trigger {
            self.record_count(position, queued);
            self.log.record(format!(
                "Perch {position} Song {channel} count {}, played: {}",
                event.count,
                if played.is_empty() {
                    "nothing".to_owned()
                } else {
                    played.join(", ")
                }
            ));
        }
    }

    /// Play every file of `channel` in order. Returns the names of the
    /// files that played to the end.
    fn play_channel(&self, channel: Channel) -> Vec<String> {
        let files = self.library.read().unwrap().files(channel).to_vec();
        if files.is_empty() {
            self.log.record(format!("No sound selected for Song {channel}"));
            return Vec::new();
        }

        let mut played = Vec::new();
        for file in &files {
            let name = display_name(file);
            match self.player.play(file, &self.cancel) {
                Ok(()) => {
                    self.log
                        .record(format!("Song {channel} played this file: {name}"));
                    played.push(name);
                }
                Err(PlaybackError::Cancelled) => {
                    self.log
                        .record(format!("Song {channel} stopped during: {name}"));
                    break;
                }
                Err(PlaybackError::FileNotFound(path)) => {
                    warn!("missing stimulus file {}", path.display());
                    self.log
                        .record(format!("File not found: {}", path.display()));
                }
                Err(e) => {
                    warn!("could not play {}: {e}", file.display());
                    self.log
                        .record(format!("Song {channel} could not play {name}: {e}"));
                }
            }
        }
        played
    }
}

/// Owns the four position workers and their queues.
pub struct EventDispatcher {
    shared: Arc<Shared>,
    queues: Mutex<Vec<SyncSender<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Start one worker per position. `queue_depth` is how many triggers a
    /// busy position holds on to before rejecting new ones.
    pub fn new(
        link: LinkHandle,
        assignment: Arc<AssignmentCell>,
        counts: Arc<CountStore>,
        library: Arc<RwLock<StimulusLibrary>>,
        log: ExperimentLog,
        player: Arc<dyn Playback>,
        queue_depth: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            link,
            assignment,
            counts,
            library,
            log,
            player,
            cancel: CancelToken::new(),
            board: Mutex::new(Board::default()),
            settled: Condvar::new(),
        });

        let (queues, workers): (Vec<_>, Vec<_>) = Position::ALL
            .iter()
            .map(|&position| {
                let (tx, rx) = sync_channel(queue_depth);
                let shared = shared.clone();
                let worker = thread::spawn(move || position_worker(position, rx, shared));
                (tx, worker)
            })
            .unzip();

        Self {
            shared,
            queues: Mutex::new(queues),
            workers: Mutex::new(workers),
        }
    }

    /// Hand a perch event to its position's worker.
    pub fn dispatch(&self, event: PerchEvent) -> Dispatched {
        self.submit(event.position, Trigger::Perch(event))
    }

    /// Play whatever is assigned to `position` right now, without counting.
    pub fn trigger_manual(&self, position: Position) -> Dispatched {
        self.submit(position, Trigger::Manual)
    }

    fn submit(&self, position: Position, trigger: Trigger) -> Dispatched {
        let queued = Queued {
            trigger,
            window: self.shared.assignment.load().window,
        };

        let Some(queue) = self.queues.lock().unwrap().get(position.index()).cloned() else {
            return Dispatched::Closed;
        };
        self.shared.board.lock().unwrap().queued[position.index()] += 1;
        match queue.try_send(queued) {
            Ok(()) => Dispatched::Queued,
            Err(err) => {
                self.unqueue(position);
                match err {
                    TrySendError::Full(queued) => {
                        warn!("perch {position} is busy, trigger rejected");
                        self.shared
                            .log
                            .record(format!("Perch {position} busy, trigger ignored"));
                        self.shared.record_count(position, queued);
                        Dispatched::Rejected
                    }
                    TrySendError::Disconnected(_) => Dispatched::Closed,
                }
            }
        }
    }

    fn unqueue(&self, position: Position) {
        let mut board = self.shared.board.lock().unwrap();
        board.queued[position.index()] -= 1;
        self.shared.settled.notify_all();
    }

    /// Stop whatever is playing and discard everything still queued. Relays
    /// are still switched off by the workers as they wind down.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Let the workers play again after a [cancel](Self::cancel).
    pub fn reset_cancel(&self) {
        self.shared.cancel.reset();
    }

    /// Block until every position is idle with an empty queue. Returns
    /// false if that did not happen within `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut board = self.shared.board.lock().unwrap();
        while !board.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            board = self
                .shared
                .settled
                .wait_timeout(board, deadline - now)
                .unwrap()
                .0;
        }
        true
    }

    /// Current state of every position, in position order.
    pub fn states(&self) -> [PositionState; 4] {
        self.shared.board.lock().unwrap().states
    }

    /// Cancel, close the queues and join the workers. Later triggers come
    /// back [Dispatched::Closed].
    pub fn shutdown(&self) {
        self.cancel();
        self.queues.lock().unwrap().clear();
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("a position worker panicked");
            }
        }
    }
}

fn position_worker(position: Position, triggers: Receiver<Queued>, shared: Arc<Shared>) {
    while let Ok(queued) = triggers.recv() {
        shared.take(position);
        if shared.cancel.is_cancelled() {
            debug!("perch {position}: discarding queued trigger");
            shared.record_count(position, queued);
        } else {
            shared.cycle(position, queued);
        }
        shared.set_state(position, PositionState::Idle);
    }
    debug!("perch {position}: worker exiting");
}
