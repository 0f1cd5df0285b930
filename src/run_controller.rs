//! The run lifecycle and the state every other part reads from.
//!
//! [RunController] owns the schedule, the live assignment, the counts, the
//! experiment log and the dispatcher. Three things drive it at once: the
//! reader thread turning controller lines into perch events, the [Ticker]
//! re-resolving the schedule and taking snapshots, and operator calls
//! arriving from whatever surface is in front of it.

use crate::assignment::{AssignmentCell, SpeakerAssignment};
use crate::count_store::{CountSnapshot, CountStore, SnapshotReason};
use crate::dispatcher::{Dispatched, EventDispatcher, PositionState, DEFAULT_QUEUE_DEPTH};
use crate::experiment_log::ExperimentLog;
use crate::hardware_message_decoder::{parse, PerchEvent};
use crate::playback::Playback;
use crate::rotation::Rotation;
use crate::schedule::{
    midnight, window_end, ChainWarning, ScheduleError, ScheduleTable, TimeWindow, WindowId,
};
use crate::serial_link::{Command, EventStream, LinkError, LinkHandle};
use crate::stimulus::{display_name, Channel, Position, StimulusLibrary};
use crate::ticker::Ticker;

use chrono::{Local, NaiveDateTime, NaiveTime};
use log::{debug, error, info, warn};
use std::{
    borrow::Cow,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// How long the reader waits for a line before checking whether it should
/// exit.
const READ_POLL: Duration = Duration::from_millis(20);

/// How long stopping waits for the positions to wind down.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Where "now" comes from. Swapped out in tests.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// The local wall clock.
pub fn system_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

/// The parts of the experiment configuration the run itself needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    #[allow(missing_docs)]
    pub experiment: String,
    #[allow(missing_docs)]
    pub subject: String,
    /// Sent to the controller as `sd{ms}` at start.
    pub perch_timeout_ms: u32,
    /// How often the schedule is re-resolved.
    pub tick: Duration,
    #[allow(missing_docs)]
    pub snapshot_every: Duration,
    #[allow(missing_docs)]
    pub midnight_snapshot: bool,
    #[allow(missing_docs)]
    pub queue_depth: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            experiment: "experiment".to_owned(),
            subject: "subject".to_owned(),
            perch_timeout_ms: 200,
            tick: Duration::from_secs(5),
            snapshot_every: Duration::from_secs(5),
            midnight_snapshot: true,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Where the run is in its lifecycle. Paused is part of a run: counts are
/// kept but nothing new plays.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Stopped,
    Running,
    Paused,
    Stopping,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

/// An operator request that could not be carried out.
#[derive(Debug)]
pub enum RunError {
    /// Start, reset or clear while a run is going.
    AlreadyRunning,
    /// Pause or stop without a run.
    NotRunning,
    /// Resume without a pause.
    NotPaused,
    #[allow(missing_docs)]
    Schedule(ScheduleError),
    /// A manual play found the position busy with a full queue.
    Busy(Position),
    /// The serial link is gone.
    Link(LinkError),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            RunError::AlreadyRunning => Cow::from("an experiment is already running"),
            RunError::NotRunning => Cow::from("no experiment is running"),
            RunError::NotPaused => Cow::from("the experiment is not paused"),
            RunError::Schedule(e) => Cow::from(format!("{e}")),
            RunError::Busy(position) => Cow::from(format!("perch {position} is busy")),
            RunError::Link(e) => Cow::from(format!("serial link: {e}")),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for RunError {}

impl From<ScheduleError> for RunError {
    fn from(value: ScheduleError) -> Self {
        Self::Schedule(value)
    }
}

impl From<LinkError> for RunError {
    fn from(value: LinkError) -> Self {
        Self::Link(value)
    }
}

/// State shared with the reader and ticker threads.
struct Inner {
    settings: RunSettings,
    link: LinkHandle,
    events: Mutex<EventStream>,
    schedule: Mutex<ScheduleTable>,
    assignment: Arc<AssignmentCell>,
    counts: Arc<CountStore>,
    library: Arc<RwLock<StimulusLibrary>>,
    log: ExperimentLog,
    dispatcher: EventDispatcher,
    state: Mutex<RunState>,
    pinned: Mutex<Option<Rotation>>,
    clock: Clock,
    reading: AtomicBool,
}

impl Inner {
    fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: RunState) {
        info!("Run is now {state}");
        *self.state.lock().unwrap() = state;
    }

    /// Send a lifecycle command. Failures go to the log and are not retried.
    fn fire(&self, command: Command) {
        if let Err(e) = self.link.send_command(command) {
            error!("\"{command}\" failed: {e}");
            self.log.record(format!("Command {command} failed: {e}"));
        }
    }

    /// Re-resolve the schedule at `now` and swap in the result.
    fn refresh_assignment(&self, now: NaiveTime) {
        let resolution = self.schedule.lock().unwrap().resolve_active(now);
        let pinned = *self.pinned.lock().unwrap();
        let next = match pinned {
            Some(rotation) => SpeakerAssignment {
                window: resolution.window,
                rotation,
                pinned: true,
            },
            None => SpeakerAssignment::recompute(resolution),
        };

        let previous = self.assignment.store(next);
        if previous.window != next.window || previous.rotation != next.rotation {
            self.log.record(format!(
                "Now in {}: {}{}",
                next.window,
                next.rotation,
                if next.pinned { " (pinned)" } else { "" }
            ));
        }
    }

    fn tick(&self, pace: &mut Pace) {
        let now = (self.clock)();
        if pace.last_resolve.elapsed() >= self.settings.tick {
            self.refresh_assignment(now.time());
            pace.last_resolve = Instant::now();
        }
        if pace.last_snapshot.elapsed() >= self.settings.snapshot_every {
            self.counts.take_snapshot(SnapshotReason::Periodic);
            pace.last_snapshot = Instant::now();
        }
        if now.date() != pace.date {
            if self.settings.midnight_snapshot {
                let snapshot = self.counts.take_snapshot(SnapshotReason::Midnight);
                self.log
                    .record(format!("Midnight counts: {}", describe_totals(&snapshot)));
            }
            pace.date = now.date();
        }
    }

    fn handle_line(&self, line: String) {
        match parse(&line) {
            Ok(event) => self.on_event(event),
            Err(e) => {
                warn!("Ignoring line {line:?} from the controller: {e}");
                self.log
                    .record(format!("Could not read \"{line}\" from the controller: {e}"));
            }
        }
    }

    fn on_event(&self, event: PerchEvent) {
        let state = self.state();
        match state {
            RunState::Running => {
                self.dispatcher.dispatch(event);
            }
            RunState::Paused | RunState::Stopping => {
                let window = self.assignment.load().window;
                self.counts.record(window, event.position, event.count);
                self.log.record(format!(
                    "Perch {} count {} while {state}, not played",
                    event.position, event.count
                ));
            }
            RunState::Stopped => debug!("Perch event {event:?} outside a run, ignored"),
        }
    }

    /// Handle every line already waiting on the event stream.
    fn drain_events(&self) {
        let events = self.events.lock().unwrap();
        while let Some(line) = events.try_next() {
            self.handle_line(line);
        }
    }

    fn configuration_record(&self) -> String {
        let schedule = self.schedule.lock().unwrap();
        let windows = schedule.windows();
        let start = windows.first().map_or_else(midnight, |w| w.start);
        let end = windows.last().map_or_else(midnight, |w| w.end_time());
        let starting = windows.first().map(|w| w.rotation).unwrap_or_default();
        drop(schedule);

        let library = self.library.read().unwrap();
        let songs: Vec<String> = Channel::ALL
            .iter()
            .map(|&c| format!("Song {c}: [{}]", library.file_names(c).join(", ")))
            .collect();

        format!(
            "Experiment {} with {}, starting position {}, perch timeout {} ms, start time {}, end time {}, {}",
            self.settings.experiment,
            self.settings.subject,
            starting,
            self.settings.perch_timeout_ms,
            start,
            end,
            songs.join(", ")
        )
    }
}

/// Ticker bookkeeping: when each periodic job last ran.
struct Pace {
    last_resolve: Instant,
    last_snapshot: Instant,
    date: chrono::NaiveDate,
}

fn describe_totals(snapshot: &CountSnapshot) -> String {
    let totals = snapshot.totals();
    Position::ALL
        .iter()
        .map(|p| format!("{p}: {}", totals.get(p).copied().unwrap_or(0)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coordinates one experiment on one controller.
pub struct RunController {
    inner: Arc<Inner>,
    /// Holds the ticker while a run is active; the lock also keeps
    /// lifecycle operations from overlapping.
    lifecycle: Mutex<Option<Ticker>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RunController {
    /// Set everything up on the wall clock. Nothing is sent to the
    /// controller until [start](Self::start).
    pub fn new(
        settings: RunSettings,
        link: LinkHandle,
        events: EventStream,
        schedule: ScheduleTable,
        library: StimulusLibrary,
        player: Arc<dyn Playback>,
    ) -> Self {
        Self::with_clock(settings, link, events, schedule, library, player, system_clock())
    }

    /// Like [new](Self::new) with a custom source of "now".
    pub fn with_clock(
        settings: RunSettings,
        link: LinkHandle,
        events: EventStream,
        mut schedule: ScheduleTable,
        library: StimulusLibrary,
        player: Arc<dyn Playback>,
        clock: Clock,
    ) -> Self {
        let initial = schedule.resolve_active(clock().time());
        let assignment = Arc::new(AssignmentCell::new(SpeakerAssignment::recompute(initial)));
        let counts = Arc::new(CountStore::new());
        let library = Arc::new(RwLock::new(library));
        let log = ExperimentLog::new(&settings.experiment, &settings.subject);
        let dispatcher = EventDispatcher::new(
            link.clone(),
            assignment.clone(),
            counts.clone(),
            library.clone(),
            log.clone(),
            player,
            settings.queue_depth,
        );

        let inner = Arc::new(Inner {
            settings,
            link,
            events: Mutex::new(events),
            schedule: Mutex::new(schedule),
            assignment,
            counts,
            library,
            log,
            dispatcher,
            state: Mutex::new(RunState::Stopped),
            pinned: Mutex::new(None),
            clock,
            reading: AtomicBool::new(true),
        });

        let reader = {
            let inner = inner.clone();
            thread::spawn(move || read_events(inner))
        };

        Self {
            inner,
            lifecycle: Mutex::new(None),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Begin a run: clear the controller's counters, reset the schedule
    /// fallback, start the timers and tell the controller to run.
    pub fn start(&self) -> Result<(), RunError> {
        let mut ticker = self.lifecycle.lock().unwrap();
        if self.inner.state() != RunState::Stopped {
            return Err(RunError::AlreadyRunning);
        }
        if self.inner.link.is_closed() {
            return Err(RunError::Link(LinkError::Closed));
        }

        self.inner.counts.clear();
        self.inner.schedule.lock().unwrap().reset_sticky();
        self.inner.refresh_assignment((self.inner.clock)().time());
        self.inner.dispatcher.reset_cancel();

        self.inner.fire(Command::Clear);
        self.inner
            .fire(Command::SetDebounce(self.inner.settings.perch_timeout_ms));
        self.inner.log.record(self.inner.configuration_record());

        let interval = self
            .inner
            .settings
            .tick
            .min(self.inner.settings.snapshot_every);
        let mut pace = Pace {
            last_resolve: Instant::now(),
            last_snapshot: Instant::now(),
            date: (self.inner.clock)().date(),
        };
        let inner = self.inner.clone();
        *ticker = Some(Ticker::spawn(interval, move || inner.tick(&mut pace)));

        self.inner.set_state(RunState::Running);
        self.inner.fire(Command::Run);
        self.inner.log.record("Start");
        Ok(())
    }

    /// Hold new triggers; counts keep accumulating.
    pub fn pause(&self) -> Result<(), RunError> {
        let _guard = self.lifecycle.lock().unwrap();
        if self.inner.state() != RunState::Running {
            return Err(RunError::NotRunning);
        }
        self.inner.fire(Command::Pause);
        self.inner.set_state(RunState::Paused);
        self.inner.log.record("Pause");
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn resume(&self) -> Result<(), RunError> {
        let _guard = self.lifecycle.lock().unwrap();
        if self.inner.state() != RunState::Paused {
            return Err(RunError::NotPaused);
        }
        self.inner.set_state(RunState::Running);
        self.inner.fire(Command::Run);
        self.inner.log.record("Resume");
        Ok(())
    }

    /// End the run. Playback is cut off, the controller is paused, reset
    /// and cleared, every relay is switched off and the final snapshot is
    /// returned.
    pub fn stop(&self) -> Result<CountSnapshot, RunError> {
        let mut ticker = self.lifecycle.lock().unwrap();
        if !matches!(self.inner.state(), RunState::Running | RunState::Paused) {
            return Err(RunError::NotRunning);
        }
        self.inner.set_state(RunState::Stopping);
        self.inner.dispatcher.cancel();
        if !self.inner.dispatcher.wait_idle(STOP_GRACE) {
            warn!("Positions still busy after {STOP_GRACE:?}");
        }

        for command in [Command::Pause, Command::Reset, Command::Clear] {
            self.inner.fire(command);
        }
        for position in Position::ALL {
            self.inner.fire(Command::SetRelay {
                position,
                on: false,
            });
        }

        // Everything the controller sent before acknowledging the pause is
        // on the stream by now.
        self.inner.drain_events();
        self.inner.dispatcher.wait_idle(STOP_GRACE);
        if let Some(ticker) = ticker.take() {
            ticker.stop();
        }

        let last = self.inner.counts.take_snapshot(SnapshotReason::Final);
        self.inner
            .log
            .record(format!("Stop. Final counts: {}", describe_totals(&last)));
        self.inner.dispatcher.reset_cancel();
        self.inner.set_state(RunState::Stopped);
        Ok(last)
    }

    /// Send the controller back to its power-on state and forget the
    /// schedule's fallback. Only between runs.
    pub fn reset(&self) -> Result<(), RunError> {
        let _guard = self.lifecycle.lock().unwrap();
        if self.inner.state() != RunState::Stopped {
            return Err(RunError::AlreadyRunning);
        }
        self.inner.fire(Command::Reset);
        self.inner.schedule.lock().unwrap().reset_sticky();
        self.inner.refresh_assignment((self.inner.clock)().time());
        self.inner.log.record("Reset");
        Ok(())
    }

    /// Zero the controller's counters and the count store. Only between
    /// runs.
    pub fn clear(&self) -> Result<(), RunError> {
        let _guard = self.lifecycle.lock().unwrap();
        if self.inner.state() != RunState::Stopped {
            return Err(RunError::AlreadyRunning);
        }
        self.inner.fire(Command::Clear);
        self.inner.counts.clear();
        self.inner.log.record("Counts cleared");
        Ok(())
    }

    /// Empty the experiment log.
    pub fn clear_log(&self) {
        self.inner.log.clear();
    }

    /// Play `channel` from the position it is assigned to right now. Not
    /// counted.
    pub fn play_channel_now(&self, channel: Channel) -> Result<Position, RunError> {
        let position = self.inner.assignment.load().position_of(channel);
        match self.inner.dispatcher.trigger_manual(position) {
            Dispatched::Queued => Ok(position),
            Dispatched::Rejected => Err(RunError::Busy(position)),
            Dispatched::Closed => Err(RunError::Link(LinkError::Closed)),
        }
    }

    /// Change the rotation of one schedule window and apply it at once if
    /// that window is live.
    pub fn set_window_rotation(&self, window: WindowId, rotation: Rotation) -> Result<(), RunError> {
        self.inner
            .schedule
            .lock()
            .unwrap()
            .set_rotation(window, rotation)?;
        self.inner
            .log
            .record(format!("Rotation for {window} set to {rotation}"));
        self.inner.refresh_assignment((self.inner.clock)().time());
        Ok(())
    }

    /// Move one window's start and end. An end of `00:00` runs the window
    /// to the end of the day. Chain problems are returned and logged, not
    /// refused.
    pub fn set_window_bounds(
        &self,
        window: WindowId,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Vec<ChainWarning>, RunError> {
        let warnings = self
            .inner
            .schedule
            .lock()
            .unwrap()
            .set_bounds(window, start, window_end(end))?;
        self.inner
            .log
            .record(format!("Times for {window} set to {start} - {end}"));
        for warning in &warnings {
            self.inner.log.record(format!("Time error: {warning}"));
        }
        self.inner.refresh_assignment((self.inner.clock)().time());
        Ok(warnings)
    }

    /// Pin the assignment to `rotation` regardless of the schedule, or
    /// hand control back to the schedule with `None`.
    pub fn override_rotation(&self, rotation: Option<Rotation>) {
        *self.inner.pinned.lock().unwrap() = rotation;
        match rotation {
            Some(rotation) => self
                .inner
                .log
                .record(format!("Rotation pinned to {rotation}")),
            None => self.inner.log.record("Rotation follows the schedule again"),
        };
        self.inner.refresh_assignment((self.inner.clock)().time());
    }

    /// Replace the files played for `channel`.
    pub fn set_channel_files(&self, channel: Channel, files: Vec<PathBuf>) {
        for file in &files {
            self.inner.log.record(format!(
                "Selected audio file for Song {channel}: {}",
                display_name(file)
            ));
        }
        self.inner
            .library
            .write()
            .unwrap()
            .set_files(channel, files);
    }

    /// Current per-window, per-position counts.
    pub fn counts(&self) -> CountSnapshot {
        self.inner.counts.snapshot()
    }

    /// Every kept snapshot of the current run.
    pub fn snapshots(&self) -> Vec<CountSnapshot> {
        self.inner.counts.history()
    }

    #[allow(missing_docs)]
    pub fn assignment(&self) -> Arc<SpeakerAssignment> {
        self.inner.assignment.load()
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    #[allow(missing_docs)]
    pub fn position_states(&self) -> [PositionState; 4] {
        self.inner.dispatcher.states()
    }

    /// A copy of the schedule windows.
    pub fn windows(&self) -> Vec<TimeWindow> {
        self.inner.schedule.lock().unwrap().windows().to_vec()
    }

    #[allow(missing_docs)]
    pub fn files(&self, channel: Channel) -> Vec<String> {
        self.inner.library.read().unwrap().file_names(channel)
    }

    /// The experiment log; clones share the journal.
    pub fn log(&self) -> ExperimentLog {
        self.inner.log.clone()
    }

    /// Controller commands that have failed in a row. Zero while the link
    /// is healthy.
    pub fn link_failures(&self) -> usize {
        self.inner.link.consecutive_failures()
    }

    /// What the controller's clock says.
    pub fn now(&self) -> NaiveDateTime {
        (self.inner.clock)()
    }

    /// Stop any run, close the link and wait for the background threads.
    pub fn shutdown(self) {
        if matches!(self.state(), RunState::Running | RunState::Paused) {
            if let Err(e) = self.stop() {
                error!("Could not stop the run: {e}");
            }
        }
        self.inner.reading.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().unwrap().take() {
            if reader.join().is_err() {
                error!("Event reader panicked");
            }
        }
        self.inner.dispatcher.shutdown();
        self.inner.link.close();
    }
}

fn read_events(inner: Arc<Inner>) {
    while inner.reading.load(Ordering::SeqCst) && !inner.link.is_closed() {
        let events = inner.events.lock().unwrap();
        if let Some(line) = events.next_timeout(READ_POLL) {
            inner.handle_line(line);
        }
    }
    debug!("Event reader finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_controller::DummyController;
    use crate::playback::{hold, CancelToken, PlaybackError};
    use crate::serial_link::LinkSettings;
    use std::path::Path;

    struct Stub(Duration);

    impl Playback for Stub {
        fn play(&self, _path: &Path, cancel: &CancelToken) -> Result<(), PlaybackError> {
            hold(self.0, cancel)
        }
    }

    fn p(n: u8) -> Position {
        Position::new(n).unwrap()
    }

    fn at(hms: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("2024-05-03 {hms}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn settings() -> RunSettings {
        RunSettings {
            experiment: "pilot".to_owned(),
            subject: "Zebra finch".to_owned(),
            tick: Duration::from_millis(10),
            snapshot_every: Duration::from_millis(10),
            ..RunSettings::default()
        }
    }

    fn controller_with(
        schedule: ScheduleTable,
        player: Arc<dyn Playback>,
        clock: Clock,
    ) -> (DummyController, RunController) {
        let hardware = DummyController::new();
        let (link, events) = LinkHandle::spawn(hardware.clone(), LinkSettings::default());
        let run = RunController::with_clock(
            settings(),
            link,
            events,
            schedule,
            StimulusLibrary::new(),
            player,
            clock,
        );
        (hardware, run)
    }

    fn controller() -> (DummyController, RunController) {
        controller_with(
            ScheduleTable::all_day(Rotation::IDENTITY),
            Arc::new(Stub(Duration::ZERO)),
            system_clock(),
        )
    }

    /// 08:00 to 12:00 in the identity rotation, then 12:00 to 16:00 shifted
    /// by one.
    fn two_windows() -> ScheduleTable {
        let t = |s| NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap();
        ScheduleTable::new(vec![
            TimeWindow {
                start: t("08:00:00"),
                end: Some(t("12:00:00")),
                rotation: Rotation::IDENTITY,
            },
            TimeWindow {
                start: t("12:00:00"),
                end: Some(t("16:00:00")),
                rotation: "A-2, B-3, C-4, D-1".parse().unwrap(),
            },
        ])
        .unwrap()
    }

        fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(2), "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn a_full_run_keeps_the_last_hardware_counts() {
        let now = Arc::new(Mutex::new(at("11:00:00")));
        let clock: Clock = {
            let now = now.clone();
            Arc::new(move || *now.lock().unwrap())
        };
        let (hardware, run) =
            controller_with(two_windows(), Arc::new(Stub(Duration::ZERO)), clock);
        run.start().unwrap();
        assert!(hardware.is_running());

        let mut last = [0; 4];
        for round in 0..5 {
            if round == 2 {
                wait_for("the morning counts", || {
                    let counts = run.counts();
                    Position::ALL
                        .iter()
                        .all(|&position| counts.get(WindowId(0), position) == 2)
                });
                *now.lock().unwrap() = at("13:00:00");
                wait_for("the switch", || run.assignment().window == WindowId(1));
            }
            for position in Position::ALL {
                if round == 4 && position.number() == 3 {
                    continue;
                }
                let line = hardware.cross(position);
                last[position.index()] = line[1..].parse().unwrap();
            }
            thread::sleep(Duration::from_millis(5));
        }

        let snapshot = run.stop().unwrap();
        let totals = snapshot.totals();
        for position in Position::ALL {
            assert_eq!(totals[&position], last[position.index()]);
        }
        assert_eq!(last, [5, 5, 4, 5]);
        // both windows saw crossings, filed under the count at the time
        assert_eq!(snapshot.get(WindowId(0), p(1)), 2);
        assert_eq!(snapshot.get(WindowId(1), p(1)), 5);
        assert_eq!(run.snapshots().last().unwrap().reason, SnapshotReason::Final);
        assert_eq!(run.state(), RunState::Stopped);
        run.shutdown();
    }

    #[test]
    fn start_and_stop_send_their_commands_in_order() {
        let (hardware, run) = controller();
        run.start().unwrap();
        run.stop().unwrap();

        let commands = hardware.commands();
        assert_eq!(&commands[..3], ["c", "sd200", "n"]);
        let tail = &commands[commands.len() - 7..];
        assert_eq!(tail, ["p", "r", "c", "sa10", "sa20", "sa30", "sa40"]);

        let messages = run.log().messages();
        assert!(messages[0].starts_with("Experiment pilot with Zebra finch, starting position A-1, B-2, C-3, D-4"));
        assert!(messages.iter().any(|m| m.starts_with("Stop. Final counts")));
        run.shutdown();
    }

    #[test]
    fn stop_cuts_a_clip_short_and_disarms() {
        let (hardware, run) = controller_with(
            ScheduleTable::all_day(Rotation::IDENTITY),
            Arc::new(Stub(Duration::from_secs(30))),
            system_clock(),
        );
        run.set_channel_files(Channel::A, vec![PathBuf::from("long.wav")]);
        run.start().unwrap();
        hardware.cross(p(1));
        wait_for("playback", || run.position_states()[0] == PositionState::Playing);

        let start = Instant::now();
        run.stop().unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));

        let commands = hardware.commands();
        let armed = commands.iter().position(|c| c == "sa11").unwrap();
        assert!(commands[armed..].contains(&"sa10".to_owned()));
        assert!(!hardware.relay_on(p(1)));
        assert_eq!(run.counts().totals()[&p(1)], 1);
        run.shutdown();
    }

    #[test]
    fn lifecycle_is_checked() {
        let (_hardware, run) = controller();
        assert!(matches!(run.pause(), Err(RunError::NotRunning)));
        assert!(matches!(run.stop(), Err(RunError::NotRunning)));
        run.start().unwrap();
        assert!(matches!(run.start(), Err(RunError::AlreadyRunning)));
        assert!(matches!(run.resume(), Err(RunError::NotPaused)));
        assert!(matches!(run.clear(), Err(RunError::AlreadyRunning)));

        run.pause().unwrap();
        assert_eq!(run.state(), RunState::Paused);
        run.resume().unwrap();
        assert_eq!(run.state(), RunState::Running);
        run.stop().unwrap();
        run.reset().unwrap();
        run.clear().unwrap();
        run.shutdown();
    }

    #[test]
    fn paused_crossings_are_counted_but_not_played() {
        let (hardware, run) = controller();
        run.start().unwrap();
        run.pause().unwrap();
        hardware.cross(p(2));
        wait_for("the count", || run.counts().totals().get(&p(2)) == Some(&1));
        assert!(!hardware.received(Command::SetRelay {
            position: p(2),
            on: true
        }));
        run.shutdown();
    }

    #[test]
    fn the_ticker_follows_the_clock_through_the_schedule() {
        let now = Arc::new(Mutex::new(at("09:00:00")));
        let clock: Clock = {
            let now = now.clone();
            Arc::new(move || *now.lock().unwrap())
        };
        let second: Rotation = "A-2, B-3, C-4, D-1".parse().unwrap();
        let (_hardware, run) =
            controller_with(two_windows(), Arc::new(Stub(Duration::ZERO)), clock);
        run.start().unwrap();
        assert_eq!(run.assignment().window, WindowId(0));

        *now.lock().unwrap() = at("13:00:00");
        wait_for("the switch", || run.assignment().window == WindowId(1));
        assert_eq!(run.assignment().channel_at(p(2)), Some(Channel::A));

        // after hours the last rotation sticks
        *now.lock().unwrap() = at("17:00:00");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(run.assignment().rotation, second);

        // and a new day brings a midnight snapshot
        *now.lock().unwrap() = at("17:00:00") + chrono::Duration::days(1);
        wait_for("the midnight snapshot", || {
            run.snapshots()
                .iter()
                .any(|s| s.reason == SnapshotReason::Midnight)
        });
        run.shutdown();
    }

    #[test]
    fn manual_play_uses_the_current_rotation() {
        let (hardware, run) = controller();
        run.set_window_rotation(WindowId(0), "A-2, B-3, C-4, D-1".parse().unwrap())
            .unwrap();
        assert_eq!(run.play_channel_now(Channel::A).unwrap(), p(2));
        wait_for("the relay cycle", || {
            hardware.received(Command::SetRelay {
                position: p(2),
                on: false,
            })
        });
        assert!(hardware.received(Command::SetRelay {
            position: p(2),
            on: true,
        }));
        assert!(run.counts().totals().is_empty());
        assert!(matches!(
            run.set_window_rotation(WindowId(4), Rotation::IDENTITY),
            Err(RunError::Schedule(ScheduleError::UnknownWindow(_)))
        ));
        run.shutdown();
    }

    #[test]
    fn pinned_rotations_survive_ticks() {
        let (_hardware, run) = controller();
        let pinned: Rotation = "A-4, B-1, C-2, D-3".parse().unwrap();
        run.start().unwrap();
        run.override_rotation(Some(pinned));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(run.assignment().rotation, pinned);
        assert!(run.assignment().pinned);

        run.override_rotation(None);
        assert_eq!(run.assignment().rotation, Rotation::IDENTITY);
        run.shutdown();
    }

    #[test]
    fn file_selection_and_bad_lines_are_logged() {
        let (hardware, run) = controller();
        run.set_channel_files(Channel::A, vec![PathBuf::from("songs/a1.wav")]);
        assert_eq!(run.files(Channel::A), vec!["a1.wav"]);

        hardware.inject("X7");
        let log = run.log();
        wait_for("the parse failure", || {
            log.messages()
                .iter()
                .any(|m| m.starts_with("Could not read \"X7\""))
        });
        assert!(log
            .messages()
            .contains(&"Selected audio file for Song A: a1.wav".to_owned()));
        run.shutdown();
    }

    #[test]
    fn window_bounds_report_broken_chains() {
        let t = |s| NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap();
        let schedule = ScheduleTable::new(vec![
            TimeWindow {
                start: t("08:00:00"),
                end: Some(t("08:00:00")),
                rotation: Rotation::IDENTITY,
            },
            TimeWindow {
                start: t("08:00:00"),
                end: Some(t("12:00:00")),
                rotation: Rotation::IDENTITY,
            },
            TimeWindow {
                start: t("12:00:00"),
                end: Some(t("16:00:00")),
                rotation: Rotation::IDENTITY,
            },
        ])
        .unwrap();
        let (_hardware, run) = controller_with(schedule, Arc::new(Stub(Duration::ZERO)), system_clock());

        let warnings = run
            .set_window_bounds(WindowId(2), t("12:30:00"), t("16:00:00"))
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(run.windows()[2].start, t("12:30:00"));
        assert!(run
            .log()
            .messages()
            .iter()
            .any(|m| m.starts_with("Time error")));
        run.shutdown();
    }
}
