//! Experiment configuration, read from a RON file.
//!
//! ```ron
//! (
//!     experiment: "pilot",
//!     subject: "Zebra finch",
//!     perch_timeout_ms: 200,
//!     start: (rotation: "A-1, B-2, C-3, D-4", start: "08:00:00", end: "16:00:00"),
//!     switches: [
//!         (rotation: "A-2, B-3, C-4, D-1", end: "12:00:00"),
//!         (rotation: "A-3, B-4, C-1, D-2", end: "16:00:00"),
//!     ],
//!     files: (a: ["songs/a1.wav"], b: ["songs/b1.wav"]),
//! )
//! ```
//!
//! Every field has a default. A switch without a `start` begins where the
//! previous one ended, and the first switch begins at the overall start.

use crate::dispatcher::DEFAULT_QUEUE_DEPTH;
use crate::rotation::Rotation;
use crate::run_controller::RunSettings;
use crate::schedule::{midnight, window_end, ChainWarning, ScheduleError, ScheduleTable, TimeWindow};
use crate::serial_link::{LinkSettings, SUPPORTED_BAUD_RATES};
use crate::stimulus::{Channel, StimulusLibrary};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, io, path::Path, path::PathBuf, time::Duration};

/// Most switch windows an experiment can have.
pub const MAX_SWITCHES: usize = 6;

fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, s).unwrap_or_else(midnight)
}

/// Everything needed to run one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    #[allow(missing_docs)]
    pub experiment: String,
    /// The species being tested.
    pub subject: String,
    /// Perch debounce sent to the controller as `sd{ms}`.
    pub perch_timeout_ms: u32,
    #[allow(missing_docs)]
    pub serial: SerialConfig,
    #[allow(missing_docs)]
    pub timing: TimingConfig,
    /// Triggers a busy position may hold before rejecting more.
    pub queue_depth: usize,
    /// The starting position and the overall experiment hours.
    pub start: StartConfig,
    #[allow(missing_docs)]
    pub switches: Vec<SwitchConfig>,
    #[allow(missing_docs)]
    pub files: FilesConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment: "experiment".to_owned(),
            subject: "subject".to_owned(),
            perch_timeout_ms: 200,
            serial: SerialConfig::default(),
            timing: TimingConfig::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            start: StartConfig::default(),
            switches: Vec::new(),
            files: FilesConfig::default(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Ports to try, in order. Empty means every port the system reports.
    pub ports: Vec<PathBuf>,
    /// Wait after opening a port before talking to it.
    pub settle_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            ports: Vec::new(),
            settle_ms: 2000,
            response_timeout_ms: 1000,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How often the schedule is re-resolved.
    pub tick_ms: u64,
    pub snapshot_ms: u64,
    /// Take an extra snapshot when the date changes.
    pub midnight_snapshot: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5000,
            snapshot_ms: 5000,
            midnight_snapshot: true,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartConfig {
    pub rotation: Rotation,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            rotation: Rotation::IDENTITY,
            start: hms(8, 0, 0),
            end: hms(16, 0, 0),
        }
    }
}

/// One switch window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[allow(missing_docs)]
    pub rotation: Rotation,
    /// Defaults to the previous window's end.
    #[serde(default)]
    pub start: Option<NaiveTime>,
    #[allow(missing_docs)]
    pub end: NaiveTime,
}

/// Stimulus files per channel, played in the order given.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub a: Vec<PathBuf>,
    pub b: Vec<PathBuf>,
    pub c: Vec<PathBuf>,
    pub d: Vec<PathBuf>,
}

/// A configuration that cannot be used.
#[derive(Debug)]
pub enum ConfigError {
    #[allow(missing_docs)]
    Io(io::Error),
    /// The file is not valid RON, or a field has the wrong form (including
    /// rotation labels that are not permutations).
    Ron(ron::error::SpannedError),
    #[allow(missing_docs)]
    Schedule(ScheduleError),
    /// Values that parse but make no sense.
    Invalid(Cow<'static, str>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::Io(e) => Cow::from(format!("could not read config: {e}")),
            ConfigError::Ron(e) => Cow::from(format!("bad config: {e}")),
            ConfigError::Schedule(e) => Cow::from(format!("bad schedule: {e}")),
            ConfigError::Invalid(msg) => msg.clone(),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::error::SpannedError> for ConfigError {
    fn from(value: ron::error::SpannedError) -> Self {
        Self::Ron(value)
    }
}

impl From<ScheduleError> for ConfigError {
    fn from(value: ScheduleError) -> Self {
        Self::Schedule(value)
    }
}

/// Something in the configuration that is probably a mistake but does not
/// stop the experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The first switch should begin when the experiment does.
    FirstSwitchStart {
        #[allow(missing_docs)]
        expected: NaiveTime,
        #[allow(missing_docs)]
        actual: NaiveTime,
    },
    /// The last switch should end when the experiment does.
    LastSwitchEnd {
        #[allow(missing_docs)]
        expected: NaiveTime,
        #[allow(missing_docs)]
        actual: NaiveTime,
    },
    /// The controller firmware only talks at a few rates.
    UnsupportedBaud(u32),
    #[allow(missing_docs)]
    Schedule(ChainWarning),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::FirstSwitchStart { expected, actual } => write!(
                f,
                "first switch starts at {actual}, not at the overall start {expected}"
            ),
            ConfigWarning::LastSwitchEnd { expected, actual } => write!(
                f,
                "last switch ends at {actual}, not at the overall end {expected}"
            ),
            ConfigWarning::UnsupportedBaud(baud) => write!(
                f,
                "baud rate {baud} is not one of {SUPPORTED_BAUD_RATES:?}"
            ),
            ConfigWarning::Schedule(w) => write!(f, "{w}"),
        }
    }
}

impl ExperimentConfig {
    /// Read and check a RON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    /// The schedule windows, starting position first. Switch starts that
    /// were left out are filled in from the previous end.
    ///
    /// The starting position ends where the first switch starts. That is a
    /// time of day, not an end of day, so a switch starting right at the
    /// overall start leaves the starting position empty even at midnight.
    pub fn windows(&self) -> Vec<TimeWindow> {
        let starting_end = match self.switches.first() {
            Some(first) => Some(first.start.unwrap_or(self.start.start)),
            None => window_end(self.start.end),
        };

        let mut windows = vec![TimeWindow {
            start: self.start.start,
            end: starting_end,
            rotation: self.start.rotation,
        }];

        let mut previous_end = self.start.start;
        for switch in &self.switches {
            let start = switch.start.unwrap_or(previous_end);
            windows.push(TimeWindow {
                start,
                end: window_end(switch.end),
                rotation: switch.rotation,
            });
            previous_end = switch.end;
        }
        windows
    }

    #[allow(missing_docs)]
    pub fn schedule(&self) -> Result<ScheduleTable, ConfigError> {
        Ok(ScheduleTable::new(self.windows())?)
    }

    #[allow(missing_docs)]
    pub fn library(&self) -> StimulusLibrary {
        let mut library = StimulusLibrary::new();
        let FilesConfig { a, b, c, d } = &self.files;
        for (channel, files) in Channel::ALL.into_iter().zip([a, b, c, d]) {
            library.set_files(channel, files.clone());
        }
        library
    }

    #[allow(missing_docs)]
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            response_timeout: Duration::from_millis(self.serial.response_timeout_ms),
        }
    }

    #[allow(missing_docs)]
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            experiment: self.experiment.clone(),
            subject: self.subject.clone(),
            perch_timeout_ms: self.perch_timeout_ms,
            tick: Duration::from_millis(self.timing.tick_ms),
            snapshot_every: Duration::from_millis(self.timing.snapshot_ms),
            midnight_snapshot: self.timing.midnight_snapshot,
            queue_depth: self.queue_depth,
        }
    }

    /// Hard errors first, then everything worth a warning.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if self.switches.len() > MAX_SWITCHES {
            return Err(ConfigError::Invalid(
                format!(
                    "{} switches configured, at most {MAX_SWITCHES} are supported",
                    self.switches.len()
                )
                .into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be at least 1".into()));
        }
        if self.timing.tick_ms == 0 || self.timing.snapshot_ms == 0 {
            return Err(ConfigError::Invalid("timer intervals must be above zero".into()));
        }

        let mut warnings = Vec::new();
        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            warnings.push(ConfigWarning::UnsupportedBaud(self.serial.baud_rate));
        }

        let windows = self.windows();
        if let (Some(first), Some(last)) = (windows.get(1), windows.last()) {
            if first.start != self.start.start {
                warnings.push(ConfigWarning::FirstSwitchStart {
                    expected: self.start.start,
                    actual: first.start,
                });
            }
            if last.end != window_end(self.start.end) {
                warnings.push(ConfigWarning::LastSwitchEnd {
                    expected: self.start.end,
                    actual: last.end_time(),
                });
            }
        }
        warnings.extend(
            self.schedule()?
                .chain_warnings()
                .into_iter()
                .map(ConfigWarning::Schedule),
        );
        Ok(warnings)
    }
}

impl std::str::FromStr for ExperimentConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: ExperimentConfig = ron::de::from_str(s)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::WindowId;

    const PILOT: &str = r#"(
        experiment: "pilot",
        subject: "Zebra finch",
        perch_timeout_ms: 250,
        start: (rotation: "A-1, B-2, C-3, D-4", start: "08:00:00", end: "16:00:00"),
        switches: [
            (rotation: "A-2, B-3, C-4, D-1", end: "12:00:00"),
            (rotation: "A-3, B-4, C-1, D-2", end: "16:00:00"),
        ],
        files: (a: ["a1.wav", "a2.wav"], c: ["c1.wav"]),
    )"#;

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap()
    }

    #[test]
    fn defaults_fill_everything_in() {
        let config: ExperimentConfig = "()".parse().unwrap();
        assert_eq!(config, ExperimentConfig::default());
        assert_eq!(config.perch_timeout_ms, 200);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.start.start, t("08:00:00"));
        assert_eq!(config.start.end, t("16:00:00"));
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn switch_starts_chain_from_previous_ends() {
        let config: ExperimentConfig = PILOT.parse().unwrap();
        let windows = config.windows();

        assert_eq!(windows.len(), 3);
        // the first switch takes over right at the start
        assert_eq!((windows[0].start, windows[0].end), (t("08:00:00"), Some(t("08:00:00"))));
        assert!(windows[0].is_empty());
        assert_eq!((windows[1].start, windows[1].end), (t("08:00:00"), Some(t("12:00:00"))));
        assert_eq!((windows[2].start, windows[2].end), (t("12:00:00"), Some(t("16:00:00"))));
        assert!(config.validate().unwrap().is_empty());

        let mut schedule = config.schedule().unwrap();
        let r = schedule.resolve_active(t("13:00:00"));
        assert_eq!(r.window, WindowId(2));
        assert_eq!(r.rotation, "A-3, B-4, C-1, D-2".parse().unwrap());
    }

    #[test]
    fn switches_take_over_a_day_that_starts_at_midnight() {
        let text = r#"(
            start: (rotation: "A-1, B-2, C-3, D-4", start: "00:00:00", end: "00:00:00"),
            switches: [
                (rotation: "A-2, B-3, C-4, D-1", end: "12:00:00"),
                (rotation: "A-3, B-4, C-1, D-2", end: "00:00:00"),
            ],
        )"#;
        let config: ExperimentConfig = text.parse().unwrap();
        let windows = config.windows();
        assert!(windows[0].is_empty());
        assert_eq!(windows[2].end, None);
        assert!(config.validate().unwrap().is_empty());

        let mut schedule = config.schedule().unwrap();
        assert_eq!(schedule.resolve_active(t("00:00:00")).window, WindowId(1));
        assert_eq!(schedule.resolve_active(t("09:00:00")).window, WindowId(1));
        let late = schedule.resolve_active(t("15:00:00"));
        assert_eq!(late.window, WindowId(2));
        assert_eq!(late.rotation, "A-3, B-4, C-1, D-2".parse().unwrap());
        assert!(late.matched);
    }

    #[test]
    fn without_switches_a_midnight_start_covers_the_day() {
        let text = r#"(start: (rotation: "A-4, B-3, C-2, D-1", start: "00:00:00", end: "00:00:00"))"#;
        let config: ExperimentConfig = text.parse().unwrap();
        assert_eq!(config.windows()[0].end, None);

        let mut schedule = config.schedule().unwrap();
        let r = schedule.resolve_active(t("23:30:00"));
        assert!(r.matched);
        assert_eq!(r.window, WindowId(0));
    }

    #[test]
    fn files_land_on_their_channels() {
        let config: ExperimentConfig = PILOT.parse().unwrap();
        let library = config.library();
        assert_eq!(library.file_names(Channel::A), vec!["a1.wav", "a2.wav"]);
        assert!(library.files(Channel::B).is_empty());
        assert_eq!(library.file_names(Channel::C), vec!["c1.wav"]);
    }

    #[test]
    fn bad_rotation_labels_are_rejected() {
        let text = r#"(start: (rotation: "A-1, B-1, C-3, D-4"))"#;
        assert!(matches!(
            text.parse::<ExperimentConfig>(),
            Err(ConfigError::Ron(_))
        ));
    }

    #[test]
    fn mismatched_hours_are_only_warnings() {
        let text = r#"(
            serial: (baud_rate: 4800),
            switches: [
                (rotation: "A-2, B-3, C-4, D-1", start: "09:00:00", end: "12:00:00"),
                (rotation: "A-3, B-4, C-1, D-2", start: "12:30:00", end: "15:00:00"),
            ],
        )"#;
        let config: ExperimentConfig = text.parse().unwrap();
        let warnings = config.validate().unwrap();

        assert!(warnings.contains(&ConfigWarning::UnsupportedBaud(4800)));
        assert!(warnings.contains(&ConfigWarning::FirstSwitchStart {
            expected: t("08:00:00"),
            actual: t("09:00:00"),
        }));
        assert!(warnings.contains(&ConfigWarning::LastSwitchEnd {
            expected: t("16:00:00"),
            actual: t("15:00:00"),
        }));
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::Schedule(ChainWarning::BrokenChain { .. })
        )));
    }

    #[test]
    fn too_many_switches_is_an_error() {
        let mut config = ExperimentConfig::default();
        config.switches = vec![
            SwitchConfig {
                rotation: Rotation::IDENTITY,
                start: None,
                end: t("16:00:00"),
            };
            MAX_SWITCHES + 1
        ];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.ron");
        fs::write(&path, PILOT).unwrap();

        let config = ExperimentConfig::from_path(&path).unwrap();
        assert_eq!(config.experiment, "pilot");
        assert_eq!(config.run_settings().perch_timeout_ms, 250);

        assert!(matches!(
            ExperimentConfig::from_path(dir.path().join("missing.ron")),
            Err(ConfigError::Io(_))
        ));
    }
}
