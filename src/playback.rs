//! Audio playback as seen by the dispatcher: play one file to completion,
//! or until the run is stopped.
//!
//! [ClipTimer] only holds for the length of the clip and is what simulated
//! runs use. With the `audio` feature, [CpalPlayer] sends the clip to the
//! default output device; the relays then route it to the right speaker.

use hound::WavReader;
use std::{
    borrow::Cow,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[cfg(feature = "audio")]
mod speaker;
#[cfg(feature = "audio")]
pub use speaker::CpalPlayer;

/// How often a playing clip checks for cancellation.
pub const CANCEL_POLL: Duration = Duration::from_millis(10);

/// A shared flag that tells in-progress playback to give up.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this token to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[allow(missing_docs)]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Make the token usable again once everyone has stopped.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a file did not play to the end.
#[derive(Debug)]
pub enum PlaybackError {
    /// The file is not there.
    FileNotFound(PathBuf),
    /// The file is there but is not a WAV file we can read.
    Decode(hound::Error),
    /// The output device refused to play.
    Device(String),
    /// Playback was stopped through the [CancelToken].
    Cancelled,
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            PlaybackError::FileNotFound(path) => Cow::from(format!("file not found: {}", path.display())),
            PlaybackError::Decode(error) => Cow::from(format!("could not decode audio: {}", error)),
            PlaybackError::Device(error) => Cow::from(format!("audio device error: {}", error)),
            PlaybackError::Cancelled => Cow::from("playback cancelled"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for PlaybackError {}

impl From<hound::Error> for PlaybackError {
    fn from(value: hound::Error) -> Self {
        Self::Decode(value)
    }
}

/// Something that can play an audio file and block until it is done.
pub trait Playback: Send + Sync {
    /// Play `path` to the end. Must return [PlaybackError::Cancelled]
    /// shortly after `cancel` fires.
    fn play(&self, path: &Path, cancel: &CancelToken) -> Result<(), PlaybackError>;
}

/// Stands in for a speaker: reads the clip's length and waits that long.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipTimer;

impl ClipTimer {
    /// The length of the WAV file at `path`.
    pub fn clip_length(path: &Path) -> Result<Duration, PlaybackError> {
        if !path.exists() {
            return Err(PlaybackError::FileNotFound(path.to_owned()));
        }
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(PlaybackError::Decode(hound::Error::FormatError(
                "sample rate of zero",
            )));
        }
        Ok(Duration::from_secs_f64(
            reader.duration() as f64 / spec.sample_rate as f64,
        ))
    }
}

impl Playback for ClipTimer {
    fn play(&self, path: &Path, cancel: &CancelToken) -> Result<(), PlaybackError> {
        let length = Self::clip_length(path)?;
        hold(length, cancel)
    }
}

/// Sleep for `length` in short slices, giving up early when cancelled.
pub fn hold(length: Duration, cancel: &CancelToken) -> Result<(), PlaybackError> {
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(PlaybackError::Cancelled);
        }
        let elapsed = start.elapsed();
        if elapsed >= length {
            return Ok(());
        }
        spin_sleep::sleep((length - elapsed).min(CANCEL_POLL));
    }
}
