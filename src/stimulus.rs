//! The two axes of the experiment: the four stimulus [Channel]s (the songs)
//! and the four physical [Position]s (perch + speaker pairs), plus the
//! operator's selection of audio files for each channel.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// A logical stimulus channel. Each channel owns an ordered list of audio
/// files that are played whenever a perch mapped to it is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[allow(missing_docs)]
    A,
    #[allow(missing_docs)]
    B,
    #[allow(missing_docs)]
    C,
    #[allow(missing_docs)]
    D,
}

impl Channel {
    /// All channels, in label order.
    pub const ALL: [Channel; 4] = [Channel::A, Channel::B, Channel::C, Channel::D];

    /// Zero-based index, `A` is 0.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The channel's letter as it appears in rotation labels.
    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }

    /// Look a channel up by its letter, case sensitive.
    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'A' => Some(Channel::A),
            'B' => Some(Channel::B),
            'C' => Some(Channel::C),
            'D' => Some(Channel::D),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A physical perch/speaker position, numbered 1 through 4. The hardware
/// names the perch sensors with letters, sensor `A` sits at position 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Position(u8);

impl Position {
    /// All positions, in ascending order.
    pub const ALL: [Position; 4] = [Position(1), Position(2), Position(3), Position(4)];

    /// Returns `None` for anything outside `1..=4`.
    pub fn new(number: u8) -> Option<Self> {
        (1..=4).contains(&number).then_some(Position(number))
    }

    /// The one-based position number used on the wire.
    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based index into per-position arrays.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// The letter the hardware uses for the perch sensor at this position.
    pub fn sensor(self) -> char {
        (b'A' + self.0 - 1) as char
    }

    /// Inverse of [Position::sensor].
    pub fn from_sensor(c: char) -> Option<Self> {
        match c {
            'A'..='D' => Some(Position(c as u8 - b'A' + 1)),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Position {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Position::new(value).ok_or_else(|| format!("position {value} is not in 1..=4"))
    }
}

impl From<Position> for u8 {
    fn from(value: Position) -> Self {
        value.0
    }
}

/// The operator's audio selection: an ordered list of files for each
/// channel. Empty lists are valid and turn a trigger into a logged no-op.
///
/// Keeping files unique across channels is the job of whoever fills this in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StimulusLibrary {
    files: [Vec<PathBuf>; 4],
}

impl StimulusLibrary {
    /// An empty library, no channel has any sound selected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the file list of `channel`.
    pub fn set_files(&mut self, channel: Channel, files: Vec<PathBuf>) {
        self.files[channel.index()] = files;
    }

    /// The files selected for `channel`, in playback order.
    pub fn files(&self, channel: Channel) -> &[PathBuf] {
        &self.files[channel.index()]
    }

    /// Just the file names of `channel`'s files, for log messages.
    pub fn file_names(&self, channel: Channel) -> Vec<String> {
        self.files(channel).iter().map(|p| display_name(p)).collect()
    }
}

/// The final component of `path`, or the whole path if it has none.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensors_map_to_positions() {
        assert_eq!(Position::from_sensor('A'), Position::new(1));
        assert_eq!(Position::from_sensor('D'), Position::new(4));
        assert_eq!(Position::from_sensor('E'), None);
        assert_eq!(Position::from_sensor('a'), None);
        for p in Position::ALL {
            assert_eq!(Position::from_sensor(p.sensor()), Some(p));
        }
    }

    #[test]
    fn positions_are_bounded() {
        assert!(Position::new(0).is_none());
        assert!(Position::new(5).is_none());
        assert_eq!(Position::new(3).map(Position::index), Some(2));
    }

    #[test]
    fn channel_letters_round_trip() {
        for c in Channel::ALL {
            assert_eq!(Channel::from_letter(c.letter()), Some(c));
        }
        assert_eq!(Channel::from_letter('X'), None);
    }

    #[test]
    fn library_keeps_order() {
        let mut lib = StimulusLibrary::new();
        lib.set_files(
            Channel::B,
            vec![PathBuf::from("/songs/b2.wav"), PathBuf::from("/songs/b1.wav")],
        );
        assert!(lib.files(Channel::A).is_empty());
        assert_eq!(lib.file_names(Channel::B), vec!["b2.wav", "b1.wav"]);
    }
}
