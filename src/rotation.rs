//! A [Rotation] assigns the four stimulus channels to the four speaker
//! positions. Only permutations are representable, so every rotation that
//! exists has passed validation.
//!
//! Operators see rotations as labels listing, for each channel, the
//! position it plays from:
//!
//! ```text
//! A-4, B-1, C-2, D-3
//! ```
//!
//! Here song A plays from speaker 4, song B from speaker 1, and so on. The
//! full set of 24 rotations is generated by [Rotation::all] rather than
//! enumerated by hand.

use crate::stimulus::{Channel, Position};

use nom::{
    character::complete::{char, one_of, space0},
    combinator::{all_consuming, map},
    multi::separated_list1,
    sequence::{delimited, separated_pair},
    Finish, IResult,
};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, str::FromStr};

/// A channel-to-position assignment that is guaranteed to be a permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rotation([Channel; 4]);

/// Returned when a rotation is rejected at the point of entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// The label does not have the `A-1, B-2, C-3, D-4` shape.
    Unparsable(String),
    /// The label parsed, but repeats or omits a channel or a position.
    NotAPermutation(String),
}

impl fmt::Display for RotationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            RotationError::Unparsable(label) => {
                Cow::from(format!("invalid rotation {label:?}: expected a label like \"A-1, B-2, C-3, D-4\""))
            }
            RotationError::NotAPermutation(label) => Cow::from(format!(
                "invalid rotation {label:?}: every channel and every position must appear exactly once"
            )),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for RotationError {}

impl Rotation {
    /// Song A on speaker 1, B on 2, C on 3, D on 4.
    pub const IDENTITY: Rotation = Rotation(Channel::ALL);

    /// Build a rotation from the channel at each position (index 0 is
    /// position 1). Fails unless `by_position` is a permutation.
    pub fn new(by_position: [Channel; 4]) -> Result<Self, RotationError> {
        let mut seen = [false; 4];
        for c in by_position {
            if std::mem::replace(&mut seen[c.index()], true) {
                let label = by_position.iter().map(|c| c.letter()).collect();
                return Err(RotationError::NotAPermutation(label));
            }
        }
        Ok(Rotation(by_position))
    }

    /// All 24 rotations, in lexicographic order of the channels at
    /// positions 1 through 4.
    pub fn all() -> Vec<Rotation> {
        fn extend(prefix: &mut Vec<Channel>, out: &mut Vec<Rotation>) {
            if let [a, b, c, d] = prefix[..] {
                out.push(Rotation([a, b, c, d]));
                return;
            }
            for channel in Channel::ALL {
                if !prefix.contains(&channel) {
                    prefix.push(channel);
                    extend(prefix, out);
                    prefix.pop();
                }
            }
        }

        let mut out = Vec::with_capacity(24);
        extend(&mut Vec::with_capacity(4), &mut out);
        out
    }

    /// The channel playing from `position`.
    pub fn channel_at(&self, position: Position) -> Channel {
        self.0[position.index()]
    }

    /// The position `channel` plays from.
    pub fn position_of(&self, channel: Channel) -> Position {
        let idx = self
            .0
            .iter()
            .position(|c| *c == channel)
            .unwrap_or(channel.index());
        Position::ALL[idx]
    }

    /// The channels at positions 1 through 4.
    pub fn by_position(&self) -> [Channel; 4] {
        self.0
    }

    /// The operator-facing label, e.g. `A-4, B-1, C-2, D-3`.
    pub fn label(&self) -> String {
        Channel::ALL
            .iter()
            .map(|c| format!("{}-{}", c, self.position_of(*c)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::IDENTITY
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

fn parse_pair(s: &str) -> IResult<&str, (char, char)> {
    delimited(
        space0,
        separated_pair(one_of("ABCD"), char('-'), one_of("1234")),
        space0,
    )(s)
}

fn parse_label(s: &str) -> IResult<&str, Vec<(Channel, Position)>> {
    all_consuming(separated_list1(
        char(','),
        map(parse_pair, |(c, p)| {
            // `one_of` has already restricted both characters
            let channel = Channel::from_letter(c).unwrap_or(Channel::A);
            let position = Position::new(p as u8 - b'0').unwrap_or(Position::ALL[0]);
            (channel, position)
        }),
    ))(s)
}

impl FromStr for Rotation {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, pairs) = parse_label(s)
            .finish()
            .map_err(|_| RotationError::Unparsable(s.to_owned()))?;

        if pairs.len() != 4 {
            return Err(RotationError::NotAPermutation(s.to_owned()));
        }

        let mut by_position: [Option<Channel>; 4] = [None; 4];
        let mut seen_channels = [false; 4];
        for (channel, position) in pairs {
            let slot = &mut by_position[position.index()];
            if slot.is_some() || seen_channels[channel.index()] {
                return Err(RotationError::NotAPermutation(s.to_owned()));
            }
            *slot = Some(channel);
            seen_channels[channel.index()] = true;
        }

        match by_position {
            [Some(a), Some(b), Some(c), Some(d)] => Rotation::new([a, b, c, d]),
            _ => Err(RotationError::NotAPermutation(s.to_owned())),
        }
    }
}

impl TryFrom<String> for Rotation {
    type Error = RotationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rotation> for String {
    fn from(value: Rotation) -> Self {
        value.label()
    }
}
