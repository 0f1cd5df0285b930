//! Decodes the unsolicited lines the perch controller sends when a perch is
//! crossed. A line is the sensor letter followed by the cumulative count
//! for that sensor, e.g. `A37`.

use crate::stimulus::Position;

use nom::{
    character::complete::{anychar, digit1},
    combinator::all_consuming,
    sequence::pair,
    Finish, IResult,
};
use std::{borrow::Cow, fmt, str::FromStr};

/// A perch crossing reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerchEvent {
    /// The position whose perch was crossed.
    pub position: Position,
    /// The hardware's cumulative count for that perch.
    pub count: u32,
}

/// Why a line could not be decoded into a [PerchEvent].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// Fewer than two characters.
    TooShort(String),
    /// The first character does not name one of the four sensors.
    UnknownSensor(String),
    /// Whatever follows the sensor letter is not a non-negative integer.
    BadCount(String),
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ParseFailure::TooShort(line) => Cow::from(format!("line too short: {line:?}")),
            ParseFailure::UnknownSensor(line) => Cow::from(format!("unknown sensor in {line:?}")),
            ParseFailure::BadCount(line) => Cow::from(format!("bad count in {line:?}")),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ParseFailure {}

fn parse_perch_line(s: &str) -> IResult<&str, (char, &str)> {
    all_consuming(pair(anychar, digit1))(s)
}

/// Decode one line. Never panics; every malformed line comes back as a
/// [ParseFailure] so the caller can log it and keep reading.
pub fn parse(line: &str) -> Result<PerchEvent, ParseFailure> {
    if line.chars().count() < 2 {
        return Err(ParseFailure::TooShort(line.to_owned()));
    }

    let (sensor, digits) = match parse_perch_line(line).finish() {
        Ok((_, parsed)) => parsed,
        Err(_) => return Err(ParseFailure::BadCount(line.to_owned())),
    };

    let position =
        Position::from_sensor(sensor).ok_or_else(|| ParseFailure::UnknownSensor(line.to_owned()))?;

    // digit1 guarantees the shape, this only fails on overflow
    let count = digits
        .parse::<u32>()
        .map_err(|_| ParseFailure::BadCount(line.to_owned()))?;

    Ok(PerchEvent { position, count })
}

/// True if `line` decodes as a perch event. Used to keep events apart from
/// command responses.
pub fn looks_like_event(line: &str) -> bool {
    parse(line).is_ok()
}

impl FromStr for PerchEvent {
    type Err = ParseFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_1() {
        assert_eq!(
            parse("A37"),
            Ok(PerchEvent {
                position: Position::new(1).unwrap(),
                count: 37,
            })
        );
    }

    #[test]
    fn test_2() {
        assert_eq!(
            parse("D0"),
            Ok(PerchEvent {
                position: Position::new(4).unwrap(),
                count: 0,
            })
        );
    }

    #[test]
    fn short_lines_fail() {
        assert_eq!(parse("X"), Err(ParseFailure::TooShort("X".to_owned())));
        assert_eq!(parse(""), Err(ParseFailure::TooShort("".to_owned())));
    }

    #[test]
    fn negative_and_non_numeric_counts_fail() {
        assert_eq!(parse("A-1"), Err(ParseFailure::BadCount("A-1".to_owned())));
        assert_eq!(parse("B12x"), Err(ParseFailure::BadCount("B12x".to_owned())));
        assert_eq!(parse("ok"), Err(ParseFailure::BadCount("ok".to_owned())));
        assert!(parse("C99999999999").is_err());
    }

    #[test]
    fn unknown_sensor_fails() {
        assert_eq!(parse("X7"), Err(ParseFailure::UnknownSensor("X7".to_owned())));
        assert_eq!(parse("a7"), Err(ParseFailure::UnknownSensor("a7".to_owned())));
    }

    #[test]
    fn from_str_matches_parse() {
        assert_eq!("C5".parse::<PerchEvent>(), parse("C5"));
    }
}
