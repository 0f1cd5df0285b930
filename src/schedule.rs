//! The time-of-day schedule that decides which [Rotation] is live.
//!
//! Windows are checked in declaration order and the first one containing
//! the current time wins; overlaps are settled by that order alone. Window 0
//! is the starting position, the rest are the operator's switches. When no
//! window matches, the last resolved rotation stays in effect.
//!
//! Operators write the end of the day as `00:00:00`. Inside a [TimeWindow]
//! the end of the day is `None`, so `Some(00:00:00)` is a real time and a
//! window from `00:00:00` to `Some(00:00:00)` is empty.

use crate::rotation::Rotation;

use chrono::{NaiveTime, Timelike};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt};

/// Index of a window in the schedule. 0 is the starting position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub usize);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "starting position"),
            n => write!(f, "switch {n}"),
        }
    }
}

/// `00:00:00`.
pub fn midnight() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 0).expect("00:00:00 is a valid time")
}

/// Turn an operator-entered end time into a window end: `00:00:00` is the
/// end of the day.
pub fn window_end(end: NaiveTime) -> Option<NaiveTime> {
    (!is_midnight(&end)).then_some(end)
}

fn is_midnight(t: &NaiveTime) -> bool {
    t.num_seconds_from_midnight() == 0 && t.nanosecond() == 0
}

/// A same-day interval `[start, end)` paired with the rotation to use
/// inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    #[allow(missing_docs)]
    pub start: NaiveTime,
    /// `None` runs to the end of the day.
    pub end: Option<NaiveTime>,
    #[allow(missing_docs)]
    pub rotation: Rotation,
}

impl TimeWindow {
    /// Does this window cover `now`?
    pub fn contains(&self, now: NaiveTime) -> bool {
        match self.end {
            None => self.start <= now,
            Some(end) => self.start <= now && now < end,
        }
    }

    /// A window whose end is before its start never matches, since windows
    /// do not wrap around midnight.
    pub fn is_inverted(&self) -> bool {
        self.end.is_some_and(|end| end < self.start)
    }

    /// True when the window ends where it starts and so never matches.
    pub fn is_empty(&self) -> bool {
        self.end == Some(self.start)
    }

    /// The end as operators write it, `00:00:00` for the end of the day.
    pub fn end_time(&self) -> NaiveTime {
        self.end.unwrap_or_else(midnight)
    }
}

/// What the resolver decided for a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// The window the rotation came from.
    pub window: WindowId,
    #[allow(missing_docs)]
    pub rotation: Rotation,
    /// `false` when no window contained the time and the previous
    /// resolution was reused.
    pub matched: bool,
}

/// A non-fatal inconsistency in the schedule, found by
/// [ScheduleTable::chain_warnings].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainWarning {
    /// A switch does not start where the previous switch ended.
    BrokenChain {
        #[allow(missing_docs)]
        window: WindowId,
        #[allow(missing_docs)]
        expected_start: NaiveTime,
        #[allow(missing_docs)]
        actual_start: NaiveTime,
    },
    /// The window ends before it starts and can never be active.
    Inverted(WindowId),
}

impl fmt::Display for ChainWarning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainWarning::BrokenChain {
                window,
                expected_start,
                actual_start,
            } => write!(
                f,
                "{window} starts at {actual_start} but the previous switch ends at {expected_start}"
            ),
            ChainWarning::Inverted(window) => write!(f, "{window} ends before it starts"),
        }
    }
}

/// Errors raised when the schedule is built or edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// A schedule needs at least the starting-position window.
    Empty,
    /// No window has this id.
    UnknownWindow(WindowId),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ScheduleError::Empty => Cow::from("the schedule has no windows"),
            ScheduleError::UnknownWindow(id) => Cow::from(format!("there is no {id}")),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ScheduleError {}

/// The ordered list of windows plus the sticky fallback.
#[derive(Debug, Clone)]
pub struct ScheduleTable {
    windows: Vec<TimeWindow>,
    sticky: Resolution,
}

impl ScheduleTable {
    /// Build a table from windows in priority order. The first window is
    /// the starting position and seeds the sticky fallback.
    pub fn new(windows: Vec<TimeWindow>) -> Result<Self, ScheduleError> {
        let first = windows.first().ok_or(ScheduleError::Empty)?;
        let sticky = Resolution {
            window: WindowId(0),
            rotation: first.rotation,
            matched: false,
        };
        let table = Self { windows, sticky };
        for warning in table.chain_warnings() {
            warn!("Schedule: {}", warning);
        }
        Ok(table)
    }

    /// A single window covering the whole day.
    pub fn all_day(rotation: Rotation) -> Self {
        Self {
            windows: vec![TimeWindow {
                start: midnight(),
                end: None,
                rotation,
            }],
            sticky: Resolution {
                window: WindowId(0),
                rotation,
                matched: false,
            },
        }
    }

    #[allow(missing_docs)]
    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    /// The rotation in effect at `now`. Never fails: with no matching
    /// window the most recent resolution is returned again.
    pub fn resolve_active(&mut self, now: NaiveTime) -> Resolution {
        let hit = self
            .windows
            .iter()
            .enumerate()
            .find(|(_, w)| w.contains(now));

        match hit {
            Some((idx, window)) => {
                self.sticky = Resolution {
                    window: WindowId(idx),
                    rotation: window.rotation,
                    matched: true,
                };
                self.sticky
            }
            None => Resolution {
                matched: false,
                ..self.sticky
            },
        }
    }

    /// Forget whatever was resolved during a previous run; the starting
    /// position becomes the fallback again.
    pub fn reset_sticky(&mut self) {
        self.sticky = Resolution {
            window: WindowId(0),
            rotation: self.windows[0].rotation,
            matched: false,
        };
    }

    /// Change the rotation of one window.
    pub fn set_rotation(&mut self, id: WindowId, rotation: Rotation) -> Result<(), ScheduleError> {
        let window = self
            .windows
            .get_mut(id.0)
            .ok_or(ScheduleError::UnknownWindow(id))?;
        window.rotation = rotation;
        if self.sticky.window == id {
            self.sticky.rotation = rotation;
        }
        Ok(())
    }

    /// Move one window's boundaries. Neighbouring windows are left alone,
    /// so this can break the chain; the break is reported, not refused.
    pub fn set_bounds(
        &mut self,
        id: WindowId,
        start: NaiveTime,
        end: Option<NaiveTime>,
    ) -> Result<Vec<ChainWarning>, ScheduleError> {
        let window = self
            .windows
            .get_mut(id.0)
            .ok_or(ScheduleError::UnknownWindow(id))?;
        window.start = start;
        window.end = end;

        let warnings = self.chain_warnings();
        for warning in &warnings {
            warn!("Schedule: {}", warning);
        }
        Ok(warnings)
    }

    /// Switch windows are expected to form a chain where each one starts
    /// where the previous one ends. Reports every link that does not.
    pub fn chain_warnings(&self) -> Vec<ChainWarning> {
        let inverted = self
            .windows
            .iter()
            .enumerate()
            .filter(|(_, w)| w.is_inverted())
            .map(|(i, _)| ChainWarning::Inverted(WindowId(i)));

        // pair k is (window k, window k + 1); the starting position is not
        // part of the chain
        let broken = self
            .windows
            .windows(2)
            .enumerate()
            .skip(1)
            .filter(|(_, pair)| pair[1].start != pair[0].end_time())
            .map(|(k, pair)| ChainWarning::BrokenChain {
                window: WindowId(k + 1),
                expected_start: pair[0].end_time(),
                actual_start: pair[1].start,
            });

        inverted.chain(broken).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap()
    }

    fn rot(label: &str) -> Rotation {
        label.parse().unwrap()
    }

    fn window(start: &str, end: &str, label: &str) -> TimeWindow {
        TimeWindow {
            start: t(start),
            end: window_end(t(end)),
            rotation: rot(label),
        }
    }

    fn two_switch_table() -> ScheduleTable {
        ScheduleTable::new(vec![
            window("08:00:00", "08:00:00", "A-1, B-2, C-3, D-4"),
            window("08:00:00", "12:00:00", "A-4, B-1, C-2, D-3"),
            window("12:00:00", "16:00:00", "A-3, B-4, C-1, D-2"),
        ])
        .unwrap()
    }

    #[test]
    fn every_rotation_resolves_from_an_all_day_window() {
        for rotation in Rotation::all() {
            let mut table = ScheduleTable::new(vec![window("00:00:00", "00:00:00", "A-1, B-2, C-3, D-4")]).unwrap();
            table.set_rotation(WindowId(0), rotation).unwrap();
            for now in ["00:00:00", "06:30:00", "23:59:59"] {
                let res = table.resolve_active(t(now));
                assert!(res.matched);
                assert_eq!(res.rotation, rotation);
            }
        }
    }

    #[test]
    fn switches_apply_inside_their_windows() {
        let mut table = two_switch_table();
        assert_eq!(table.resolve_active(t("09:00:00")).window, WindowId(1));
        assert_eq!(table.resolve_active(t("12:00:00")).window, WindowId(2));
        assert_eq!(
            table.resolve_active(t("15:59:59")).rotation,
            rot("A-3, B-4, C-1, D-2")
        );
    }

    #[test]
    fn outside_every_window_the_last_rotation_sticks() {
        let mut table = two_switch_table();

        let before = table.resolve_active(t("07:00:00"));
        assert!(!before.matched);
        assert_eq!(before.window, WindowId(0));
        assert_eq!(before.rotation, rot("A-1, B-2, C-3, D-4"));

        table.resolve_active(t("13:00:00"));
        let after = table.resolve_active(t("20:00:00"));
        assert!(!after.matched);
        assert_eq!(after.window, WindowId(2));
        assert_eq!(after.rotation, rot("A-3, B-4, C-1, D-2"));

        table.reset_sticky();
        assert_eq!(table.resolve_active(t("20:00:00")).window, WindowId(0));
    }

    #[test]
    fn earlier_windows_win_overlaps() {
        let mut table = ScheduleTable::new(vec![
            window("08:00:00", "08:00:00", "A-1, B-2, C-3, D-4"),
            window("08:00:00", "14:00:00", "A-4, B-1, C-2, D-3"),
            window("10:00:00", "16:00:00", "A-3, B-4, C-1, D-2"),
        ])
        .unwrap();
        assert_eq!(table.resolve_active(t("11:00:00")).window, WindowId(1));
        assert_eq!(table.resolve_active(t("15:00:00")).window, WindowId(2));
    }

    #[test]
    fn broken_chains_are_reported() {
        let table = ScheduleTable::new(vec![
            window("08:00:00", "08:00:00", "A-1, B-2, C-3, D-4"),
            window("08:00:00", "12:00:00", "A-4, B-1, C-2, D-3"),
            window("12:30:00", "11:00:00", "A-3, B-4, C-1, D-2"),
        ])
        .unwrap();
        let warnings = table.chain_warnings();
        assert!(warnings.contains(&ChainWarning::Inverted(WindowId(2))));
        assert!(warnings.contains(&ChainWarning::BrokenChain {
            window: WindowId(2),
            expected_start: t("12:00:00"),
            actual_start: t("12:30:00"),
        }));
        assert!(two_switch_table().chain_warnings().is_empty());
    }

    #[test]
    fn gaps_do_not_break_resolution() {
        let mut table = two_switch_table();
        table
            .set_bounds(WindowId(2), t("13:00:00"), Some(t("16:00:00")))
            .unwrap();
        table.resolve_active(t("11:00:00"));
        let gap = table.resolve_active(t("12:30:00"));
        assert!(!gap.matched);
        assert_eq!(gap.window, WindowId(1));
    }

    #[test]
    fn a_window_ending_where_it_starts_is_empty() {
        let empty = TimeWindow {
            start: midnight(),
            end: Some(midnight()),
            rotation: Rotation::IDENTITY,
        };
        assert!(empty.is_empty());
        for now in ["00:00:00", "12:00:00", "23:59:59"] {
            assert!(!empty.contains(t(now)));
        }

        let all_day = TimeWindow { end: None, ..empty };
        assert!(!all_day.is_empty());
        assert!(all_day.contains(t("23:59:59")));
        assert_eq!(all_day.end_time(), midnight());
    }

    #[test]
    fn editing_an_unknown_window_fails() {
        let mut table = two_switch_table();
        assert_eq!(
            table.set_rotation(WindowId(9), Rotation::IDENTITY),
            Err(ScheduleError::UnknownWindow(WindowId(9)))
        );
        assert_eq!(ScheduleTable::new(vec![]).unwrap_err(), ScheduleError::Empty);
    }
}
