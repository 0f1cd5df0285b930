//! The live speaker assignment: which channel plays from which position
//! right now. It is derived from the schedule and swapped in whole, so a
//! reader always sees either the old mapping or the new one.

use crate::rotation::Rotation;
use crate::schedule::{Resolution, WindowId};
use crate::stimulus::{Channel, Position};

use std::sync::{Arc, Mutex};

/// A resolved position-to-channel mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakerAssignment {
    /// The window the mapping was resolved from; counts are filed under it.
    pub window: WindowId,
    #[allow(missing_docs)]
    pub rotation: Rotation,
    /// Set when the operator has pinned the rotation by hand and the
    /// schedule is being ignored.
    pub pinned: bool,
}

impl SpeakerAssignment {
    /// Apply a resolution.
    pub fn recompute(resolution: Resolution) -> Self {
        Self {
            window: resolution.window,
            rotation: resolution.rotation,
            pinned: false,
        }
    }

    /// The channel assigned to `position`, if any.
    pub fn channel_at(&self, position: Position) -> Option<Channel> {
        self.rotation.by_position().get(position.index()).copied()
    }

    /// The position `channel` currently plays from.
    pub fn position_of(&self, channel: Channel) -> Position {
        self.rotation.position_of(channel)
    }
}

/// Shared holder for the current [SpeakerAssignment]. Writers replace the
/// whole value; readers get an `Arc` to a mapping nobody will mutate.
#[derive(Debug)]
pub struct AssignmentCell {
    current: Mutex<Arc<SpeakerAssignment>>,
}

impl AssignmentCell {
    #[allow(missing_docs)]
    pub fn new(initial: SpeakerAssignment) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
        }
    }

    /// The mapping in effect right now.
    pub fn load(&self) -> Arc<SpeakerAssignment> {
        self.current.lock().unwrap().clone()
    }

    /// Swap in a new mapping, returning the one it replaced.
    pub fn store(&self, next: SpeakerAssignment) -> Arc<SpeakerAssignment> {
        std::mem::replace(&mut *self.current.lock().unwrap(), Arc::new(next))
    }
}
