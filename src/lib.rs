//! 4CT runs a four-perch playback experiment. Four perches each carry a
//! sensor and a speaker; four song channels (A to D) are spread over the
//! speakers by a rotation that changes with the time of day. When a bird
//! crosses a perch, the song assigned to that position right now is played
//! through it and the controller's crossing count is filed under the active
//! time window.
//!
//! The pieces, from the wire up:
//!
//! - [serial_link] owns the connection to the perch controller and keeps
//!   exactly one command in flight at a time.
//! - [hardware_message_decoder] turns controller lines like `A37` into
//!   [PerchEvent](hardware_message_decoder::PerchEvent)s.
//! - [schedule] and [assignment] decide which channel plays where.
//! - [dispatcher] runs the arm, play, disarm cycle for each position on its
//!   own worker.
//! - [count_store] and [experiment_log] keep the results.
//! - [run_controller] ties them together under a start, pause and stop
//!   lifecycle.
//!
//! [dummy_controller] stands in for the hardware when there is none.

#![warn(missing_docs)]
pub mod args;
pub mod assignment;
pub mod config;
pub mod count_store;
pub mod dispatcher;
pub mod dummy_controller;
pub mod experiment_log;
pub mod export;
pub mod gui;
pub mod hardware_message_decoder;
pub mod playback;
pub mod rotation;
pub mod run_controller;
pub mod schedule;
pub mod serial_link;
pub mod stimulus;
pub mod ticker;
