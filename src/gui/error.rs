use std::{borrow::Cow, error::Error, fmt::Display};

/// The terminal could not be driven.
#[derive(Debug)]
pub enum MonitorError {
    /// Raw mode, the alternate screen or drawing failed.
    IOError(std::io::Error),
    /// There was nothing to show.
    NothingToSelect,
}

impl Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            MonitorError::IOError(e) => Cow::from(format!("terminal error: {e}")),
            MonitorError::NothingToSelect => Cow::from("no serial ports to choose from"),
        };
        write!(f, "{}", msg)
    }
}

impl Error for MonitorError {}

impl From<std::io::Error> for MonitorError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}
