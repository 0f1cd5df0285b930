//! Terminal surfaces for the operator.

mod error;
mod monitor;
mod port_selector;

pub use error::MonitorError;
pub use monitor::monitor;
pub use port_selector::port_selector;
