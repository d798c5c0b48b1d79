//! Daemon lifecycle: ordered start and stop of every component, plus the
//! heartbeat state file.

pub mod error;
pub mod heartbeat;
pub mod supervisor;

pub use {
    error::{DaemonError, Result},
    heartbeat::{ChannelState, DaemonState, Heartbeat, read_state, write_state},
    supervisor::{RunningDaemon, Supervisor},
};
