//! Process container module
//!
//! The container pairs one OS child process with its definition and state
//! machine; the shutdown submodule implements the INT -> TERM -> KILL
//! escalation.

mod container;
mod definition;
mod shutdown;
mod state;

pub use container::{Container, ExitOutcome, LogSink};
pub use definition::{
    ExecMode, InstanceHint, Instances, ProcessConfig, ProcessDefinition, ProcessLogConfig,
};
pub use state::ProcessStatus;
