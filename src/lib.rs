//! # patchrun
//!
//! Process supervision core for a desktop patch installer. The interesting
//! part of that installer is not the window chrome but keeping an external
//! install script honest: launching it, harvesting its chatty textual
//! output, turning that into structured progress events, and making sure
//! none of its helper processes outlive us.
//!
//! ## Modules
//!
//! - `classify` - turns raw output lines into [`ProgressEvent`] values via
//!   an ordered, failure-tolerant cascade
//! - `transcript` - collapsed transcript of the raw output for diagnostics
//! - `source` - background line sources: a stdout pipe reader and a polled
//!   log-file tail
//! - `hygiene` - idempotent pre-launch rewrites of the script file
//! - `guard` - process-tree termination, group-signal primary and
//!   process-table fallback
//! - `supervisor` - the lifecycle state machine tying it all together

pub mod classify;
pub mod guard;
pub mod hygiene;
pub mod source;
pub mod supervisor;
pub mod transcript;

pub use classify::{Classification, InstallPhase, ProgressEvent};
pub use supervisor::{
    ExecutionStrategy, ProcessSupervisor, ScriptInvocation, ScriptStatus, SupervisorError,
    SupervisorState,
};
pub use transcript::Transcript;
