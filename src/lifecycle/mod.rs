//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → one ShutdownRequested event
//!
//! Config (config::watcher):
//!     file edits → debounced ConfigChanged events
//!
//! Controller (controller.rs):
//!     events.rs merges both, shutdown first
//!     → Starting → Running → Restarting/ShuttingDown → Stopped
//!     → pidfile.rs written on start, removed on stop
//! ```
//!
//! # Design Decisions
//! - A single task owns the active listener and the PID file
//! - Restart is a loop iteration, never a recursive call
//! - Shutdown is bounded: drain timeout, then forced close
//! - Only the controller decides whether an error is fatal

pub mod controller;
pub mod events;
pub mod pidfile;
pub mod signals;

pub use controller::{Controller, ControllerOptions, ExitStatus, FatalError, LifecycleState, StateChange};
pub use events::{EventSources, LifecycleEvent};
pub use pidfile::{PidFile, PidFileError, PidRecord, DEFAULT_PID_FILE};
