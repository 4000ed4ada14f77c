//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields
//!     → logging.rs installs the subscriber (stdout, text or JSON)
//! HTTP requests:
//!     → tower-http TraceLayer spans, tagged with x-request-id
//! ```

pub mod logging;
