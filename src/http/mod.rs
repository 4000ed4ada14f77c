//! HTTP handler registration.
//!
//! # Data Flow
//! ```text
//! ServerConfigSnapshot
//!     → routes.rs (RegisterHandlers callback builds the Router)
//!     → net::listener serves it for one listener generation
//! ```

pub mod routes;

pub use routes::{default_handlers, RegisterHandlers, ROUTES};
