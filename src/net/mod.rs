//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ServerConfigSnapshot
//!     → tls.rs (provision cert/key if TLS is on, load rustls config)
//!     → listener.rs (bind, serve router, hand out ListenerHandle)
//!     → ... → listener.rs shutdown (stop accepting, drain, force-close)
//! ```
//!
//! # Design Decisions
//! - Plaintext and TLS share one serving path (axum-server), differing
//!   only in the acceptor
//! - A generation number distinguishes successive listeners
//! - TLS material is checked and, if absent, generated before binding

pub mod listener;
pub mod tls;

pub use listener::{ListenerError, ListenerHandle, ListenerManager, DRAIN_TIMEOUT};
pub use tls::{CertError, CertificateProvisioner, Provisioned, SelfSignedProvisioner};
