//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize, write defaults if missing)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → ServerConfigSnapshot (listener view)
//!
//! On edit:
//!     source.rs (notify) emits raw change notifications
//!     → watcher.rs debounces bursts into one ConfigChanged event
//!     → lifecycle controller re-reads the snapshot and rebuilds the listener
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a listener rebuild
//! - All fields have defaults to allow minimal configs
//! - Events carry no payload: the controller always re-reads the source

pub mod loader;
pub mod schema;
pub mod source;
pub mod validation;
pub mod watcher;

pub use loader::ConfigError;
pub use schema::{AppConfig, NetworkConfig, ServerConfigSnapshot};
pub use source::{ChangeFeed, ConfigSource, FileConfigSource, MemoryConfigSource};
pub use watcher::{ConfigWatcher, DEBOUNCE_WINDOW};
