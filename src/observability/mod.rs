//! Observability for the timestamper
//!
//! Structured logging only; the relay's diagnostics are plain tracing events.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
