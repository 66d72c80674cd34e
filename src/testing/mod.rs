//! Testing utilities and mock implementations
//!
//! Lets the relay be exercised without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
