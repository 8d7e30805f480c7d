//! Shared domain types for the tintcam workspace.

pub mod config;
pub mod events;
pub mod frame;
pub mod telemetry;

mod errors;

pub use errors::{Result, TintcamError};
