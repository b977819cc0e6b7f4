//! Core types shared by the backsync crates.
//!
//! - [`error`] - configuration and I/O errors
//! - [`result`] - tap-style combinators for logging on error paths
//! - [`telemetry`] - tracing subscriber setup

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::Error;
pub use result::{GenericResultExt, Result};
