//! # Error Types
//!
//! This module provides the error types used throughout the tspump library.
//! It defines a central error type `PumpError` that encapsulates all possible
//! errors that can occur while pacing and emitting transport stream output.
//!
//! ## Example Usage
//!
//! ```rust
//! use tspump::error::{Result, PumpError};
//!
//! fn check_packet(data: &[u8]) -> Result<()> {
//!     if data.len() != 188 {
//!         return Err(PumpError::InvalidData("not a TS packet".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for the tspump library
#[derive(Error, Debug)]
pub enum PumpError {
    /// I/O errors that occur during file or network operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors caused by nonsensical option values, rejected up front
    #[error("config error: {0}")]
    Config(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Errors raised by the circular buffer linking producer and consumer
    #[error("buffer error: {0}")]
    Buffer(String),

    /// Errors while creating or driving an output sink
    #[error("sink error: {0}")]
    Sink(String),
}

/// A specialized Result type for tspump operations.
///
/// This type is used throughout the tspump library to handle operations
/// that can produce a `PumpError`.
pub type Result<T> = std::result::Result<T, PumpError>;
