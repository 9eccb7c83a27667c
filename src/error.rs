//! Error types for the arbitration core.
//!
//! This module defines `WavemeterError`, the single error type shared by the proxy,
//! the watchdog, the stream buffers and the driver boundary. Using the `thiserror`
//! crate, every variant carries the structured context needed to log it and a
//! human-readable message.
//!
//! ## Error Taxonomy
//!
//! - **`Hardware`**: a driver call was rejected. Surfaced to the caller of `connect`
//!   or `set_exposure` and never retried automatically.
//! - **`AlreadyConnected`**: a consumer tried to connect twice. A caller bug.
//! - **`Overflow`**: a consumer read too slowly and its ring filled up. That consumer
//!   is stopped; the error is returned by its next read.
//! - **`NotRunning`**: a read on a buffer that was never started or already stopped.
//! - **`CallbackFault`** / **`Drift`**: internal conditions. They are never returned
//!   from the notification path; the watchdog records them when it recovers.
//! - **`InvalidConfig`**, **`UnknownChannel`**, **`Config`**, **`Io`**: configuration
//!   and environment problems.

use std::fmt;
use thiserror::Error;

use crate::proxy::ConsumerId;

/// Result type alias for wavemeter operations.
pub type Result<T> = std::result::Result<T, WavemeterError>;

/// Errors that can occur while arbitrating the instrument or streaming samples.
#[derive(Error, Debug)]
pub enum WavemeterError {
    /// The instrument driver rejected a call
    #[error("Hardware error during {operation}: {message}")]
    Hardware {
        /// Driver operation that failed (e.g. "activate_channel")
        operation: String,
        /// Driver-provided description
        message: String,
    },

    /// The consumer is already registered with the proxy
    #[error("Consumer {consumer} is already connected")]
    AlreadyConnected {
        /// Offending consumer
        consumer: ConsumerId,
    },

    /// The stream buffer ran full before the consumer read it
    #[error(
        "Stream buffer overflow after {capacity} samples per channel. \
         Increase the buffer size or read data faster."
    )]
    Overflow {
        /// Buffer capacity in rows (samples per channel)
        capacity: usize,
    },

    /// The stream is not running
    #[error("Unable to read data: stream is not running")]
    NotRunning,

    /// The notification callback reported a condition it cannot handle inline
    #[error("Notification callback fault: {reason}")]
    CallbackFault {
        /// What the instrument reported
        reason: FaultReason,
    },

    /// The instrument's active channels differ from the expected set
    #[error("Channel drift detected: expected {expected:?}, instrument reports {actual:?}")]
    Drift {
        /// Union of all subscriptions
        expected: Vec<u32>,
        /// Channels the instrument reports as active
        actual: Vec<u32>,
    },

    /// Invalid configuration or parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong
        message: String,
    },

    /// A channel name that is not part of the configuration
    #[error("Channel '{name}' is not configured. Available channels: {available:?}")]
    UnknownChannel {
        /// Requested name
        name: String,
        /// Configured names
        available: Vec<String>,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration could not be written out
    #[error("Configuration serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-sample conditions reported through the notification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// Acquisition was stopped by someone other than the proxy
    MeasurementStopped,
    /// Switch mode was toggled externally
    SwitchModeChanged,
    /// Pulse mode was toggled externally
    PulseModeChanged,
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeasurementStopped => write!(f, "measurement stopped externally"),
            Self::SwitchModeChanged => write!(f, "switch mode changed externally"),
            Self::PulseModeChanged => write!(f, "pulse mode changed externally"),
        }
    }
}

impl WavemeterError {
    /// Create a hardware error for a driver operation.
    pub fn hardware(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hardware {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Check if this is a buffer overflow.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }

    /// Check if the stream was not running.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning)
    }

    /// Check if the driver rejected a call.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware { .. })
    }
}
