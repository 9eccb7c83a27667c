//! Instrument driver boundary.
//!
//! The native wavemeter binding is an external collaborator. This module defines the
//! synchronous interface the arbitration proxy expects from it, and the decoded form
//! of the notifications the binding delivers through its single global callback.
//!
//! # Contract
//!
//! - Every call is synchronous and expected to return quickly.
//! - Rejections are reported as [`WavemeterError::Hardware`](crate::error::WavemeterError),
//!   never as silent sentinel codes.
//! - At most one notification handler is installed at a time. The handler may be
//!   invoked from a thread the driver owns, concurrently with any other call.
//!
//! A simulated instrument implementing the trait lives in [`mock`].

pub mod mock;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Handler invoked by the driver for every notification.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// Decoded notification from the instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Notification {
    /// New reading on a switch channel
    Sample {
        /// Switch channel the reading belongs to
        channel: u32,
        /// Vacuum wavelength in nm, or a negative error code
        value: f64,
        /// Instrument timestamp in milliseconds
        timestamp_ms: f64,
    },
    /// Measurement was stopped (not by us)
    MeasurementStopped,
    /// Switch mode was toggled
    SwitchModeChanged,
    /// Pulse mode was toggled
    PulseModeChanged,
    /// Any other state change; ignored
    Other,
}

/// Reason a reading carries an error code instead of a wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFault {
    /// No signal on the channel
    NoSignal,
    /// Signal could not be evaluated
    BadSignal,
    /// Underexposed
    LowSignal,
    /// Overexposed
    BigSignal,
    /// Any other negative code
    Code(i32),
}

impl SampleFault {
    /// Classify a reading. Returns `None` for valid (non-negative) values.
    pub fn from_value(value: f64) -> Option<Self> {
        if value.is_nan() || value >= 0.0 {
            return None;
        }
        Some(match value as i32 {
            -1 => Self::NoSignal,
            -2 => Self::BadSignal,
            -3 => Self::LowSignal,
            -4 => Self::BigSignal,
            code => Self::Code(code),
        })
    }
}

impl fmt::Display for SampleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSignal => write!(f, "no signal"),
            Self::BadSignal => write!(f, "bad signal"),
            Self::LowSignal => write!(f, "underexposed"),
            Self::BigSignal => write!(f, "overexposed"),
            Self::Code(code) => write!(f, "error code {code}"),
        }
    }
}

/// Synchronous interface of the native wavemeter binding.
///
/// Channel ids are the 1-based numbers of the instrument's switch. An instrument
/// without a switch only knows channel 1, which is always active.
pub trait WavemeterDriver: Send + Sync {
    /// Whether the instrument has a multi-channel switch.
    fn has_switch(&self) -> bool;

    /// Enable or disable switch mode (round-robin scanning).
    fn set_switch_mode(&self, enabled: bool) -> Result<()>;

    /// Enable a switch channel.
    fn activate_channel(&self, channel: u32) -> Result<()>;

    /// Disable a switch channel.
    fn deactivate_channel(&self, channel: u32) -> Result<()>;

    /// Channels the instrument currently scans, ascending.
    fn active_channels(&self) -> Result<Vec<u32>>;

    /// Set the exposure time of a channel in milliseconds.
    fn set_exposure(&self, channel: u32, exposure_ms: u32) -> Result<()>;

    /// Exposure time of a channel in milliseconds.
    fn exposure(&self, channel: u32) -> Result<u32>;

    /// Issue the "start measurement" command.
    fn start_measurement(&self) -> Result<()>;

    /// Install the global notification handler, replacing any previous one.
    fn install_callback(&self, handler: NotificationHandler) -> Result<()>;

    /// Remove the global notification handler.
    fn remove_callback(&self) -> Result<()>;

    /// Last vacuum wavelength (nm) measured on a channel.
    fn wavelength(&self, channel: u32) -> Result<f64>;
}
