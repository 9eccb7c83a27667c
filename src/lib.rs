//! # Wavemeter DAQ Core Library
//!
//! Shared, multi-consumer streaming acquisition for a switched multi-channel wavelength
//! meter. One physical instrument scans its inputs round-robin and reports every reading
//! through a single notification callback; this crate lets any number of independent
//! consumers each subscribe to their own subset of channels and read the samples from
//! their own buffer.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `WavemeterDriver` trait the native binding implements, decoded
//!   notifications, and a simulated instrument (`hardware::mock`).
//! - **`proxy`**: `WavemeterProxy`, the exclusive owner of the driver. Enables the union of
//!   all subscriptions, installs the single callback and fans samples out.
//! - **`watchdog`**: background thread that stops consumers on overflow, on faults reported
//!   by the instrument and on channel configuration drift.
//! - **`stream`**: `StreamBuffer`, the per-consumer ring, and `WavemeterInstreamer`, the
//!   named-channel front end consumers use.
//! - **`units`**: vacuum wavelength, air wavelength and frequency conversion.
//! - **`config`**: figment-based settings (TOML file plus `WAVEMETER_` environment).
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`error`**: the crate-wide `WavemeterError`.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod proxy;
pub mod stream;
pub mod units;
pub mod watchdog;

pub use error::{Result, WavemeterError};
pub use hardware::{Notification, WavemeterDriver};
pub use proxy::{ConsumerId, ProxySettings, WavemeterProxy};
pub use stream::{StreamBuffer, StreamChunk, WavemeterInstreamer};
pub use watchdog::{Watchdog, WatchdogState};
