//! Consumer-side streaming.
//!
//! - [`buffer`]: the per-consumer ring the proxy writes into
//! - [`instreamer`]: named channels, configuration and read API on top of a buffer

pub mod buffer;
pub mod instreamer;

pub use buffer::{InsertOutcome, StreamBuffer, StreamChunk};
pub use instreamer::{StreamConstraints, StreamingMode, WavemeterInstreamer};
