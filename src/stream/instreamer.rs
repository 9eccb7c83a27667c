//! Named-channel streaming front end.
//!
//! [`WavemeterInstreamer`] is what an acquisition consumer holds: a set of named
//! channels from the configuration, one [`StreamBuffer`], and a shared proxy. Starting
//! the stream subscribes the active channels; stopping it unsubscribes them.
//!
//! Active channels are always subscribed in ascending switch order, the order in
//! which the instrument scans them, so the lowest active switch channel is the
//! timing reference of every row.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::buffer::{StreamBuffer, StreamChunk};
use crate::config::{ChannelConfig, StreamConfig, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::error::{Result, WavemeterError};
use crate::proxy::{ConsumerId, WavemeterProxy};
use crate::units::ChannelUnit;

/// Slowest sample rate the instrument is specified for (Hz)
pub const MIN_SAMPLE_RATE: f64 = 0.01;
/// Fastest sample rate the instrument is specified for (Hz)
pub const MAX_SAMPLE_RATE: f64 = 1e3;

/// How data is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// Samples arrive as the instrument produces them, until stopped
    Continuous,
}

/// Static capabilities of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConstraints {
    /// Output unit of every configured channel, by name
    pub channel_units: BTreeMap<String, ChannelUnit>,
    /// Smallest buffer, in samples per channel
    pub min_buffer_size: usize,
    /// Largest buffer, in samples per channel
    pub max_buffer_size: usize,
    /// Slowest supported sample rate (Hz)
    pub min_sample_rate: f64,
    /// Fastest supported sample rate (Hz)
    pub max_sample_rate: f64,
}

#[derive(Debug, Clone)]
struct NamedChannel {
    name: String,
    switch_channel: u32,
    unit: ChannelUnit,
}

struct StreamSetup {
    active: Vec<usize>,
    buffer_size: usize,
}

/// One consumer's view of the shared wavemeter.
pub struct WavemeterInstreamer {
    proxy: Arc<WavemeterProxy>,
    channels: Vec<NamedChannel>,
    buffer: Arc<StreamBuffer>,
    setup: Mutex<StreamSetup>,
}

impl WavemeterInstreamer {
    /// Create a stopped stream over `channels`, all of them active.
    ///
    /// Exposure times given in the channel configuration are applied immediately.
    pub fn new(
        proxy: Arc<WavemeterProxy>,
        channels: &[ChannelConfig],
        stream: &StreamConfig,
    ) -> Result<Self> {
        if channels.is_empty() {
            return Err(WavemeterError::invalid_config("no channels configured"));
        }
        check_buffer_size(stream.buffer_size)?;

        let mut named = Vec::with_capacity(channels.len());
        for config in channels {
            if named.iter().any(|c: &NamedChannel| {
                c.name == config.name || c.switch_channel == config.switch_channel
            }) {
                return Err(WavemeterError::invalid_config(format!(
                    "channel '{}' (switch {}) configured twice",
                    config.name, config.switch_channel
                )));
            }
            named.push(NamedChannel {
                name: config.name.clone(),
                switch_channel: config.switch_channel,
                unit: config.output_unit()?,
            });
        }

        for config in channels {
            if let Some(ms) = config.exposure_ms {
                proxy.set_exposure(config.switch_channel, Duration::from_millis(u64::from(ms)))?;
            }
        }

        let streamer = Self {
            proxy,
            buffer: Arc::new(StreamBuffer::with_poll_interval(stream.poll_interval)),
            setup: Mutex::new(StreamSetup {
                active: sorted_by_switch(&named, (0..named.len()).collect()),
                buffer_size: stream.buffer_size,
            }),
            channels: named,
        };
        debug!(
            consumer = %streamer.id(),
            channels = streamer.channels.len(),
            "Wavemeter stream created"
        );
        Ok(streamer)
    }

    /// Identity of this consumer at the proxy.
    pub fn id(&self) -> ConsumerId {
        self.buffer.id()
    }

    /// Channel units, buffer-size bounds and sample-rate bounds.
    pub fn constraints(&self) -> StreamConstraints {
        StreamConstraints {
            channel_units: self
                .channels
                .iter()
                .map(|c| (c.name.clone(), c.unit))
                .collect(),
            min_buffer_size: MIN_BUFFER_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
            min_sample_rate: MIN_SAMPLE_RATE,
            max_sample_rate: MAX_SAMPLE_RATE,
        }
    }

    /// Always [`StreamingMode::Continuous`].
    pub fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::Continuous
    }

    /// Select active channels by name and the buffer size. Refused while streaming.
    pub fn configure(&self, active: &[&str], buffer_size: usize) -> Result<()> {
        if self.is_running() {
            return Err(WavemeterError::invalid_config(
                "cannot change stream settings while streaming",
            ));
        }
        if active.is_empty() {
            return Err(WavemeterError::invalid_config("no active channels selected"));
        }
        check_buffer_size(buffer_size)?;

        let mut indices = Vec::with_capacity(active.len());
        for name in active {
            let index = self
                .channels
                .iter()
                .position(|c| c.name == *name)
                .ok_or_else(|| WavemeterError::UnknownChannel {
                    name: (*name).to_string(),
                    available: self.channels.iter().map(|c| c.name.clone()).collect(),
                })?;
            if indices.contains(&index) {
                return Err(WavemeterError::invalid_config(format!(
                    "channel '{name}' selected twice"
                )));
            }
            indices.push(index);
        }

        let mut setup = self.setup.lock();
        setup.active = sorted_by_switch(&self.channels, indices);
        setup.buffer_size = buffer_size;
        Ok(())
    }

    /// Names of the active channels, in row order.
    pub fn active_channel_names(&self) -> Vec<String> {
        self.setup
            .lock()
            .active
            .iter()
            .map(|&i| self.channels[i].name.clone())
            .collect()
    }

    /// Samples per channel the buffer holds.
    pub fn buffer_size(&self) -> usize {
        self.setup.lock().buffer_size
    }

    /// Whether the stream is running. False after the watchdog stopped it.
    pub fn is_running(&self) -> bool {
        self.buffer.is_running()
    }

    /// Start buffering and subscribe the active channels.
    pub fn start_stream(&self) -> Result<()> {
        if self.is_running() {
            warn!(consumer = %self.id(), "Stream already running, start ignored");
            return Ok(());
        }
        let (switch_channels, units, buffer_size) = {
            let setup = self.setup.lock();
            let active: Vec<&NamedChannel> =
                setup.active.iter().map(|&i| &self.channels[i]).collect();
            (
                active.iter().map(|c| c.switch_channel).collect::<Vec<_>>(),
                active.iter().map(|c| c.unit).collect::<Vec<_>>(),
                setup.buffer_size,
            )
        };

        self.buffer.set_channel_units(units);
        self.buffer.start(buffer_size, switch_channels.len())?;
        if let Err(err) = self.proxy.connect(Arc::clone(&self.buffer), &switch_channels) {
            self.buffer.stop();
            return Err(err);
        }
        info!(consumer = %self.id(), channels = ?switch_channels, buffer_size, "Stream started");
        Ok(())
    }

    /// Unsubscribe and stop buffering.
    pub fn stop_stream(&self) -> Result<()> {
        if !self.is_running() && !self.proxy.is_connected(self.id()) {
            warn!(consumer = %self.id(), "Stream not running, stop ignored");
            return Ok(());
        }
        let result = self.proxy.disconnect(self.id());
        self.buffer.stop();
        info!(consumer = %self.id(), "Stream stopped");
        result
    }

    /// Block until `samples` samples per channel are available and return them.
    pub fn read_data(&self, samples: usize) -> Result<StreamChunk> {
        self.buffer.read(samples)
    }

    /// Return everything buffered so far without blocking.
    pub fn read_available_data(&self) -> Result<StreamChunk> {
        self.buffer.read_available(usize::MAX)
    }

    /// Fill `values` (interleaved) and `timestamps_ms` with `timestamps_ms.len()` rows.
    pub fn read_data_into(&self, values: &mut [f64], timestamps_ms: &mut [f64]) -> Result<usize> {
        self.buffer.read_into(values, timestamps_ms)
    }

    /// Most recent complete row, without consuming it.
    pub fn read_single_point(&self) -> Result<Option<(Vec<f64>, f64)>> {
        self.buffer.read_single_point()
    }

    /// Samples per channel ready to read.
    pub fn available_samples(&self) -> usize {
        self.buffer.available_rows()
    }

    /// Expected sample rate per channel (Hz), from the instrument's current setup.
    pub fn sample_rate(&self) -> Result<f64> {
        self.proxy.estimated_sample_rate()
    }
}

impl Drop for WavemeterInstreamer {
    fn drop(&mut self) {
        if self.proxy.is_connected(self.id()) {
            let _ = self.proxy.disconnect(self.id());
        }
    }
}

fn check_buffer_size(size: usize) -> Result<()> {
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
        return Err(WavemeterError::invalid_config(format!(
            "buffer size {size} out of range {MIN_BUFFER_SIZE}..={MAX_BUFFER_SIZE}"
        )));
    }
    Ok(())
}

fn sorted_by_switch(channels: &[NamedChannel], mut indices: Vec<usize>) -> Vec<usize> {
    indices.sort_by_key(|&i| channels[i].switch_channel);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockWavemeter;
    use crate::proxy::ProxySettings;

    fn channel(name: &str, switch_channel: u32) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            switch_channel,
            unit: "nm".to_string(),
            medium: "vac".to_string(),
            exposure_ms: None,
        }
    }

    fn small() -> StreamConfig {
        StreamConfig {
            buffer_size: 1024,
            ..StreamConfig::default()
        }
    }

    fn proxy() -> Arc<WavemeterProxy> {
        let settings = ProxySettings {
            watchdog_enabled: false,
            ..ProxySettings::default()
        };
        WavemeterProxy::new(Box::new(MockWavemeter::new()), settings).unwrap()
    }

    #[test]
    fn test_active_channels_follow_switch_order() {
        let streamer = WavemeterInstreamer::new(
            proxy(),
            &[channel("b", 4), channel("a", 2), channel("c", 3)],
            &small(),
        )
        .unwrap();
        assert_eq!(streamer.active_channel_names(), vec!["a", "c", "b"]);

        streamer.configure(&["b", "a"], 256).unwrap();
        assert_eq!(streamer.active_channel_names(), vec!["a", "b"]);
        assert_eq!(streamer.buffer_size(), 256);
    }

    #[test]
    fn test_configure_validation() {
        let streamer =
            WavemeterInstreamer::new(proxy(), &[channel("a", 1)], &small())
                .unwrap();
        assert!(matches!(
            streamer.configure(&["zz"], 256),
            Err(WavemeterError::UnknownChannel { .. })
        ));
        assert!(streamer.configure(&["a", "a"], 256).is_err());
        assert!(streamer.configure(&["a"], 16).is_err());
        assert!(streamer.configure(&[], 256).is_err());

        streamer.start_stream().unwrap();
        assert!(streamer.configure(&["a"], 256).is_err());
    }

    #[test]
    fn test_duplicate_switch_channels_rejected() {
        let result = WavemeterInstreamer::new(
            proxy(),
            &[channel("a", 1), channel("b", 1)],
            &small(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_constraints_report_units() {
        let mut freq = channel("f", 2);
        freq.unit = "THz".to_string();
        let streamer =
            WavemeterInstreamer::new(proxy(), &[channel("w", 1), freq], &small())
                .unwrap();
        let constraints = streamer.constraints();
        assert_eq!(constraints.channel_units["f"], ChannelUnit::Frequency);
        assert_eq!(constraints.channel_units["w"], ChannelUnit::VacuumWavelength);
        assert_eq!(constraints.min_buffer_size, 128);
        assert_eq!(constraints.max_sample_rate, 1000.0);
        assert_eq!(streamer.streaming_mode(), StreamingMode::Continuous);
    }

    #[test]
    fn test_exposure_applied_on_creation() {
        let proxy = proxy();
        let mut ch = channel("a", 3);
        ch.exposure_ms = Some(25);
        let _streamer =
            WavemeterInstreamer::new(Arc::clone(&proxy), &[ch], &small())
                .unwrap();
        assert_eq!(proxy.exposure(3).unwrap(), Duration::from_millis(25));
    }

    #[test]
    fn test_redundant_start_and_stop() {
        let proxy = proxy();
        let streamer = WavemeterInstreamer::new(
            Arc::clone(&proxy),
            &[channel("a", 1)],
            &small(),
        )
        .unwrap();
        streamer.stop_stream().unwrap();
        streamer.start_stream().unwrap();
        streamer.start_stream().unwrap();
        assert_eq!(proxy.consumer_count(), 1);
        streamer.stop_stream().unwrap();
        streamer.stop_stream().unwrap();
        assert_eq!(proxy.consumer_count(), 0);
        assert!(streamer.read_available_data().unwrap_err().is_not_running());
    }
}
