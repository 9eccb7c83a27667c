//! Configuration System using Figment
//!
//! Strongly-typed settings for the proxy, the watchdog, consumer streams, the channel
//! table and the simulated instrument. Configuration is loaded from:
//! 1. a TOML file (`config/wavemeter.toml` by default)
//! 2. environment variables prefixed with `WAVEMETER_`, nested keys separated by `__`
//!
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use wavemeter_daq::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // WAVEMETER_WATCHDOG__INTERVAL=500ms overrides [watchdog] interval
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("{} channels configured", settings.channels.len());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WavemeterError};
use crate::logging::OutputFormat;
use crate::proxy::ProxySettings;
use crate::units::ChannelUnit;

/// Smallest stream buffer, in samples per channel
pub const MIN_BUFFER_SIZE: usize = 128;
/// Largest stream buffer, in samples per channel
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Arbitration proxy
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Fault watchdog
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Consumer stream buffers
    #[serde(default)]
    pub stream: StreamConfig,
    /// Named channels offered to consumers
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    /// Simulated instrument used by the command line tool
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

/// Proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Time the switch needs between two channels, in ms
    #[serde(default = "default_switch_overhead")]
    pub switch_overhead_ms: u64,
    /// Deferred notification events buffered between watchdog polls
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

/// Watchdog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Run the watchdog thread
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Polling period
    #[serde(default = "default_watchdog_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Stream buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Samples per channel each consumer can buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Sleep between checks of a blocking read
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// One named channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Name consumers use to select the channel
    pub name: String,
    /// Switch channel on the instrument (1-based)
    pub switch_channel: u32,
    /// `m`/`nm` for wavelength, `Hz`/`THz` for frequency
    #[serde(default = "default_unit")]
    pub unit: String,
    /// `vac` or `air`, wavelength only
    #[serde(default = "default_medium")]
    pub medium: String,
    /// Exposure applied when a stream is created, in ms
    #[serde(default)]
    pub exposure_ms: Option<u32>,
}

/// Simulated instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Instrument has a channel switch
    #[serde(default = "default_enabled")]
    pub switch: bool,
    /// Number of switch channels
    #[serde(default = "default_sim_channels")]
    pub channel_count: u32,
    /// Base wavelength of every channel, in nm
    #[serde(default = "default_sim_wavelength")]
    pub wavelength_nm: f64,
    /// Reading noise half width, in pm
    #[serde(default = "default_sim_noise")]
    pub noise_pm: f64,
    /// Multiplier on simulated delays
    #[serde(default = "default_sim_time_scale")]
    pub time_scale: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_switch_overhead() -> u64 {
    12
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_enabled() -> bool {
    true
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_unit() -> String {
    "nm".to_string()
}

fn default_medium() -> String {
    "vac".to_string()
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig {
        name: "default_channel".to_string(),
        switch_channel: 1,
        unit: default_unit(),
        medium: default_medium(),
        exposure_ms: Some(10),
    }]
}

fn default_sim_channels() -> u32 {
    8
}

fn default_sim_wavelength() -> f64 {
    780.241
}

fn default_sim_noise() -> f64 {
    0.5
}

fn default_sim_time_scale() -> f64 {
    1.0
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            switch_overhead_ms: default_switch_overhead(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_watchdog_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            switch: true,
            channel_count: default_sim_channels(),
            wavelength_nm: default_sim_wavelength(),
            noise_pm: default_sim_noise(),
            time_scale: default_sim_time_scale(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            proxy: ProxyConfig::default(),
            watchdog: WatchdogConfig::default(),
            stream: StreamConfig::default(),
            channels: default_channels(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Output unit selected by `unit` and `medium`.
    ///
    /// Values are always delivered in SI base units; `nm` and `THz` select the
    /// quantity only.
    pub fn output_unit(&self) -> Result<ChannelUnit> {
        match self.unit.as_str() {
            "Hz" | "THz" => Ok(ChannelUnit::Frequency),
            "m" | "nm" => match self.medium.as_str() {
                "vac" => Ok(ChannelUnit::VacuumWavelength),
                "air" => Ok(ChannelUnit::AirWavelength),
                other => Err(WavemeterError::invalid_config(format!(
                    "channel '{}': invalid medium '{other}'. Must be one of: vac, air",
                    self.name
                ))),
            },
            other => Err(WavemeterError::invalid_config(format!(
                "channel '{}': invalid unit '{other}'. Must be one of: m, nm, Hz, THz",
                self.name
            ))),
        }
    }
}

impl Settings {
    /// Load configuration from `config/wavemeter.toml` and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from("config/wavemeter.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment variables apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WAVEMETER_").split("__"))
            .extract()?)
    }

    /// Effective configuration as TOML, defaults and environment overrides included
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(WavemeterError::invalid_config(format!(
                "invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.watchdog.interval.is_zero() {
            return Err(WavemeterError::invalid_config(
                "watchdog interval must be non-zero",
            ));
        }
        if self.stream.poll_interval.is_zero() {
            return Err(WavemeterError::invalid_config(
                "stream poll interval must be non-zero",
            ));
        }
        if self.proxy.event_queue_capacity == 0 {
            return Err(WavemeterError::invalid_config(
                "event queue capacity must be non-zero",
            ));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.stream.buffer_size) {
            return Err(WavemeterError::invalid_config(format!(
                "buffer size {} out of range {MIN_BUFFER_SIZE}..={MAX_BUFFER_SIZE}",
                self.stream.buffer_size
            )));
        }

        if self.channels.is_empty() {
            return Err(WavemeterError::invalid_config("no channels configured"));
        }
        let mut names = HashSet::new();
        let mut switch_channels = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(WavemeterError::invalid_config(format!(
                    "duplicate channel name: {}",
                    channel.name
                )));
            }
            if channel.switch_channel == 0 {
                return Err(WavemeterError::invalid_config(format!(
                    "channel '{}': switch channels start at 1",
                    channel.name
                )));
            }
            if !switch_channels.insert(channel.switch_channel) {
                return Err(WavemeterError::invalid_config(format!(
                    "switch channel {} assigned twice",
                    channel.switch_channel
                )));
            }
            channel.output_unit()?;
        }

        if self.simulator.time_scale <= 0.0 || self.simulator.noise_pm < 0.0 {
            return Err(WavemeterError::invalid_config(
                "simulator time scale must be positive and noise non-negative",
            ));
        }
        Ok(())
    }

    /// Proxy settings derived from the `[proxy]` and `[watchdog]` sections.
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            switch_overhead: Duration::from_millis(self.proxy.switch_overhead_ms),
            watchdog_enabled: self.watchdog.enabled,
            watchdog_interval: self.watchdog.interval,
            event_queue_capacity: self.proxy.event_queue_capacity,
        }
    }

    /// Channel configuration by name.
    pub fn channel(&self, name: &str) -> Result<&ChannelConfig> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| WavemeterError::UnknownChannel {
                name: name.to_string(),
                available: self.channels.iter().map(|c| c.name.clone()).collect(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.stream.buffer_size, 1_048_576);
        assert_eq!(settings.proxy_settings().switch_overhead, Duration::from_millis(12));
        assert_eq!(settings.channels[0].switch_channel, 1);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [watchdog]
            interval = "250ms"

            [stream]
            buffer_size = 4096

            [[channels]]
            name = "repump"
            switch_channel = 2
            exposure_ms = 5

            [[channels]]
            name = "cooler"
            switch_channel = 3
            unit = "THz"
            "#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.watchdog.interval, Duration::from_millis(250));
        assert!(settings.watchdog.enabled);
        assert_eq!(settings.stream.buffer_size, 4096);
        assert_eq!(settings.stream.poll_interval, Duration::from_millis(10));
        assert_eq!(settings.channels.len(), 2);
        assert_eq!(settings.channels[0].exposure_ms, Some(5));
        assert_eq!(
            settings.channel("cooler").unwrap().output_unit().unwrap(),
            ChannelUnit::Frequency
        );
    }

    #[test]
    fn test_effective_config_reloads() {
        let mut settings = Settings::default();
        settings.watchdog.interval = Duration::from_millis(200);
        settings.channels[0].exposure_ms = Some(7);

        let file = write_config(&settings.to_toml().unwrap());
        let reloaded = Settings::load_from(file.path()).unwrap();
        assert_eq!(reloaded.watchdog.interval, Duration::from_millis(200));
        assert_eq!(reloaded.channels, settings.channels);
        assert_eq!(reloaded.logging.format, settings.logging.format);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.channels, default_channels());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let file = write_config("[stream]\nbuffer_size = \"lots\"\n");
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(WavemeterError::Config(_))
        ));
    }

    #[test]
    fn test_buffer_size_bounds() {
        let mut settings = Settings::default();
        settings.stream.buffer_size = MIN_BUFFER_SIZE - 1;
        assert!(settings.validate().is_err());
        settings.stream.buffer_size = MIN_BUFFER_SIZE;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_duplicate_channels_rejected() {
        let mut settings = Settings::default();
        let mut twin = settings.channels[0].clone();
        twin.name = "twin".to_string();
        settings.channels.push(twin.clone());
        assert!(settings.validate().is_err());

        twin.switch_channel = 2;
        twin.name = settings.channels[0].name.clone();
        settings.channels[1] = twin;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_unit_and_medium() {
        let mut channel = default_channels().remove(0);
        channel.medium = "water".to_string();
        assert!(channel.output_unit().is_err());
        channel.medium = "air".to_string();
        assert_eq!(channel.output_unit().unwrap(), ChannelUnit::AirWavelength);
        channel.unit = "cm".to_string();
        assert!(channel.output_unit().is_err());
    }

    #[test]
    fn test_unknown_channel_lists_available() {
        let settings = Settings::default();
        match settings.channel("probe") {
            Err(WavemeterError::UnknownChannel { available, .. }) => {
                assert_eq!(available, vec!["default_channel".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
