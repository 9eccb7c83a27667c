//! Simulated Wavemeter
//!
//! Provides a software instrument implementing [`WavemeterDriver`] for tests, benchmarks
//! and the command line tool, so the proxy can be exercised without the native binding.
//!
//! # Available Mocks
//!
//! - `MockWavemeter` - Switched multi-channel wavemeter (the driver half, handed to the proxy)
//! - `MockWavemeterHandle` - Test-side handle on the same instrument: injects notifications,
//!   toggles channels behind the proxy's back, rejects channels and runs the scan thread
//!
//! # Timing
//!
//! The scan thread visits enabled channels round-robin. Each visit takes the channel's
//! exposure plus the switch overhead (12 ms by default), multiplied by the time scale.
//! Timestamps are instrument milliseconds since the mock was created, in unscaled time.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Notification, NotificationHandler, WavemeterDriver};
use crate::error::{Result, WavemeterError};

/// Default exposure of every channel (ms)
pub const DEFAULT_EXPOSURE_MS: u32 = 10;

/// Default time the switch needs to move between channels (ms)
pub const DEFAULT_SWITCH_OVERHEAD_MS: u32 = 12;

// =============================================================================
// Shared instrument state
// =============================================================================

struct InstrumentState {
    enabled: BTreeSet<u32>,
    exposure_ms: HashMap<u32, u32>,
    base_nm: HashMap<u32, f64>,
    last_nm: HashMap<u32, f64>,
    rejected: BTreeSet<u32>,
    activations: HashMap<u32, usize>,
    switch_mode: bool,
    measuring: bool,
    report_failure: bool,
    fail_handler_removal: bool,
}

struct MockInstrument {
    has_switch: bool,
    channel_count: u32,
    noise_nm: f64,
    time_scale: f64,
    switch_overhead_ms: u32,
    clock: Instant,
    state: Mutex<InstrumentState>,
    callback: RwLock<Option<NotificationHandler>>,
    scanning: AtomicBool,
    scan_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MockInstrument {
    fn now_ms(&self) -> f64 {
        self.clock.elapsed().as_secs_f64() * 1e3 / self.time_scale
    }

    fn check_channel(&self, operation: &str, channel: u32) -> Result<()> {
        if channel == 0 || channel > self.channel_count {
            return Err(WavemeterError::hardware(
                operation,
                format!(
                    "channel {channel} does not exist (instrument has {})",
                    self.channel_count
                ),
            ));
        }
        Ok(())
    }

    /// Invoke the installed handler, if any, without holding any instrument lock.
    fn dispatch(&self, notification: Notification) -> bool {
        let handler = self.callback.read().clone();
        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => false,
        }
    }

    /// One scan step: pick the channel after `previous`, simulate its reading.
    /// Returns the channel and the time the step takes, or `None` if idle.
    fn scan_step(&self, previous: Option<u32>) -> Option<(u32, Duration, f64)> {
        let mut state = self.state.lock();
        if !state.measuring || state.enabled.is_empty() {
            return None;
        }
        let channel = previous
            .and_then(|prev| state.enabled.range(prev + 1..).next().copied())
            .or_else(|| state.enabled.iter().next().copied())?;

        let exposure = state
            .exposure_ms
            .get(&channel)
            .copied()
            .unwrap_or(DEFAULT_EXPOSURE_MS);
        let base = state.base_nm.get(&channel).copied().unwrap_or(780.0);
        let value = if self.noise_nm > 0.0 {
            base + rand::thread_rng().gen_range(-self.noise_nm..self.noise_nm)
        } else {
            base
        };
        state.last_nm.insert(channel, value);

        let step_ms = f64::from(exposure + self.switch_overhead_ms) * self.time_scale;
        Some((channel, Duration::from_secs_f64(step_ms / 1e3), value))
    }
}

fn scan_loop(instrument: Arc<MockInstrument>) {
    debug!("Simulated scan thread started");
    let mut previous = None;
    while instrument.scanning.load(Ordering::Acquire) {
        match instrument.scan_step(previous) {
            Some((channel, step, value)) => {
                thread::sleep(step);
                if !instrument.scanning.load(Ordering::Acquire) {
                    break;
                }
                instrument.dispatch(Notification::Sample {
                    channel,
                    value,
                    timestamp_ms: instrument.now_ms(),
                });
                previous = Some(channel);
            }
            None => thread::sleep(Duration::from_millis(5)),
        }
    }
    debug!("Simulated scan thread exited");
}

// =============================================================================
// MockWavemeter - Driver half
// =============================================================================

/// Simulated switched wavemeter.
///
/// Defaults:
/// - 8-channel switch, switch mode off until the proxy enables it
/// - every channel at 780 nm with 0.5 pm uniform noise
/// - 10 ms exposure, 12 ms switch overhead, real-time scan speed
///
/// # Example
///
/// ```rust,ignore
/// let meter = MockWavemeter::new().with_wavelength(2, 1550.0);
/// let handle = meter.handle();
/// let proxy = WavemeterProxy::new(Box::new(meter), ProxySettings::default())?;
/// handle.start_simulation();
/// ```
pub struct MockWavemeter {
    instrument: Arc<MockInstrument>,
}

impl MockWavemeter {
    /// Create an 8-channel switched instrument.
    pub fn new() -> Self {
        Self::build(true, 8)
    }

    /// Create an instrument without a switch. Channel 1 is permanently active.
    pub fn without_switch() -> Self {
        let meter = Self::build(false, 1);
        meter.instrument.state.lock().enabled.insert(1);
        meter
    }

    fn build(has_switch: bool, channel_count: u32) -> Self {
        Self {
            instrument: Arc::new(MockInstrument {
                has_switch,
                channel_count,
                noise_nm: 5e-4,
                time_scale: 1.0,
                switch_overhead_ms: DEFAULT_SWITCH_OVERHEAD_MS,
                clock: Instant::now(),
                state: Mutex::new(InstrumentState {
                    enabled: BTreeSet::new(),
                    exposure_ms: HashMap::new(),
                    base_nm: HashMap::new(),
                    last_nm: HashMap::new(),
                    rejected: BTreeSet::new(),
                    activations: HashMap::new(),
                    switch_mode: false,
                    measuring: false,
                    report_failure: false,
                    fail_handler_removal: false,
                }),
                callback: RwLock::new(None),
                scanning: AtomicBool::new(false),
                scan_thread: Mutex::new(None),
            }),
        }
    }

    fn configure(mut self, edit: impl FnOnce(&mut MockInstrument)) -> Self {
        // Builders run before the handle is cloned, so the Arc is still unique.
        if let Some(instrument) = Arc::get_mut(&mut self.instrument) {
            edit(instrument);
        } else {
            warn!("MockWavemeter builder called after a handle was taken; ignored");
        }
        self
    }

    /// Number of switch channels (switched instruments only)
    pub fn with_channel_count(self, count: u32) -> Self {
        self.configure(|i| {
            if i.has_switch {
                i.channel_count = count.max(1);
            }
        })
    }

    /// Base wavelength of a channel in nm
    pub fn with_wavelength(self, channel: u32, nm: f64) -> Self {
        self.configure(|i| {
            i.state.get_mut().base_nm.insert(channel, nm);
        })
    }

    /// Peak-to-peak half width of the uniform reading noise in nm
    pub fn with_noise(self, noise_nm: f64) -> Self {
        self.configure(|i| i.noise_nm = noise_nm.max(0.0))
    }

    /// Multiply every simulated delay (0.1 scans ten times faster than real time)
    pub fn with_time_scale(self, scale: f64) -> Self {
        self.configure(|i| {
            if scale > 0.0 {
                i.time_scale = scale;
            }
        })
    }

    /// Switch overhead in ms
    pub fn with_switch_overhead(self, overhead_ms: u32) -> Self {
        self.configure(|i| i.switch_overhead_ms = overhead_ms)
    }

    /// Obtain a test-side handle on this instrument.
    pub fn handle(&self) -> MockWavemeterHandle {
        MockWavemeterHandle {
            instrument: Arc::clone(&self.instrument),
        }
    }
}

impl Default for MockWavemeter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockWavemeter {
    fn drop(&mut self) {
        self.handle().stop_simulation();
    }
}

impl WavemeterDriver for MockWavemeter {
    fn has_switch(&self) -> bool {
        self.instrument.has_switch
    }

    fn set_switch_mode(&self, enabled: bool) -> Result<()> {
        if !self.instrument.has_switch {
            return Err(WavemeterError::hardware(
                "set_switch_mode",
                "instrument has no channel switch",
            ));
        }
        self.instrument.state.lock().switch_mode = enabled;
        Ok(())
    }

    fn activate_channel(&self, channel: u32) -> Result<()> {
        self.instrument.check_channel("activate_channel", channel)?;
        let mut state = self.instrument.state.lock();
        if !self.instrument.has_switch {
            return Ok(());
        }
        if state.rejected.contains(&channel) {
            return Err(WavemeterError::hardware(
                "activate_channel",
                format!("switch refused channel {channel}"),
            ));
        }
        state.enabled.insert(channel);
        *state.activations.entry(channel).or_insert(0) += 1;
        Ok(())
    }

    fn deactivate_channel(&self, channel: u32) -> Result<()> {
        self.instrument.check_channel("deactivate_channel", channel)?;
        if !self.instrument.has_switch {
            return Ok(());
        }
        self.instrument.state.lock().enabled.remove(&channel);
        Ok(())
    }

    fn active_channels(&self) -> Result<Vec<u32>> {
        let state = self.instrument.state.lock();
        if state.report_failure {
            return Err(WavemeterError::hardware(
                "active_channels",
                "instrument did not answer",
            ));
        }
        Ok(state.enabled.iter().copied().collect())
    }

    fn set_exposure(&self, channel: u32, exposure_ms: u32) -> Result<()> {
        self.instrument.check_channel("set_exposure", channel)?;
        if exposure_ms == 0 {
            return Err(WavemeterError::hardware(
                "set_exposure",
                "exposure must be at least 1 ms",
            ));
        }
        self.instrument
            .state
            .lock()
            .exposure_ms
            .insert(channel, exposure_ms);
        Ok(())
    }

    fn exposure(&self, channel: u32) -> Result<u32> {
        self.instrument.check_channel("exposure", channel)?;
        Ok(self
            .instrument
            .state
            .lock()
            .exposure_ms
            .get(&channel)
            .copied()
            .unwrap_or(DEFAULT_EXPOSURE_MS))
    }

    fn start_measurement(&self) -> Result<()> {
        self.instrument.state.lock().measuring = true;
        info!("Simulated wavemeter measurement started");
        Ok(())
    }

    fn install_callback(&self, handler: NotificationHandler) -> Result<()> {
        *self.instrument.callback.write() = Some(handler);
        Ok(())
    }

    fn remove_callback(&self) -> Result<()> {
        if self.instrument.state.lock().fail_handler_removal {
            return Err(WavemeterError::hardware(
                "remove_callback",
                "instrument did not answer",
            ));
        }
        *self.instrument.callback.write() = None;
        Ok(())
    }

    fn wavelength(&self, channel: u32) -> Result<f64> {
        self.instrument.check_channel("wavelength", channel)?;
        let state = self.instrument.state.lock();
        // No reading yet reports "no signal", like the instrument
        Ok(state.last_nm.get(&channel).copied().unwrap_or(-1.0))
    }
}

// =============================================================================
// MockWavemeterHandle - Test side
// =============================================================================

/// Cloneable handle standing in for the instrument's other users and for the
/// hardware itself: it can emit notifications and change state behind the proxy.
#[derive(Clone)]
pub struct MockWavemeterHandle {
    instrument: Arc<MockInstrument>,
}

impl MockWavemeterHandle {
    /// Deliver a raw notification through the installed handler.
    ///
    /// Returns `false` when no handler is installed.
    pub fn emit(&self, notification: Notification) -> bool {
        self.instrument.dispatch(notification)
    }

    /// Deliver one reading (vacuum nm, or negative error code).
    pub fn emit_sample(&self, channel: u32, value: f64, timestamp_ms: f64) -> bool {
        self.emit(Notification::Sample {
            channel,
            value,
            timestamp_ms,
        })
    }

    /// Toggle a channel as another program would, without going through the driver.
    pub fn set_channel_externally(&self, channel: u32, enabled: bool) {
        let mut state = self.instrument.state.lock();
        if enabled {
            state.enabled.insert(channel);
        } else {
            state.enabled.remove(&channel);
        }
    }

    /// Make `activate_channel` fail for this channel.
    pub fn reject_channel(&self, channel: u32) {
        self.instrument.state.lock().rejected.insert(channel);
    }

    /// Make `active_channels` fail (or succeed again).
    pub fn fail_channel_query(&self, fail: bool) {
        self.instrument.state.lock().report_failure = fail;
    }

    /// Make `remove_callback` fail (or succeed again).
    pub fn fail_handler_removal(&self, fail: bool) {
        self.instrument.state.lock().fail_handler_removal = fail;
    }

    /// Stop acquisition from outside and report it through the callback.
    pub fn stop_measurement_externally(&self) {
        self.instrument.state.lock().measuring = false;
        self.emit(Notification::MeasurementStopped);
    }

    /// Channels currently enabled on the switch.
    pub fn enabled_channels(&self) -> Vec<u32> {
        self.instrument.state.lock().enabled.iter().copied().collect()
    }

    /// How often the driver was asked to activate each channel.
    pub fn activation_counts(&self) -> BTreeMap<u32, usize> {
        self.instrument
            .state
            .lock()
            .activations
            .iter()
            .map(|(ch, n)| (*ch, *n))
            .collect()
    }

    /// Whether a notification handler is installed.
    pub fn callback_installed(&self) -> bool {
        self.instrument.callback.read().is_some()
    }

    /// Whether acquisition is running.
    pub fn measurement_running(&self) -> bool {
        self.instrument.state.lock().measuring
    }

    /// Whether switch mode is on.
    pub fn switch_mode(&self) -> bool {
        self.instrument.state.lock().switch_mode
    }

    /// Start the round-robin scan thread. No-op if already scanning.
    pub fn start_simulation(&self) {
        if self.instrument.scanning.swap(true, Ordering::AcqRel) {
            return;
        }
        let instrument = Arc::clone(&self.instrument);
        let spawned = thread::Builder::new()
            .name("mock-wavemeter-scan".into())
            .spawn(move || scan_loop(instrument));
        match spawned {
            Ok(handle) => *self.instrument.scan_thread.lock() = Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to spawn simulated scan thread");
                self.instrument.scanning.store(false, Ordering::Release);
            }
        }
    }

    /// Stop the scan thread and wait for it.
    pub fn stop_simulation(&self) {
        self.instrument.scanning.store(false, Ordering::Release);
        let handle = self.instrument.scan_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
