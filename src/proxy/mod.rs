//! Arbitration proxy.
//!
//! [`WavemeterProxy`] is the only owner of the instrument driver. Consumers subscribe
//! with an ordered list of switch channels and a [`StreamBuffer`]; the proxy enables the
//! union of all subscriptions on the instrument, installs a single notification handler
//! and routes every reading to the buffers that asked for its channel.
//!
//! # Locking
//!
//! `connect`, `disconnect`, `force_stop_all` and watchdog consistency checks are
//! serialized by one connection lock. The notification thread never takes it; see
//! [`dispatch`] for the fan-out side.
//!
//! # Example
//!
//! ```rust,ignore
//! let meter = MockWavemeter::new();
//! let proxy = WavemeterProxy::new(Box::new(meter), ProxySettings::default())?;
//!
//! let buffer = Arc::new(StreamBuffer::new());
//! buffer.start(1024, 2)?;
//! proxy.connect(Arc::clone(&buffer), &[1, 2])?;
//! let chunk = buffer.read(10)?;
//! proxy.disconnect(buffer.id())?;
//! ```

pub mod dispatch;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FaultReason, Result, WavemeterError};
use crate::hardware::{NotificationHandler, WavemeterDriver};
use crate::stream::StreamBuffer;
use crate::watchdog::{Watchdog, WatchdogState};

pub use dispatch::ProxyEvent;
use dispatch::{Dispatcher, Route};

/// Identity of one consumer (one stream buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proxy tuning.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Time the switch needs to move between two channels
    pub switch_overhead: Duration,
    /// Run the watchdog thread
    pub watchdog_enabled: bool,
    /// Watchdog polling period
    pub watchdog_interval: Duration,
    /// Deferred events the notification thread may queue between watchdog polls
    pub event_queue_capacity: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            switch_overhead: Duration::from_millis(12),
            watchdog_enabled: true,
            watchdog_interval: Duration::from_secs(1),
            event_queue_capacity: 1024,
        }
    }
}

#[derive(Default)]
struct ConnectionTable {
    routes: Vec<Route>,
    connected: BTreeSet<u32>,
}

impl ConnectionTable {
    fn union(&self) -> BTreeSet<u32> {
        self.routes
            .iter()
            .flat_map(|r| r.channels.iter().copied())
            .collect()
    }

    fn position(&self, consumer: ConsumerId) -> Option<usize> {
        self.routes.iter().position(|r| r.consumer == consumer)
    }
}

/// Exclusive owner of the instrument, shared by all consumers.
pub struct WavemeterProxy {
    driver: Box<dyn WavemeterDriver>,
    settings: ProxySettings,
    has_switch: bool,
    table: Mutex<ConnectionTable>,
    dispatcher: Arc<Dispatcher>,
    events: Mutex<mpsc::Receiver<ProxyEvent>>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl WavemeterProxy {
    /// Take ownership of the driver, enable switch mode and start the watchdog.
    pub fn new(driver: Box<dyn WavemeterDriver>, settings: ProxySettings) -> Result<Arc<Self>> {
        if settings.event_queue_capacity == 0 {
            return Err(WavemeterError::invalid_config(
                "event queue capacity must be non-zero",
            ));
        }
        let has_switch = driver.has_switch();
        if has_switch {
            driver.set_switch_mode(true)?;
        }

        let (tx, rx) = mpsc::channel(settings.event_queue_capacity);
        let proxy = Arc::new(Self {
            driver,
            has_switch,
            table: Mutex::new(ConnectionTable::default()),
            dispatcher: Arc::new(Dispatcher::new(tx)),
            events: Mutex::new(rx),
            watchdog: Mutex::new(None),
            settings,
        });

        if proxy.settings.watchdog_enabled {
            let watchdog = Watchdog::spawn(Arc::downgrade(&proxy), proxy.settings.watchdog_interval)?;
            *proxy.watchdog.lock() = Some(watchdog);
        }

        info!(
            has_switch,
            watchdog = proxy.settings.watchdog_enabled,
            "Wavemeter proxy ready"
        );
        Ok(proxy)
    }

    /// Settings the proxy was created with.
    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Whether the instrument has a channel switch.
    pub fn has_switch(&self) -> bool {
        self.has_switch
    }

    /// Channel 1 of a switch-less instrument cannot be toggled.
    fn is_fixed(&self, channel: u32) -> bool {
        !self.has_switch && channel == 1
    }

    /// Register a consumer and enable the channels it needs.
    ///
    /// `channels` is the consumer's subscription in scan order; index 0 is its timing
    /// reference. The buffer must already be started with `channels.len()` columns.
    pub fn connect(&self, buffer: Arc<StreamBuffer>, channels: &[u32]) -> Result<()> {
        let consumer = buffer.id();
        let mut table = self.table.lock();
        if table.position(consumer).is_some() {
            return Err(WavemeterError::AlreadyConnected { consumer });
        }
        if channels.is_empty() {
            return Err(WavemeterError::invalid_config("subscription has no channels"));
        }
        let unique: BTreeSet<u32> = channels.iter().copied().collect();
        if unique.len() != channels.len() {
            return Err(WavemeterError::invalid_config(format!(
                "subscription {channels:?} lists a channel twice"
            )));
        }
        if !buffer.is_running() {
            return Err(WavemeterError::invalid_config(format!(
                "buffer of consumer {consumer} is not started"
            )));
        }
        if buffer.channel_count() != channels.len() {
            return Err(WavemeterError::invalid_config(format!(
                "buffer has {} columns, subscription {channels:?} needs {}",
                buffer.channel_count(),
                channels.len()
            )));
        }

        let first = table.routes.is_empty();
        let mut activated = Vec::new();
        for &channel in channels {
            if table.connected.contains(&channel) || self.is_fixed(channel) {
                continue;
            }
            if let Err(err) = self.driver.activate_channel(channel) {
                error!(%consumer, channel, error = %err, "Channel activation rejected");
                self.deactivate_all(&activated);
                return Err(err);
            }
            activated.push(channel);
        }

        table.routes.push(Route {
            consumer,
            channels: channels.to_vec(),
            buffer,
        });
        table.connected.extend(channels.iter().copied());

        if first {
            if let Err(err) = self.begin_acquisition(&table.connected) {
                error!(%consumer, error = %err, "Failed to start acquisition");
                table.routes.clear();
                table.connected.clear();
                self.deactivate_all(&activated);
                if let Err(cleanup) = self.driver.remove_callback() {
                    warn!(error = %cleanup, "Handler cleanup after failed start failed");
                }
                return Err(err);
            }
        }
        self.dispatcher.publish(table.routes.clone());

        info!(
            %consumer,
            ?channels,
            newly_enabled = ?activated,
            consumers = table.routes.len(),
            "Consumer connected"
        );
        Ok(())
    }

    /// Clean slate for the first consumer: disable stray channels, install the
    /// handler and start measuring.
    fn begin_acquisition(&self, wanted: &BTreeSet<u32>) -> Result<()> {
        for channel in self.driver.active_channels()? {
            if !wanted.contains(&channel) && !self.is_fixed(channel) {
                debug!(channel, "Disabling stray channel");
                self.driver.deactivate_channel(channel)?;
            }
        }
        self.dispatcher.reset_validity();
        let dispatcher = Arc::clone(&self.dispatcher);
        let handler: NotificationHandler = Arc::new(move |n| dispatcher.handle(n));
        self.driver.install_callback(handler)?;
        self.driver.start_measurement()
    }

    fn deactivate_all(&self, channels: &[u32]) {
        for &channel in channels {
            if let Err(err) = self.driver.deactivate_channel(channel) {
                warn!(channel, error = %err, "Rollback of channel activation failed");
            }
        }
    }

    /// Unregister a consumer, stop its buffer and disable channels nobody needs anymore.
    ///
    /// Unknown consumers are ignored with a warning. Cleanup runs to completion; the
    /// first driver error encountered is returned afterwards.
    pub fn disconnect(&self, consumer: ConsumerId) -> Result<()> {
        match self.remove(consumer) {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(%consumer, "Disconnect of unknown consumer ignored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Disconnect a consumer if it is still registered. Returns whether it was.
    pub fn stop_consumer(&self, consumer: ConsumerId) -> Result<bool> {
        self.remove(consumer)
    }

    fn remove(&self, consumer: ConsumerId) -> Result<bool> {
        let mut table = self.table.lock();
        let Some(pos) = table.position(consumer) else {
            return Ok(false);
        };
        let route = table.routes.remove(pos);
        let remaining = table.union();
        let dropped: Vec<u32> = table.connected.difference(&remaining).copied().collect();
        table.connected = remaining;
        self.dispatcher.publish(table.routes.clone());
        route.buffer.stop();

        let mut first_error = None;
        for &channel in dropped.iter().filter(|&&ch| !self.is_fixed(ch)) {
            if let Err(err) = self.driver.deactivate_channel(channel) {
                error!(%consumer, channel, error = %err, "Channel deactivation failed");
                first_error.get_or_insert(err);
            }
        }
        if table.routes.is_empty() {
            if let Err(err) = self.driver.remove_callback() {
                error!(error = %err, "Failed to remove notification handler");
                first_error.get_or_insert(err);
            }
        }

        info!(
            %consumer,
            disabled = ?dropped,
            consumers = table.routes.len(),
            "Consumer disconnected"
        );
        first_error.map_or(Ok(true), Err)
    }

    /// Stop every consumer at once, leaving channel activation untouched.
    ///
    /// Used when the instrument's state can no longer be trusted. Returns the number
    /// of consumers stopped.
    pub fn force_stop_all(&self) -> usize {
        let mut table = self.table.lock();
        let routes = std::mem::take(&mut table.routes);
        table.connected.clear();
        self.dispatcher.publish(Vec::new());
        if let Err(err) = self.driver.remove_callback() {
            error!(error = %err, "Failed to remove notification handler");
        }
        for route in &routes {
            route.buffer.stop();
        }
        if !routes.is_empty() {
            warn!(consumers = routes.len(), "Forced stop of all consumers");
        }
        routes.len()
    }

    /// Compare the instrument's enabled channels with the subscribed ones.
    ///
    /// Holds the connection lock during the query so a concurrent connect cannot
    /// produce a false mismatch. Succeeds trivially with no consumer connected.
    pub fn verify_channels(&self) -> Result<()> {
        let table = self.table.lock();
        if table.routes.is_empty() {
            return Ok(());
        }
        let mut actual = self.driver.active_channels()?;
        actual.sort_unstable();
        actual.dedup();
        let expected: Vec<u32> = table.connected.iter().copied().collect();
        if actual != expected {
            return Err(WavemeterError::Drift { expected, actual });
        }
        Ok(())
    }

    /// Set a channel's exposure time.
    ///
    /// The instrument works in whole milliseconds; any other duration is rejected.
    pub fn set_exposure(&self, channel: u32, exposure: Duration) -> Result<()> {
        if exposure.subsec_nanos() % 1_000_000 != 0 {
            return Err(WavemeterError::invalid_config(format!(
                "exposure {exposure:?} is not a whole number of milliseconds"
            )));
        }
        let ms = u32::try_from(exposure.as_millis()).map_err(|_| {
            WavemeterError::invalid_config(format!("exposure {exposure:?} is out of range"))
        })?;
        self.driver.set_exposure(channel, ms)?;
        debug!(channel, exposure_ms = ms, "Exposure set");
        Ok(())
    }

    /// A channel's exposure time.
    pub fn exposure(&self, channel: u32) -> Result<Duration> {
        Ok(Duration::from_millis(u64::from(self.driver.exposure(channel)?)))
    }

    /// Rate at which every active channel receives a new reading, in Hz.
    ///
    /// One scan visits each active channel once, taking its exposure plus the switch
    /// overhead. Returns 0 when no channel is active.
    pub fn estimated_sample_rate(&self) -> Result<f64> {
        let active = self.driver.active_channels()?;
        if active.is_empty() {
            return Ok(0.0);
        }
        let overhead_ms = self.settings.switch_overhead.as_secs_f64() * 1e3;
        let mut scan_ms = 0.0;
        for &channel in &active {
            scan_ms += f64::from(self.driver.exposure(channel)?) + overhead_ms;
        }
        if scan_ms <= 0.0 {
            return Ok(0.0);
        }
        Ok(1e3 / scan_ms)
    }

    /// Channels the instrument reports as enabled.
    pub fn active_channels(&self) -> Result<Vec<u32>> {
        self.driver.active_channels()
    }

    /// Union of all subscriptions.
    pub fn connected_channels(&self) -> BTreeSet<u32> {
        self.table.lock().connected.clone()
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.table.lock().routes.len()
    }

    /// Whether a consumer is registered.
    pub fn is_connected(&self, consumer: ConsumerId) -> bool {
        self.table.lock().position(consumer).is_some()
    }

    /// Last vacuum wavelength (nm) measured on a channel.
    pub fn current_wavelength(&self, channel: u32) -> Result<f64> {
        self.driver.wavelength(channel)
    }

    /// Deferred events queued by the notification thread since the last call.
    pub fn drain_events(&self) -> Vec<ProxyEvent> {
        let mut rx = self.events.lock();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Events lost because the queue was full, since the last call.
    pub fn take_dropped_events(&self) -> u64 {
        self.dispatcher.take_dropped_events()
    }

    /// Consumers whose buffers overflowed and still need stopping.
    pub fn take_overflowed(&self) -> Vec<ConsumerId> {
        self.dispatcher.take_overflowed()
    }

    /// Whether the notification thread reported a fault not yet handled.
    pub fn fault_pending(&self) -> bool {
        self.dispatcher.fault_pending()
    }

    /// Clear the fault flag and return its reason.
    pub fn take_fault(&self) -> Option<FaultReason> {
        self.dispatcher.take_fault()
    }

    /// State of the background watchdog, `Stopped` if it was never started.
    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog
            .lock()
            .as_ref()
            .map_or(WatchdogState::Stopped, Watchdog::state)
    }

    /// Stop the watchdog and every consumer. Idempotent.
    pub fn shutdown(&self) {
        let watchdog = self.watchdog.lock().take();
        if let Some(mut watchdog) = watchdog {
            watchdog.stop();
        }
        let stopped = self.force_stop_all();
        debug!(stopped, "Wavemeter proxy shut down");
    }
}

impl Drop for WavemeterProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
