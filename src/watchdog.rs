//! Proxy watchdog.
//!
//! A background thread that periodically turns what the notification thread could
//! only flag into action:
//!
//! 0. log deferred events and stop consumers whose buffers overflowed
//! 1. on a raised fault flag, stop every consumer and clear the flag
//! 2. otherwise compare the instrument's enabled channels with the subscriptions and
//!    stop every consumer on mismatch
//!
//! The thread holds only a `Weak` reference to the proxy and exits when the proxy
//! is gone or [`Watchdog::stop`] is called.

use std::sync::Arc;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Result, WavemeterError};
use crate::proxy::{ConsumerId, ProxyEvent, WavemeterProxy};

/// Lifecycle of the watchdog thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Polling
    Running,
    /// Torn down
    Stopped,
}

/// Outcome of one watchdog iteration.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Deferred events logged
    pub events: usize,
    /// Consumers stopped because their buffer overflowed
    pub overflow_stops: Vec<ConsumerId>,
    /// Cause of a full stop, if one was forced
    pub forced: Option<WavemeterError>,
    /// Consumers stopped by the full stop
    pub stopped: usize,
}

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle on the watchdog thread.
pub struct Watchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start polling `proxy` every `interval`.
    pub fn spawn(proxy: Weak<WavemeterProxy>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(WavemeterError::invalid_config(
                "watchdog interval must be non-zero",
            ));
        }
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("wavemeter-watchdog".into())
            .spawn(move || run(thread_shared, proxy, interval))?;
        debug!(?interval, "Watchdog started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatchdogState {
        if *self.shared.stop.lock() || self.thread.as_ref().map_or(true, JoinHandle::is_finished)
        {
            WatchdogState::Stopped
        } else {
            WatchdogState::Running
        }
    }

    /// Stop the thread and wait for it, unless called from the thread itself.
    pub fn stop(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Watchdog thread panicked");
            }
            debug!("Watchdog stopped");
        }
    }

    /// Run one iteration against `proxy`.
    pub fn poll(proxy: &WavemeterProxy) -> PollReport {
        let mut report = PollReport::default();

        let events = proxy.drain_events();
        report.events = events.len();
        for event in &events {
            log_event(event);
        }
        let dropped = proxy.take_dropped_events();
        if dropped > 0 {
            warn!(dropped, "Notification events lost, event queue full");
        }

        for consumer in proxy.take_overflowed() {
            match proxy.stop_consumer(consumer) {
                Ok(true) => {
                    warn!(%consumer, "Consumer stopped after buffer overflow");
                    report.overflow_stops.push(consumer);
                }
                Ok(false) => {}
                Err(err) => {
                    error!(%consumer, error = %err, "Stopping overflowed consumer failed");
                    report.overflow_stops.push(consumer);
                }
            }
        }

        if let Some(reason) = proxy.take_fault() {
            error!(%reason, "Instrument fault reported, stopping all consumers");
            report.stopped = proxy.force_stop_all();
            report.forced = Some(WavemeterError::CallbackFault { reason });
            return report;
        }

        match proxy.verify_channels() {
            Ok(()) => {}
            Err(err @ WavemeterError::Drift { .. }) => {
                warn!(error = %err, "Instrument channels changed behind the proxy");
                report.stopped = proxy.force_stop_all();
                report.forced = Some(err);
            }
            Err(err) => {
                error!(error = %err, "Could not query active channels");
                report.stopped = proxy.force_stop_all();
                report.forced = Some(err);
            }
        }
        report
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_event(event: &ProxyEvent) {
    match event {
        ProxyEvent::InvalidSample { channel, fault } => {
            warn!(channel, %fault, "Invalid wavemeter reading");
        }
        ProxyEvent::SignalRestored { channel } => {
            info!(channel, "Wavemeter reading valid again");
        }
        ProxyEvent::Overflow { consumer } => {
            debug!(%consumer, "Overflow reported by notification thread");
        }
    }
}

fn run(shared: Arc<Shared>, proxy: Weak<WavemeterProxy>, interval: Duration) {
    loop {
        {
            let mut stop = shared.stop.lock();
            if !*stop {
                shared.wake.wait_for(&mut stop, interval);
            }
            if *stop {
                break;
            }
        }
        let Some(proxy) = proxy.upgrade() else {
            break;
        };
        let report = Watchdog::poll(&proxy);
        if report.forced.is_some() || !report.overflow_stops.is_empty() {
            debug!(
                stopped = report.stopped,
                overflowed = report.overflow_stops.len(),
                "Watchdog intervened"
            );
        }
    }
    debug!("Watchdog thread exiting");
}
