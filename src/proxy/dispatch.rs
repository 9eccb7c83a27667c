//! Notification fan-out.
//!
//! Everything in this module runs on the instrument's notification thread. It never
//! takes the proxy's connection lock: routes are read from an `Arc` snapshot that is
//! swapped wholesale on every connect or disconnect, and each buffer has its own lock.
//! Conditions that need more than a hand-off (logging, stopping a consumer, a full
//! stop) are queued for the watchdog.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::ConsumerId;
use crate::error::FaultReason;
use crate::hardware::{Notification, SampleFault};
use crate::stream::StreamBuffer;

/// Deferred event produced on the notification thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProxyEvent {
    /// A channel started delivering error codes
    InvalidSample {
        /// Switch channel
        channel: u32,
        /// Decoded error code
        fault: SampleFault,
    },
    /// A channel delivers valid readings again
    SignalRestored {
        /// Switch channel
        channel: u32,
    },
    /// A consumer's buffer overflowed
    Overflow {
        /// Consumer to be stopped
        consumer: ConsumerId,
    },
}

/// One consumer's subscription as seen by the fan-out.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) consumer: ConsumerId,
    pub(crate) channels: Vec<u32>,
    pub(crate) buffer: Arc<StreamBuffer>,
}

pub(crate) struct Dispatcher {
    routes: RwLock<Arc<Vec<Route>>>,
    fault: AtomicBool,
    fault_reason: Mutex<Option<FaultReason>>,
    pending_stops: Mutex<Vec<ConsumerId>>,
    /// Bit `n - 1` set while channel `n` reports error codes
    invalid_mask: AtomicU64,
    /// Invalid channels above 64, which the mask cannot hold
    invalid_high: Mutex<BTreeSet<u32>>,
    events: mpsc::Sender<ProxyEvent>,
    dropped_events: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(events: mpsc::Sender<ProxyEvent>) -> Self {
        Self {
            routes: RwLock::new(Arc::new(Vec::new())),
            fault: AtomicBool::new(false),
            fault_reason: Mutex::new(None),
            pending_stops: Mutex::new(Vec::new()),
            invalid_mask: AtomicU64::new(0),
            invalid_high: Mutex::new(BTreeSet::new()),
            events,
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Replace the routing table seen by the notification thread.
    pub(crate) fn publish(&self, routes: Vec<Route>) {
        *self.routes.write() = Arc::new(routes);
    }

    fn snapshot(&self) -> Arc<Vec<Route>> {
        Arc::clone(&self.routes.read())
    }

    pub(crate) fn handle(&self, notification: Notification) {
        match notification {
            Notification::Sample {
                channel,
                value,
                timestamp_ms,
            } => self.on_sample(channel, value, timestamp_ms),
            Notification::MeasurementStopped => self.raise(FaultReason::MeasurementStopped),
            Notification::SwitchModeChanged => self.raise(FaultReason::SwitchModeChanged),
            Notification::PulseModeChanged => self.raise(FaultReason::PulseModeChanged),
            Notification::Other => {}
        }
    }

    fn on_sample(&self, channel: u32, value: f64, timestamp_ms: f64) {
        let value = self.validate(channel, value);
        let routes = self.snapshot();
        for route in routes.iter() {
            let Some(index) = route.channels.iter().position(|&c| c == channel) else {
                continue;
            };
            if let Err(err) = route.buffer.insert(index, value, timestamp_ms) {
                if err.is_overflow() {
                    self.flag_overflow(route.consumer);
                }
            }
        }
    }

    /// Map error codes to NaN, emitting an event on each validity transition.
    fn validate(&self, channel: u32, value: f64) -> f64 {
        let fault = SampleFault::from_value(value);
        let changed = self.mark_invalid(channel, fault.is_some());
        match fault {
            Some(fault) => {
                if changed {
                    self.push(ProxyEvent::InvalidSample { channel, fault });
                }
                f64::NAN
            }
            None => {
                if changed {
                    self.push(ProxyEvent::SignalRestored { channel });
                }
                value
            }
        }
    }

    /// Record a channel's validity. Returns whether it differs from the previous reading.
    fn mark_invalid(&self, channel: u32, invalid: bool) -> bool {
        match channel {
            1..=64 => {
                let bit = 1u64 << (channel - 1);
                let previous = if invalid {
                    self.invalid_mask.fetch_or(bit, Ordering::AcqRel)
                } else {
                    self.invalid_mask.fetch_and(!bit, Ordering::AcqRel)
                };
                (previous & bit != 0) != invalid
            }
            _ => {
                let mut high = self.invalid_high.lock();
                if invalid {
                    high.insert(channel)
                } else {
                    high.remove(&channel)
                }
            }
        }
    }

    fn flag_overflow(&self, consumer: ConsumerId) {
        let mut pending = self.pending_stops.lock();
        if !pending.contains(&consumer) {
            pending.push(consumer);
            drop(pending);
            self.push(ProxyEvent::Overflow { consumer });
        }
    }

    fn raise(&self, reason: FaultReason) {
        self.fault_reason.lock().get_or_insert(reason);
        self.fault.store(true, Ordering::Release);
    }

    fn push(&self, event: ProxyEvent) {
        if self.events.try_send(event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn fault_pending(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }

    /// Clear the fault flag, returning the first reason raised since the last call.
    pub(crate) fn take_fault(&self) -> Option<FaultReason> {
        if !self.fault.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.fault_reason.lock().take()
    }

    pub(crate) fn take_overflowed(&self) -> Vec<ConsumerId> {
        std::mem::take(&mut *self.pending_stops.lock())
    }

    pub(crate) fn take_dropped_events(&self) -> u64 {
        self.dropped_events.swap(0, Ordering::Relaxed)
    }

    /// Forget validity history, so the next error code on any channel is reported again.
    pub(crate) fn reset_validity(&self) {
        self.invalid_mask.store(0, Ordering::Release);
        self.invalid_high.lock().clear();
    }
}
