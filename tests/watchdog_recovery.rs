//! Integration tests for watchdog recovery
//!
//! Faults reported by the instrument and channel changes made behind the proxy's back
//! must stop every consumer; stopped consumers must be able to start again.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use wavemeter_daq::config::{ChannelConfig, StreamConfig};
use wavemeter_daq::error::FaultReason;
use wavemeter_daq::hardware::mock::{MockWavemeter, MockWavemeterHandle};
use wavemeter_daq::hardware::Notification;
use wavemeter_daq::{
    ProxySettings, StreamBuffer, Watchdog, WatchdogState, WavemeterError, WavemeterInstreamer,
    WavemeterProxy,
};

const INTERVAL: Duration = Duration::from_millis(50);

fn setup(watchdog: bool) -> (Arc<WavemeterProxy>, MockWavemeterHandle) {
    let meter = MockWavemeter::new();
    let handle = meter.handle();
    let settings = ProxySettings {
        watchdog_enabled: watchdog,
        watchdog_interval: INTERVAL,
        ..ProxySettings::default()
    };
    (WavemeterProxy::new(Box::new(meter), settings).unwrap(), handle)
}

fn consumer(channels: usize) -> Arc<StreamBuffer> {
    let buffer = Arc::new(StreamBuffer::with_poll_interval(Duration::from_millis(1)));
    buffer.start(256, channels).unwrap();
    buffer
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_drift_forces_stop_within_one_interval() {
    let (proxy, handle) = setup(true);
    assert_eq!(proxy.watchdog_state(), WatchdogState::Running);
    let a = consumer(2);
    let b = consumer(1);
    proxy.connect(Arc::clone(&a), &[1, 2]).unwrap();
    proxy.connect(Arc::clone(&b), &[2]).unwrap();

    // another program enables channel 4
    handle.set_channel_externally(4, true);

    // one full interval plus scheduling slack
    let stopped = wait_until(INTERVAL * 3, || !a.is_running() && !b.is_running());
    assert!(stopped, "consumers still running after drift");
    assert_eq!(proxy.consumer_count(), 0);
    assert!(!handle.callback_installed());
    // force stop leaves the instrument's channels alone
    assert_eq!(handle.enabled_channels(), vec![1, 2, 4]);
    assert_eq!(proxy.watchdog_state(), WatchdogState::Running);
}

#[test]
fn test_manual_poll_reports_drift() {
    let (proxy, handle) = setup(false);
    let a = consumer(2);
    proxy.connect(Arc::clone(&a), &[1, 2]).unwrap();
    handle.set_channel_externally(4, true);

    let report = Watchdog::poll(&proxy);
    match report.forced {
        Some(WavemeterError::Drift { expected, actual }) => {
            assert_eq!(expected, vec![1, 2]);
            assert_eq!(actual, vec![1, 2, 4]);
        }
        other => panic!("expected drift, got {other:?}"),
    }
    assert_eq!(report.stopped, 1);
    assert!(a.read_available(1).unwrap_err().is_not_running());
}

#[test]
fn test_no_drift_check_without_consumers() {
    let (proxy, handle) = setup(false);
    handle.set_channel_externally(3, true);
    let report = Watchdog::poll(&proxy);
    assert!(report.forced.is_none());
}

#[test]
fn test_callback_fault_forces_stop() {
    let (proxy, handle) = setup(false);
    let a = consumer(1);
    proxy.connect(Arc::clone(&a), &[1]).unwrap();

    handle.stop_measurement_externally();
    assert!(proxy.fault_pending());
    // delivery keeps working until the watchdog acts
    handle.emit_sample(1, 780.0, 0.0);
    assert_eq!(a.available_rows(), 1);

    let report = Watchdog::poll(&proxy);
    assert!(matches!(
        report.forced,
        Some(WavemeterError::CallbackFault {
            reason: FaultReason::MeasurementStopped
        })
    ));
    assert_eq!(report.stopped, 1);
    assert!(!proxy.fault_pending());
    assert!(!a.is_running());

    // flag was cleared: next poll is quiet
    assert!(Watchdog::poll(&proxy).forced.is_none());
}

#[test]
fn test_switch_mode_change_handled_by_thread() {
    let (proxy, handle) = setup(true);
    let a = consumer(1);
    proxy.connect(Arc::clone(&a), &[3]).unwrap();
    handle.emit(Notification::SwitchModeChanged);
    assert!(wait_until(INTERVAL * 3, || !a.is_running()));
    assert!(!proxy.fault_pending());
}

#[test]
fn test_overflowed_consumer_stopped_alone() {
    let (proxy, handle) = setup(false);
    let small = Arc::new(StreamBuffer::new());
    small.start(2, 1).unwrap();
    let large = consumer(1);
    proxy.connect(Arc::clone(&small), &[1]).unwrap();
    proxy.connect(Arc::clone(&large), &[1]).unwrap();

    for i in 0..5u32 {
        handle.emit_sample(1, 780.0, f64::from(i));
    }
    assert_eq!(large.available_rows(), 5);

    let report = Watchdog::poll(&proxy);
    assert_eq!(report.overflow_stops, vec![small.id()]);
    assert!(report.forced.is_none());
    assert!(!proxy.is_connected(small.id()));
    assert!(proxy.is_connected(large.id()));
    assert!(small.read_available(1).unwrap_err().is_overflow());
    assert_eq!(handle.enabled_channels(), vec![1]);
}

#[test]
fn test_restart_after_forced_stop() {
    let (proxy, handle) = setup(false);
    let channels = vec![ChannelConfig {
        name: "cooler".to_string(),
        switch_channel: 2,
        unit: "nm".to_string(),
        medium: "vac".to_string(),
        exposure_ms: None,
    }];
    let stream = StreamConfig {
        buffer_size: 256,
        poll_interval: Duration::from_millis(1),
    };
    let streamer = WavemeterInstreamer::new(Arc::clone(&proxy), &channels, &stream).unwrap();
    streamer.start_stream().unwrap();

    handle.emit(Notification::PulseModeChanged);
    Watchdog::poll(&proxy);
    assert!(!streamer.is_running());
    assert!(streamer.read_data(1).unwrap_err().is_not_running());

    // fault cleared, fresh start works
    streamer.start_stream().unwrap();
    assert!(handle.callback_installed());
    handle.emit_sample(2, 780.0, 1000.0);
    let (row, ts) = streamer.read_single_point().unwrap().unwrap();
    assert!((row[0] - 780e-9).abs() < 1e-18);
    assert_eq!(ts, 0.0);
}

#[test]
fn test_dropping_proxy_stops_consumers() {
    let (proxy, _handle) = setup(true);
    let a = consumer(1);
    proxy.connect(Arc::clone(&a), &[1]).unwrap();
    drop(proxy);
    // the watchdog may briefly hold the last reference while polling
    assert!(wait_until(INTERVAL * 3, || !a.is_running()));
}
