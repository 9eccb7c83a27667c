//! End-to-end tests: several named-channel streams sharing one simulated wavemeter.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wavemeter_daq::config::Settings;
use wavemeter_daq::hardware::mock::MockWavemeter;
use wavemeter_daq::units::{ChannelUnit, SPEED_OF_LIGHT};
use wavemeter_daq::{WavemeterInstreamer, WavemeterProxy};

const CONFIG: &str = r#"
[watchdog]
interval = "20ms"

[stream]
buffer_size = 2048
poll_interval = "1ms"

[[channels]]
name = "cooler"
switch_channel = 1
exposure_ms = 10

[[channels]]
name = "repump"
switch_channel = 2
unit = "THz"
exposure_ms = 10

[[channels]]
name = "probe"
switch_channel = 3
medium = "air"
exposure_ms = 20
"#;

fn settings() -> Settings {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wavemeter.toml");
    std::fs::write(&path, CONFIG).unwrap();
    let settings = Settings::load_from(&path).unwrap();
    settings.validate().unwrap();
    settings
}

#[test]
fn test_two_streams_share_the_instrument() {
    let settings = settings();
    let meter = MockWavemeter::new()
        .with_noise(0.0)
        .with_time_scale(0.02)
        .with_wavelength(1, 780.0)
        .with_wavelength(2, 795.0)
        .with_wavelength(3, 852.0);
    let handle = meter.handle();
    let proxy = WavemeterProxy::new(Box::new(meter), settings.proxy_settings()).unwrap();

    let first =
        WavemeterInstreamer::new(Arc::clone(&proxy), &settings.channels, &settings.stream).unwrap();
    first.configure(&["repump", "cooler"], 2048).unwrap();
    let second =
        WavemeterInstreamer::new(Arc::clone(&proxy), &settings.channels, &settings.stream).unwrap();
    second.configure(&["probe", "repump"], 2048).unwrap();

    first.start_stream().unwrap();
    second.start_stream().unwrap();
    assert_eq!(handle.enabled_channels(), vec![1, 2, 3]);
    handle.start_simulation();

    let a = first.read_data(20).unwrap();
    let b = second.read_data(20).unwrap();
    handle.stop_simulation();

    assert_eq!(first.active_channel_names(), vec!["cooler", "repump"]);
    assert!((a.channel(0)[0] - 780e-9).abs() < 1e-18);
    let repump_hz = SPEED_OF_LIGHT / 795e-9;
    assert!((a.channel(1)[5] - repump_hz).abs() / repump_hz < 1e-12);

    assert_eq!(second.active_channel_names(), vec!["repump", "probe"]);
    let probe_air = ChannelUnit::AirWavelength.convert(852.0);
    assert!((b.channel(1)[0] - probe_air).abs() < 1e-18);
    assert!(b.channel(1)[0] < 852e-9);

    // timestamps start at zero and increase
    assert_eq!(a.timestamps_ms[0], 0.0);
    assert!(a.timestamps_ms.windows(2).all(|w| w[1] > w[0]));

    second.stop_stream().unwrap();
    assert_eq!(handle.enabled_channels(), vec![1, 2]);
    first.stop_stream().unwrap();
    assert!(!handle.callback_installed());
}

#[test]
fn test_sample_rate_from_configured_exposures() {
    let settings = settings();
    let meter = MockWavemeter::new();
    let proxy = WavemeterProxy::new(Box::new(meter), settings.proxy_settings()).unwrap();
    let streamer =
        WavemeterInstreamer::new(Arc::clone(&proxy), &settings.channels, &settings.stream).unwrap();

    assert_eq!(streamer.sample_rate().unwrap(), 0.0);
    streamer.start_stream().unwrap();
    // 1000 / (10 + 10 + 20 + 3 * 12)
    let rate = streamer.sample_rate().unwrap();
    assert!((rate - 1000.0 / 76.0).abs() < 1e-9);
    assert!(rate >= streamer.constraints().min_sample_rate);
}

#[test]
fn test_non_blocking_reads() {
    let settings = settings();
    let meter = MockWavemeter::new().with_time_scale(0.02);
    let handle = meter.handle();
    let proxy = WavemeterProxy::new(Box::new(meter), settings.proxy_settings()).unwrap();
    let streamer =
        WavemeterInstreamer::new(Arc::clone(&proxy), &settings.channels, &settings.stream).unwrap();
    streamer.configure(&["cooler"], 2048).unwrap();

    streamer.start_stream().unwrap();
    assert!(streamer.read_available_data().unwrap().is_empty());
    assert_eq!(streamer.read_single_point().unwrap(), None);

    handle.start_simulation();
    thread::sleep(Duration::from_millis(100));
    handle.stop_simulation();

    let available = streamer.available_samples();
    assert!(available > 0);
    let point = streamer.read_single_point().unwrap().unwrap();
    assert_eq!(streamer.available_samples(), available);

    let mut values = vec![0.0; available];
    let mut timestamps = vec![0.0; available];
    assert_eq!(
        streamer.read_data_into(&mut values, &mut timestamps).unwrap(),
        available
    );
    assert_eq!(values[available - 1], point.0[0]);
    assert_eq!(timestamps[available - 1], point.1);
    assert_eq!(streamer.available_samples(), 0);
}
