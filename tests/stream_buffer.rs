//! Integration tests for the per-consumer stream buffer
//!
//! Covers FIFO ordering, overflow at exactly one row past capacity, misaligned input,
//! relative timestamps, and blocking reads under load.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use wavemeter_daq::hardware::mock::MockWavemeter;
use wavemeter_daq::stream::InsertOutcome;
use wavemeter_daq::{ProxySettings, StreamBuffer, WavemeterProxy};

fn buffer(capacity: usize, channels: usize) -> StreamBuffer {
    let buffer = StreamBuffer::with_poll_interval(Duration::from_millis(1));
    buffer.start(capacity, channels).unwrap();
    buffer
}

#[test]
fn test_fifo_round_trip() {
    let buf = buffer(16, 2);
    let mut expected = Vec::new();
    for row in 0..5u32 {
        for ch in 0..2u32 {
            let nm = 700.0 + f64::from(row) * 10.0 + f64::from(ch);
            buf.insert(ch as usize, nm, f64::from(row) * 44.0).unwrap();
            expected.push(nm * 1e-9);
        }
    }

    let chunk = buf.read_available(usize::MAX).unwrap();
    assert_eq!(chunk.rows(), 5);
    assert_eq!(chunk.values.len(), expected.len());
    for (got, want) in chunk.values.iter().zip(&expected) {
        assert!((got - want).abs() < 1e-18);
    }
    assert_eq!(chunk.timestamps_ms, vec![0.0, 44.0, 88.0, 132.0, 176.0]);

    // nothing is read twice
    assert!(buf.read_available(usize::MAX).unwrap().is_empty());
}

#[test]
fn test_read_available_respects_max() {
    let buf = buffer(16, 1);
    for i in 0..6u32 {
        buf.insert(0, 780.0, f64::from(i)).unwrap();
    }
    assert_eq!(buf.read_available(4).unwrap().rows(), 4);
    assert_eq!(buf.read_available(4).unwrap().timestamps_ms, vec![4.0, 5.0]);
}

#[test]
fn test_overflow_exactly_one_row_past_capacity() {
    let capacity = 8;
    let buf = buffer(capacity, 2);
    for row in 0..capacity {
        buf.insert(0, 780.0, row as f64).unwrap();
        buf.insert(1, 781.0, row as f64).unwrap();
    }
    assert_eq!(buf.available_rows(), capacity);

    let err = buf.insert(0, 780.0, 99.0).unwrap_err();
    assert!(err.is_overflow());
    assert!(buf.has_overflowed());
    // sticky
    assert!(buf.insert(1, 781.0, 99.0).unwrap_err().is_overflow());
    assert!(buf.read_available(1).unwrap_err().is_overflow());
    assert!(buf.read(1).unwrap_err().is_overflow());
}

#[test]
fn test_misaligned_input_is_dropped() {
    let buf = buffer(8, 3);
    buf.insert(0, 700.0, 0.0).unwrap();
    buf.insert(1, 701.0, 1.0).unwrap();
    buf.insert(2, 702.0, 2.0).unwrap();
    let before = buf.read_single_point().unwrap();

    // channel 1 dropped out: 0 then 2 arrive
    assert_eq!(buf.insert(0, 710.0, 40.0).unwrap(), InsertOutcome::Stored);
    assert_eq!(buf.insert(2, 712.0, 42.0).unwrap(), InsertOutcome::Discarded);
    assert_eq!(buf.insert(2, 712.0, 42.0).unwrap(), InsertOutcome::Discarded);
    assert_eq!(buf.read_single_point().unwrap(), before);
    assert_eq!(buf.available_rows(), 1);

    buf.insert(1, 711.0, 41.0).unwrap();
    buf.insert(2, 712.0, 42.0).unwrap();
    let chunk = buf.read_available(10).unwrap();
    assert_eq!(chunk.rows(), 2);
    assert_eq!(chunk.timestamps_ms, vec![0.0, 40.0]);
    assert!((chunk.channel(2)[1] - 712e-9).abs() < 1e-18);
}

#[test]
fn test_relative_timestamp_of_second_row() {
    let t0 = 1_234_567.0;
    let buf = buffer(8, 1);
    buf.insert(0, 780.0, t0).unwrap();
    buf.insert(0, 780.0, t0 + 50.0).unwrap();
    let chunk = buf.read(2).unwrap();
    assert_eq!(chunk.timestamps_ms[0], 0.0);
    assert_eq!(chunk.timestamps_ms[1], 50.0);
    assert_eq!(chunk.timestamps_secs()[1], 0.05);
}

#[test]
fn test_blocking_read_waits_for_rows() {
    let buf = Arc::new(buffer(64, 1));
    let writer = Arc::clone(&buf);
    let producer = thread::spawn(move || {
        for i in 0..10u32 {
            thread::sleep(Duration::from_millis(5));
            writer.insert(0, 780.0, f64::from(i) * 5.0).unwrap();
        }
    });

    let chunk = buf.read(10).unwrap();
    assert_eq!(chunk.rows(), 10);
    assert_eq!(chunk.timestamps_ms[9], 45.0);
    producer.join().unwrap();
}

#[test]
fn test_stop_unblocks_reader() {
    let buf = Arc::new(buffer(64, 1));
    let reader = Arc::clone(&buf);
    let started = Instant::now();
    let blocked = thread::spawn(move || reader.read(10));

    thread::sleep(Duration::from_millis(50));
    buf.stop();
    let result = blocked.join().unwrap();
    assert!(result.unwrap_err().is_not_running());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_slow_reader_does_not_stall_others() {
    let meter = MockWavemeter::new().with_time_scale(0.02).with_noise(0.0);
    let handle = meter.handle();
    let proxy = WavemeterProxy::new(
        Box::new(meter),
        ProxySettings {
            watchdog_interval: Duration::from_millis(20),
            ..ProxySettings::default()
        },
    )
    .unwrap();

    // never read: overflows quickly
    let slow = Arc::new(StreamBuffer::new());
    slow.start(128, 1).unwrap();
    proxy.connect(Arc::clone(&slow), &[1]).unwrap();

    let fast: Vec<Arc<StreamBuffer>> = (0..3)
        .map(|_| {
            let b = Arc::new(StreamBuffer::with_poll_interval(Duration::from_millis(1)));
            b.start(4096, 2).unwrap();
            proxy.connect(Arc::clone(&b), &[1, 2]).unwrap();
            b
        })
        .collect();

    handle.start_simulation();
    let readers: Vec<_> = fast
        .iter()
        .map(|b| {
            let b = Arc::clone(b);
            thread::spawn(move || {
                let mut rows = 0;
                while rows < 200 {
                    rows += b.read(20).unwrap().rows();
                }
                rows
            })
        })
        .collect();

    for reader in readers {
        assert!(reader.join().unwrap() >= 200);
    }

    // the watchdog stops the overflowed consumer, others keep running
    let deadline = Instant::now() + Duration::from_secs(5);
    while proxy.is_connected(slow.id()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    handle.stop_simulation();

    assert!(slow.has_overflowed());
    assert!(!proxy.is_connected(slow.id()));
    assert!(slow.read_available(1).unwrap_err().is_overflow());
    assert!(fast.iter().all(|b| b.is_running()));
    assert_eq!(proxy.consumer_count(), 3);
    assert_eq!(proxy.connected_channels().into_iter().collect::<Vec<_>>(), vec![1, 2]);
}
