//! CLI Entry Point for wavemeter-daq
//!
//! Provides a command-line interface for:
//! - Streaming configured channels from the simulated wavemeter
//! - Listing the configured channels and their output units
//! - Printing the sample-rate estimate for a channel selection
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! wavemeter-daq --config config/wavemeter.toml stream --channels cooler,repump --rows 20
//! wavemeter-daq channels
//! wavemeter-daq rate --channels cooler
//! WAVEMETER_WATCHDOG__INTERVAL=250ms wavemeter-daq config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use wavemeter_daq::config::Settings;
use wavemeter_daq::hardware::mock::{MockWavemeter, MockWavemeterHandle};
use wavemeter_daq::{logging, StreamChunk, WavemeterError, WavemeterInstreamer, WavemeterProxy};

#[derive(Parser)]
#[command(name = "wavemeter-daq")]
#[command(about = "Shared multi-consumer wavemeter streaming", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/wavemeter.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream channels and print the rows as they arrive (Ctrl-C to stop)
    Stream {
        /// Channel names, all configured channels if omitted
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,

        /// Rows per read
        #[arg(long, default_value = "10")]
        rows: usize,

        /// Stop after this many reads
        #[arg(long)]
        reads: Option<usize>,
    },

    /// List configured channels
    Channels,

    /// Print the estimated per-channel sample rate
    Rate {
        /// Channel names, all configured channels if omitted
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,
    },

    /// Print the effective configuration (file, defaults and environment merged)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Stream {
            channels,
            rows,
            reads,
        } => stream(&settings, channels, rows, reads).await,
        Commands::Channels => list_channels(&settings),
        Commands::Rate { channels } => rate(&settings, channels),
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn simulator(settings: &Settings) -> (MockWavemeter, MockWavemeterHandle) {
    let sim = &settings.simulator;
    let mut meter = if sim.switch {
        MockWavemeter::new().with_channel_count(sim.channel_count)
    } else {
        MockWavemeter::without_switch()
    };
    let overhead_ms = u32::try_from(settings.proxy.switch_overhead_ms).unwrap_or(u32::MAX);
    meter = meter
        .with_noise(sim.noise_pm * 1e-3)
        .with_time_scale(sim.time_scale)
        .with_switch_overhead(overhead_ms);
    for channel in &settings.channels {
        // spread channels so their traces are distinguishable
        let offset = f64::from(channel.switch_channel - 1) * 0.1;
        meter = meter.with_wavelength(channel.switch_channel, sim.wavelength_nm + offset);
    }
    let handle = meter.handle();
    (meter, handle)
}

fn open_stream(
    settings: &Settings,
    channels: &[String],
) -> Result<(Arc<WavemeterProxy>, MockWavemeterHandle, WavemeterInstreamer)> {
    let (meter, handle) = simulator(settings);
    let proxy = WavemeterProxy::new(Box::new(meter), settings.proxy_settings())?;
    let streamer =
        WavemeterInstreamer::new(Arc::clone(&proxy), &settings.channels, &settings.stream)?;
    if !channels.is_empty() {
        let names: Vec<&str> = channels.iter().map(String::as_str).collect();
        streamer.configure(&names, settings.stream.buffer_size)?;
    }
    Ok((proxy, handle, streamer))
}

async fn stream(
    settings: &Settings,
    channels: Vec<String>,
    rows: usize,
    reads: Option<usize>,
) -> Result<()> {
    let (proxy, handle, streamer) = open_stream(settings, &channels)?;
    let streamer = Arc::new(streamer);
    streamer.start_stream()?;
    handle.start_simulation();

    println!("{}", header(&streamer.active_channel_names(), &streamer));

    let reader = Arc::clone(&streamer);
    let mut reading = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut done = 0;
        while reads.map_or(true, |limit| done < limit) {
            let chunk = reader.read_data(rows)?;
            print_chunk(&chunk);
            done += 1;
        }
        Ok(())
    });

    let outcome = tokio::select! {
        joined = &mut reading => joined.context("reader task failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping stream");
            Ok(())
        }
    };

    streamer.stop_stream()?;
    if !reading.is_finished() {
        // stop_stream unblocks the pending read, which then reports NotRunning
        let _ = reading.await;
    }
    handle.stop_simulation();
    proxy.shutdown();

    if let Err(err) = &outcome {
        if err
            .downcast_ref::<WavemeterError>()
            .is_some_and(WavemeterError::is_overflow)
        {
            warn!("Reader fell behind; increase [stream] buffer_size");
        }
    }
    outcome
}

fn header(names: &[String], streamer: &WavemeterInstreamer) -> String {
    let units = streamer.constraints().channel_units;
    let mut columns = vec!["t [s]".to_string()];
    for name in names {
        let symbol = units.get(name).map_or("?", |u| u.symbol());
        columns.push(format!("{name} [{symbol}]"));
    }
    columns.join("\t")
}

fn print_chunk(chunk: &StreamChunk) {
    let seconds = chunk.timestamps_secs();
    for (row, t) in seconds.iter().enumerate() {
        let start = row * chunk.channel_count;
        let values: Vec<String> = chunk.values[start..start + chunk.channel_count]
            .iter()
            .map(|v| format!("{v:.9e}"))
            .collect();
        println!("{t:.3}\t{}", values.join("\t"));
    }
}

fn list_channels(settings: &Settings) -> Result<()> {
    println!("name\tswitch\tunit\tmedium\texposure");
    for channel in &settings.channels {
        let unit = channel.output_unit()?;
        let exposure = channel
            .exposure_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms} ms"));
        println!(
            "{}\t{}\t{} ({})\t{}\t{}",
            channel.name, channel.switch_channel, channel.unit, unit, channel.medium, exposure
        );
    }
    Ok(())
}

fn rate(settings: &Settings, channels: Vec<String>) -> Result<()> {
    let (proxy, _handle, streamer) = open_stream(settings, &channels)?;
    streamer.start_stream()?;
    let rate = streamer.sample_rate()?;
    println!(
        "{:.3} Hz per channel over {:?}",
        rate,
        streamer.active_channel_names()
    );
    streamer.stop_stream()?;
    proxy.shutdown();
    Ok(())
}
