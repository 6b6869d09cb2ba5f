#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::path::Path;
use weir_core::{BlockFile, ChannelId, Geometry, SamplePos};
use weir_types::decode_samples_le;

#[derive(Debug, Serialize)]
struct InspectOutput {
    path: String,
    bytes: u64,
    channels: u16,
    rows: u64,
    channel_stats: Vec<ChannelStats>,
}

#[derive(Debug, Serialize)]
struct ChannelStats {
    channel: u16,
    min: i16,
    max: i16,
    mean: f64,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "record" => {
            let Some(path) = args.next() else {
                bail!("record requires an output path");
            };
            let mut channels = 4_u16;
            let mut samples_per_block = 1024_u32;
            let mut samples = 30_720_u64;
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--channels" => channels = flag_value(&mut args, "--channels")?,
                    "--samples-per-block" => {
                        samples_per_block = flag_value(&mut args, "--samples-per-block")?;
                    }
                    "--samples" => samples = flag_value(&mut args, "--samples")?,
                    _ => bail!("unknown record flag: {flag}"),
                }
            }
            record(Path::new(&path), channels, samples_per_block, samples)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let mut channels = None;
            let mut json = false;
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--channels" => channels = Some(flag_value(&mut args, "--channels")?),
                    "--json" => json = true,
                    _ => bail!("unknown inspect flag: {flag}"),
                }
            }
            let Some(channels) = channels else {
                bail!("inspect requires --channels <count>");
            };
            inspect(Path::new(&path), channels, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("weir-cli\n");
    println!("USAGE:");
    println!(
        "  weir-cli record <output-path> [--channels N] [--samples-per-block N] [--samples N]"
    );
    println!("  weir-cli inspect <path> --channels <count> [--json]");
}

fn flag_value<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(value) = args.next() else {
        bail!("{flag} requires a value");
    };
    value
        .parse()
        .with_context(|| format!("invalid {flag} value: {value}"))
}

/// Deterministic triangle wave with a per-channel period and offset, clamped
/// to the sample range.
fn synth(channel: u16, pos: u64) -> i16 {
    let period = 400 + u64::from(channel) * 56;
    let half = (period / 2).max(1);
    let phase = pos % period;
    let rise = if phase < half { phase } else { period - phase };
    let value = (rise as i64 * 4000) / half as i64 - 2000 + i64::from(channel) * 25;
    value.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
}

fn record(path: &Path, channels: u16, samples_per_block: u32, samples: u64) -> Result<()> {
    let geometry = Geometry::new(channels, samples_per_block).with_context(|| {
        format!("invalid geometry: {channels} channels x {samples_per_block} samples per block")
    })?;
    let file: BlockFile<i16> = BlockFile::new(geometry);
    file.open(path)
        .with_context(|| format!("failed to create recording file: {}", path.display()))?;

    // Channels advance in different chunk sizes, so the window holds several
    // blocks in flight the way skewed acquisition sources do.
    let mut next = vec![0_u64; usize::from(channels)];
    while next.iter().any(|&pos| pos < samples) {
        for channel in 0..channels {
            let pos = next[usize::from(channel)];
            if pos >= samples {
                continue;
            }
            let len = (61 + u64::from(channel) * 13).min(samples - pos);
            let run: Vec<i16> = (0..len).map(|i| synth(channel, pos + i)).collect();
            file.write_channel(ChannelId(channel), SamplePos(pos), &run)
                .with_context(|| format!("write failed on channel {channel}"))?;
            next[usize::from(channel)] = pos + len;
        }
    }
    file.close()
        .with_context(|| format!("failed to flush recording: {}", path.display()))?;

    let stats = file.stats();
    println!("recorded {}", path.display());
    println!("channels: {channels}");
    println!("samples_per_channel: {samples}");
    println!("blocks_flushed: {}", stats.blocks_flushed);
    println!("bytes_flushed: {}", stats.bytes_flushed);
    Ok(())
}

fn inspect(path: &Path, channels: u16, json: bool) -> Result<()> {
    if channels == 0 {
        bail!("--channels must be nonzero");
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let samples: Vec<i16> = decode_samples_le(&bytes)
        .with_context(|| format!("{} is not a whole number of samples", path.display()))?;

    let width = usize::from(channels);
    if !samples.len().is_multiple_of(width) {
        bail!(
            "{} holds {} samples, not a whole number of {channels}-channel rows",
            path.display(),
            samples.len()
        );
    }
    let rows = samples.len() / width;

    let mut channel_stats = Vec::with_capacity(width);
    for channel in 0..width {
        let mut min = i16::MAX;
        let mut max = i16::MIN;
        let mut sum = 0_i64;
        for row in 0..rows {
            let value = samples[row * width + channel];
            min = min.min(value);
            max = max.max(value);
            sum += i64::from(value);
        }
        if rows == 0 {
            min = 0;
            max = 0;
        }
        channel_stats.push(ChannelStats {
            channel: channel as u16,
            min,
            max,
            mean: if rows == 0 {
                0.0
            } else {
                sum as f64 / rows as f64
            },
        });
    }

    let output = InspectOutput {
        path: path.display().to_string(),
        bytes: bytes.len() as u64,
        channels,
        rows: rows as u64,
        channel_stats,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("Weir Inspector");
        println!("path: {}", output.path);
        println!("bytes: {}", output.bytes);
        println!("channels: {}", output.channels);
        println!("rows: {}", output.rows);
        for stats in &output.channel_stats {
            println!(
                "channel {}: min={} max={} mean={:.2}",
                stats.channel, stats.min, stats.max, stats.mean
            );
        }
    }

    Ok(())
}
