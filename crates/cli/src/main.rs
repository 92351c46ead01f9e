use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use streamer::media::h264::nal_units;
use streamer::{Block, Clock, Codec, EsDescriptor, RtspConfig, Streamer, StreamerConfig, SystemClock};
use tracing_subscriber::EnvFilter;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Parser)]
#[command(
    name = "rtp-streamer",
    about = "Stream an H.264 Annex B file over RTP, with RTSP access"
)]
struct Args {
    /// H.264 Annex B elementary stream
    input: PathBuf,

    /// TOML file with a streamer configuration; flags override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// RTSP bind address (host:port)
    #[arg(long, short)]
    bind: Option<String>,

    /// RTSP mount path
    #[arg(long)]
    path: Option<String>,

    /// Disable RTSP access
    #[arg(long)]
    no_rtsp: bool,

    /// Static unicast or multicast destination
    #[arg(long, short)]
    destination: Option<IpAddr>,

    /// Base RTP port of the static destination
    #[arg(long, short)]
    port: Option<u16>,

    #[arg(long)]
    ttl: Option<u32>,

    #[arg(long)]
    mtu: Option<usize>,

    /// Release delay in milliseconds
    #[arg(long)]
    caching: Option<u64>,

    /// Frames per second
    #[arg(long, default_value_t = 25.0)]
    fps: f64,

    /// Write the SDP to this file
    #[arg(long)]
    sdp_file: Option<PathBuf>,

    /// Restart from the beginning at end of file
    #[arg(long = "loop")]
    looping: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.fps.is_nan() || args.fps <= 0.0 {
        bail!("--fps must be positive");
    }
    let config = load_config(&args)?;

    let data = fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let units = access_units(&data);
    if units.is_empty() {
        bail!("{} contains no H.264 access units", args.input.display());
    }
    let es = EsDescriptor::video(Codec::H264).with_extradata(parameter_sets(&data));

    let clock = Arc::new(SystemClock::new());
    let streamer = Arc::new(Streamer::with_clock(config, clock.clone()).context("starting output")?);
    let id = streamer.add_stream(&es).context("adding H.264 stream")?;

    let running = Arc::new(AtomicBool::new(true));
    let feeder = {
        let streamer = streamer.clone();
        let running = running.clone();
        let frame = (1_000_000.0 / args.fps) as i64;
        let looping = args.looping;
        thread::Builder::new().name("feeder".to_string()).spawn(move || {
            let mut dts = clock.now();
            'outer: loop {
                for unit in &units {
                    if !running.load(Ordering::SeqCst) {
                        break 'outer;
                    }
                    let ahead = dts - clock.now();
                    if ahead > 0 {
                        thread::sleep(Duration::from_micros(ahead as u64));
                    }
                    let block = Block::new(unit.clone(), dts).with_duration(frame);
                    if let Err(e) = streamer.send(id, &block) {
                        tracing::error!(error = %e, "send failed");
                        break 'outer;
                    }
                    dts += frame;
                }
                if !looping {
                    break;
                }
            }
            tracing::info!("input finished");
        })?
    };

    match streamer.rtsp_addr() {
        Some(addr) => {
            let path = streamer.config().rtsp.as_ref().map_or("", |r| r.path.as_str());
            println!("Streaming rtsp://{}{}; press Enter to stop", addr, path);
        }
        None => println!("Streaming; press Enter to stop"),
    }
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    running.store(false, Ordering::SeqCst);
    let _ = feeder.join();
    streamer.close();
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<StreamerConfig> {
    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => StreamerConfig {
            rtsp: Some(RtspConfig::default()),
            ..Default::default()
        },
    };

    if args.no_rtsp {
        config.rtsp = None;
    } else if args.bind.is_some() || args.path.is_some() {
        let rtsp = config.rtsp.get_or_insert_with(RtspConfig::default);
        if let Some(bind) = &args.bind {
            rtsp.bind = bind.clone();
        }
        if let Some(path) = &args.path {
            rtsp.path = path.clone();
        }
    }
    if let Some(destination) = args.destination {
        config.destination = Some(destination);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ttl) = args.ttl {
        config.ttl = Some(ttl);
    }
    if let Some(mtu) = args.mtu {
        config.mtu = mtu;
    }
    if let Some(caching) = args.caching {
        config.caching_ms = caching;
    }
    if let Some(sdp_file) = &args.sdp_file {
        config.sdp_file = Some(sdp_file.clone());
    }
    Ok(config)
}

fn read_config(path: &Path) -> anyhow::Result<StreamerConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Group NAL units into access units: a new unit starts at an access unit
/// delimiter, at a parameter set or SEI following a slice, or at a slice
/// whose `first_mb_in_slice` is 0 once the current unit has one.
fn access_units(data: &[u8]) -> Vec<Vec<u8>> {
    let mut units = Vec::new();
    let mut current = Vec::new();
    let mut has_slice = false;

    for nal in nal_units(data) {
        let nal_type = nal[0] & 0x1f;
        let is_slice = matches!(nal_type, 1 | 5);
        let starts_unit = match nal_type {
            9 => true,
            6..=8 => has_slice,
            1 | 5 => has_slice && nal.get(1).is_some_and(|b| b & 0x80 != 0),
            _ => false,
        };
        if starts_unit && !current.is_empty() {
            units.push(std::mem::take(&mut current));
            has_slice = false;
        }
        current.extend_from_slice(&START_CODE);
        current.extend_from_slice(nal);
        has_slice |= is_slice;
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

/// First SPS and PPS, for `sprop-parameter-sets`.
fn parameter_sets(data: &[u8]) -> Vec<u8> {
    let mut extradata = Vec::new();
    for wanted in [7, 8] {
        if let Some(nal) = nal_units(data).into_iter().find(|nal| nal[0] & 0x1f == wanted) {
            extradata.extend_from_slice(&START_CODE);
            extradata.extend_from_slice(nal);
        }
    }
    extradata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_access_units() {
        let stream = [
            &[0, 0, 0, 1, 0x67, 0x42][..],
            &[0, 0, 0, 1, 0x68, 0xce],
            &[0, 0, 1, 0x65, 0x88, 0x01],
            &[0, 0, 1, 0x41, 0x9a, 0x02],
            &[0, 0, 1, 0x41, 0x00, 0x03],
            &[0, 0, 1, 0x41, 0x9a, 0x04],
        ]
        .concat();
        let units = access_units(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], [&START_CODE[..], &[0x67, 0x42], &START_CODE, &[0x68, 0xce], &START_CODE, &[0x65, 0x88, 0x01]].concat());
        // Second slice of the same picture stays in its unit.
        assert_eq!(units[1], [&START_CODE[..], &[0x41, 0x9a, 0x02], &START_CODE, &[0x41, 0x00, 0x03]].concat());

        assert_eq!(parameter_sets(&stream), [&START_CODE[..], &[0x67, 0x42], &START_CODE, &[0x68, 0xce]].concat());
    }
}
