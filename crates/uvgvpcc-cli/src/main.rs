//! uvgvpcc - command line front-end for the uvgVPCCenc library.
//!
//! Point-cloud ingestion (a PLY reader) is deliberately out of scope for the
//! core library, so this front-end always drives the pipeline with the
//! `DummyRun` collaborators, generating synthetic frames for the requested
//! count/start index. This still exercises the full scheduler, atlas/VPS
//! construction and muxer end to end.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use uvgvpcc_core::{ColoredPoint, Encoder, Frame, Point3, Rgb};

/// uvgVPCCenc - Video-based Point Cloud Compression encoder.
#[derive(Parser, Debug)]
#[command(name = "uvgvpcc")]
#[command(about = "Encode a sequence of point clouds into a V3C bitstream", long_about = None)]
#[command(version)]
struct Cli {
    /// Input path, printf-style (may embed e.g. `%04d`).
    #[arg(short, long)]
    input: String,

    /// Output bitstream file; required unless `--dst-address` is set.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of frames to encode; auto-detected from the input pattern if omitted.
    #[arg(short = 'n', long)]
    frames: Option<usize>,

    /// First frame index; auto-detected from the input pattern if omitted.
    #[arg(short = 's', long, default_value_t = 0)]
    start_frame: usize,

    /// Voxel bit depth; auto-detected from a `voxNN` token in the input path if omitted.
    #[arg(short = 'g', long)]
    geo_precision: Option<u32>,

    /// Worker thread count; 0 resolves to hardware concurrency.
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// Loop the input sequence this many times.
    #[arg(short = 'l', long, default_value_t = 1)]
    loop_input: usize,

    /// Run with synthetic frames instead of a real point-cloud reader.
    #[arg(short = 'd', long, default_value_t = 1)]
    dummy_run: u8,

    /// Library parameter overrides, e.g. `"mode=AI,sizeGOF=8"`.
    #[arg(long)]
    uvgvpcc: Option<String>,

    /// RTP sink address; when set, `--output` is not required.
    #[arg(long)]
    dst_address: Option<String>,

    /// RTP sink ports, comma-separated.
    #[arg(long)]
    dst_port: Option<String>,

    /// SDP output directory for the RTP sink.
    #[arg(long)]
    sdp_outdir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// `vox12` in `input` yields `Some(12)`.
fn geo_precision_from_pattern(input: &str) -> Option<u32> {
    let idx = input.find("vox")?;
    let digits: String = input[idx + 3..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// The `_`-delimited all-digit segments in `prefix`, in order.
fn digit_segments(prefix: &str) -> Vec<usize> {
    prefix.split('_').filter_map(|s| s.parse().ok()).collect()
}

/// The last `_`-delimited digit run before `%`, i.e. frame count in
/// `..._0_300_%04d...`.
fn frame_count_from_pattern(input: &str) -> Option<usize> {
    let percent = input.find('%')?;
    digit_segments(&input[..percent]).last().copied()
}

/// The second-to-last `_`-delimited digit run before `%`, i.e. start frame
/// in `..._0_300_%04d...`.
fn start_frame_from_pattern(input: &str) -> Option<usize> {
    let percent = input.find('%')?;
    let segments = digit_segments(&input[..percent]);
    segments.len().checked_sub(2).map(|i| segments[i])
}

/// A synthetic colored cube, standing in for a real PLY-read frame.
fn synthetic_frame(id: usize, geo_bit_depth_input: u32) -> Frame {
    let mut frame = Frame::new(id, geo_bit_depth_input);
    let limit = 1u32 << geo_bit_depth_input.min(10);
    let step = (limit / 16).max(1);
    let mut x = 0;
    while x < limit {
        let mut y = 0;
        while y < limit {
            frame.points.push(ColoredPoint {
                position: Point3 { x, y, z: (x + y) % limit },
                color: Rgb {
                    r: (x % 256) as u8,
                    g: (y % 256) as u8,
                    b: ((x + y) % 256) as u8,
                },
            });
            y += step;
        }
        x += step;
    }
    frame
}

fn apply_overrides(encoder: &Encoder, overrides: &str) -> Result<()> {
    for pair in overrides.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("malformed --uvgvpcc override '{pair}', expected k=v"))?;
        encoder
            .set_parameter(key.trim(), value.trim())
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    if cli.output.is_none() && cli.dst_address.is_none() {
        bail!("--output is required unless --dst-address is set");
    }
    if cli.dummy_run == 0 {
        tracing::warn!(
            target: "APPLICATION",
            "real point-cloud ingestion is out of scope; running with synthetic frames regardless"
        );
    }

    let frame_count = cli
        .frames
        .or_else(|| frame_count_from_pattern(&cli.input))
        .unwrap_or(1);
    let start_frame = if cli.start_frame != 0 {
        cli.start_frame
    } else {
        start_frame_from_pattern(&cli.input).unwrap_or(0)
    };
    let geo_precision = cli
        .geo_precision
        .or_else(|| geo_precision_from_pattern(&cli.input))
        .context("geo-precision could not be determined; pass -g explicitly")?;

    let encoder = Encoder::new_dummy_run();
    encoder.set_parameter("geoBitDepthInput", &geo_precision.to_string())?;
    encoder.set_parameter("nbThreadPCPart", &cli.threads.to_string())?;
    if let Some(overrides) = &cli.uvgvpcc {
        apply_overrides(&encoder, overrides)?;
    }
    encoder.initialize_encoder()?;

    let output_queue = encoder.output_queue();
    let output_path = cli.output.clone();
    let writer = std::thread::spawn(move || -> Result<usize> {
        let mut total_bytes = 0;
        let mut file = match &output_path {
            Some(path) => Some(std::fs::File::create(path).context("opening output file")?),
            None => None,
        };
        while let Some(chunk) = output_queue.pop_until_closed() {
            total_bytes += chunk.chunk.data.len();
            if let Some(f) = file.as_mut() {
                use std::io::Write;
                f.write_all(&chunk.chunk.data)?;
            }
        }
        Ok(total_bytes)
    });

    for iteration in 0..cli.loop_input.max(1) {
        for i in 0..frame_count {
            let frame_id = iteration * frame_count + i;
            let source_index = start_frame + i;
            let _ = source_index; // would index the real PLY sequence
            encoder.encode_frame(synthetic_frame(frame_id, geo_precision))?;
        }
    }
    encoder.empty_frame_queue()?;
    drop(encoder);

    match writer.join() {
        Ok(Ok(bytes)) => {
            tracing::info!(target: "APPLICATION", bytes, "encoding complete");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => bail!("output writer thread panicked"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level.parse().unwrap_or(tracing::Level::WARN))
        .init();

    if let Err(e) = run(cli) {
        tracing::error!(target: "APPLICATION", fatal = true, error = %e, "uvgvpcc failed");
        std::process::exit(1);
    }
    Ok(())
}
