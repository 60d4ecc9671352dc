//! sonotag-decoder — isolated decode worker
//!
//! Usage: `sonotag-decoder <audio-file> <target-sample-rate>`
//!
//! Decodes one audio file to mono f32 at the requested rate and writes
//! a single length-prefixed frame to stdout: a `u32` little-endian
//! sample count followed by the raw f32-le samples. Any failure exits
//! nonzero with the reason on stderr; the parent treats abnormal exit
//! and short frames identically as a failed attempt.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

use sonotag_engine::utils::audio_decoder::decode_mono_resampled;

fn main() -> ExitCode {
    // Worker logs go to stderr; stdout carries only the sample frame.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("decode worker failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let mut args = std::env::args_os().skip(1);
    let path: PathBuf = args
        .next()
        .map(PathBuf::from)
        .context("missing argument: audio file path")?;
    let target_sr: u32 = args
        .next()
        .and_then(|s| s.to_str().map(str::to_owned))
        .context("missing argument: target sample rate")?
        .parse()
        .context("target sample rate is not a number")?;

    if target_sr == 0 {
        bail!("target sample rate must be nonzero");
    }

    let samples = decode_mono_resampled(&path, target_sr)?;

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());

    let count = u32::try_from(samples.len()).context("sample count exceeds frame limit")?;
    out.write_all(&count.to_le_bytes())?;
    for sample in &samples {
        out.write_all(&sample.to_le_bytes())?;
    }
    out.flush()?;

    Ok(())
}
