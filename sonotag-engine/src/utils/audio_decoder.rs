//! Audio decoding to mono f32 PCM
//!
//! Uses symphonia for format-agnostic decoding (MP3, FLAC, AAC, WAV,
//! OGG, ...) and rubato for sinc resampling to the caller's target
//! rate. Runs inside the `sonotag-decoder` worker process, never in
//! the parent — a decoder fault on corrupt input must only take down
//! the worker.

use anyhow::{Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;

/// Decoded mono audio at the file's native rate
#[derive(Debug)]
pub struct DecodedAudio {
    /// Mono samples (f32, range [-1.0, 1.0])
    pub samples: Vec<f32>,
    /// Native sample rate in Hz
    pub sample_rate: u32,
    /// Original channel count
    pub channels: usize,
}

/// Decode a file to mono f32 at `target_sr`.
pub fn decode_mono_resampled(file_path: &Path, target_sr: u32) -> Result<Vec<f32>> {
    let decoded = decode_mono(file_path)?;
    if decoded.sample_rate == target_sr {
        return Ok(decoded.samples);
    }
    resample_mono(decoded.samples, decoded.sample_rate, target_sr)
}

/// Decode a file to mono f32 at its native rate.
///
/// Multi-channel input is averaged down to one channel.
pub fn decode_mono(file_path: &Path) -> Result<DecodedAudio> {
    tracing::debug!(path = %file_path.display(), "Decoding audio file");

    let file = std::fs::File::open(file_path)
        .with_context(|| format!("Failed to open audio file: {}", file_path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = file_path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("Failed to probe audio file: {}", file_path.display()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio track found in file")?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .context("Sample rate unknown")?;
    let channels = track.codec_params.channels.context("Channels unknown")?;
    let channel_count = channels.count();

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .with_context(|| format!("Failed to create decoder for: {}", file_path.display()))?;

    let mut all_samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                return Err(anyhow::anyhow!("Error reading packet: {}", e));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder
            .decode(&packet)
            .with_context(|| format!("Failed to decode packet in: {}", file_path.display()))?;

        mixdown_mono(&decoded, &mut all_samples);
    }

    tracing::debug!(
        path = %file_path.display(),
        total_samples = all_samples.len(),
        sample_rate = sample_rate,
        channels = channel_count,
        "Audio decoding complete"
    );

    Ok(DecodedAudio {
        samples: all_samples,
        sample_rate,
        channels: channel_count,
    })
}

/// Average all channels of a decoded buffer into `out`.
fn mixdown_mono(decoded: &AudioBufferRef, out: &mut Vec<f32>) {
    fn mix<S>(buf: &symphonia::core::audio::AudioBuffer<S>, out: &mut Vec<f32>)
    where
        S: Sample,
        f32: FromSample<S>,
    {
        let num_channels = buf.spec().channels.count();
        let num_frames = buf.frames();
        out.reserve(num_frames);

        for frame_idx in 0..num_frames {
            let mut sum = 0.0f32;
            for ch in 0..num_channels {
                sum += f32::from_sample(buf.chan(ch)[frame_idx]);
            }
            out.push(sum / num_channels as f32);
        }
    }

    match decoded {
        AudioBufferRef::U8(buf) => mix(buf, out),
        AudioBufferRef::U16(buf) => mix(buf, out),
        AudioBufferRef::U24(buf) => mix(buf, out),
        AudioBufferRef::U32(buf) => mix(buf, out),
        AudioBufferRef::S8(buf) => mix(buf, out),
        AudioBufferRef::S16(buf) => mix(buf, out),
        AudioBufferRef::S24(buf) => mix(buf, out),
        AudioBufferRef::S32(buf) => mix(buf, out),
        AudioBufferRef::F32(buf) => mix(buf, out),
        AudioBufferRef::F64(buf) => mix(buf, out),
    }
}

/// Resample mono PCM with rubato's sinc resampler.
///
/// 256-tap filter, 0.95 cutoff, BlackmanHarris2 window — single-pass
/// with chunk size equal to the input length.
pub fn resample_mono(samples: Vec<f32>, source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if samples.is_empty() || source_rate == target_rate {
        return Ok(samples);
    }

    let num_frames = samples.len();

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let resample_ratio = target_rate as f64 / source_rate as f64;

    let mut resampler = SincFixedIn::<f32>::new(
        resample_ratio,
        2.0,
        params,
        num_frames,
        1, // mono
    )
    .context("Failed to create rubato resampler")?;

    let input_channels = vec![samples];
    let mut output_channels = resampler
        .process(&input_channels, None)
        .context("Rubato resampling failed")?;

    let output = output_channels.remove(0);

    tracing::debug!(
        input_frames = num_frames,
        output_frames = output.len(),
        source_rate,
        target_rate,
        "Resampled mono audio"
    );

    Ok(output)
}
