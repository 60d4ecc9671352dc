//! Content fingerprinting over spectral frames
//!
//! Derives a 32-hex-char digest from a waveform's spectrum rather than
//! its raw bytes, so the hash survives container-level churn (tag
//! rewrites) but changes whenever audible content changes. The digest
//! travels with the file record and is recomputed by the safe writer
//! before the original file is ever replaced.

use crate::types::{Fingerprint, Waveform};
use rustfft::{num_complex::Complex, FftPlanner};
use sha2::{Digest, Sha256};

/// Analysis window in samples
const FRAME_SIZE: usize = 4096;
/// Hop between windows
const FRAME_HOP: usize = 2048;

/// Audio fingerprinter
pub struct Fingerprinter {
    frame_size: usize,
    frame_hop: usize,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            frame_size: FRAME_SIZE,
            frame_hop: FRAME_HOP,
        }
    }

    /// Fingerprint a decoded waveform.
    pub fn fingerprint(&self, waveform: &Waveform) -> Fingerprint {
        self.fingerprint_samples(&waveform.samples)
    }

    /// Fingerprint raw mono samples.
    ///
    /// Input shorter than one window is zero-padded so even degenerate
    /// clips produce a stable digest.
    pub fn fingerprint_samples(&self, samples: &[f32]) -> Fingerprint {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.frame_size);

        let mut hasher = Sha256::new();
        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); self.frame_size];
        let mut quantized = vec![0u8; self.frame_size / 2];

        let mut offset = 0usize;
        let mut frames = 0usize;
        loop {
            let end = offset + self.frame_size;
            if offset > 0 && end > samples.len() {
                break;
            }

            for (i, slot) in buffer.iter_mut().enumerate() {
                let sample = samples.get(offset + i).copied().unwrap_or(0.0);
                // Hann window keeps the digest insensitive to frame
                // boundary phase.
                let w = hann(i, self.frame_size);
                *slot = Complex::new(sample * w, 0.0);
            }

            fft.process(&mut buffer);

            // Quantize log-magnitudes of the positive-frequency half
            for (i, q) in quantized.iter_mut().enumerate() {
                let mag = buffer[i].norm();
                *q = quantize(mag);
            }
            hasher.update(&quantized);

            frames += 1;
            offset += self.frame_hop;
            if offset >= samples.len() {
                break;
            }
        }

        tracing::debug!(frames, samples = samples.len(), "Fingerprint computed");

        let digest = hasher.finalize();
        Fingerprint::from_digest_hex(&format!("{:x}", digest))
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn hann(i: usize, n: usize) -> f32 {
    let x = (std::f32::consts::PI * i as f32 / n as f32).sin();
    x * x
}

/// Coarse log quantization: robust to float noise, sensitive to real
/// spectral change.
#[inline]
fn quantize(mag: f32) -> u8 {
    ((mag + 1.0).ln() * 16.0).min(255.0) as u8
}
