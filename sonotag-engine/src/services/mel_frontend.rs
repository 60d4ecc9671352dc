//! Log-mel spectrogram frontend for backbone models
//!
//! Converts a mono waveform into the `[frames × n_mels]` log-mel
//! matrix the embedding extractors consume, then slices it into
//! fixed-length patches ("segments") along the time axis. FFT size,
//! hop, and mel band count follow the shipped model generation; patch
//! geometry comes from each backbone's segment spec.

use crate::models::SegmentSpec;
use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};

const N_FFT: usize = 1024;
const HOP_LENGTH: usize = 512;
const N_MELS: usize = 96;

/// Mel frontend bound to one sample rate
pub struct MelFrontend {
    sample_rate: u32,
    n_fft: usize,
    hop_length: usize,
    n_mels: usize,
    /// Triangular filterbank, `[n_mels × (n_fft/2 + 1)]`
    filterbank: Array2<f32>,
}

impl MelFrontend {
    pub fn new(sample_rate: u32) -> Self {
        let filterbank = mel_filterbank(sample_rate, N_FFT, N_MELS);
        Self {
            sample_rate,
            n_fft: N_FFT,
            hop_length: HOP_LENGTH,
            n_mels: N_MELS,
            filterbank,
        }
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Patch geometry (frames per patch, hop in frames) for a segment
    /// spec at this frontend's rate.
    pub fn patch_geometry(&self, segment: &SegmentSpec) -> (usize, usize) {
        let frames_per_second = self.sample_rate as f32 / self.hop_length as f32;
        let patch_frames = (segment.length_s * frames_per_second).round().max(1.0) as usize;
        let patch_hop = (segment.hop_s * frames_per_second).round().max(1.0) as usize;
        (patch_frames, patch_hop)
    }

    /// Compute the log-mel spectrogram, `[frames × n_mels]`.
    pub fn log_mel(&self, samples: &[f32]) -> Array2<f32> {
        let n_bins = self.n_fft / 2 + 1;
        let n_frames = if samples.len() < self.n_fft {
            0
        } else {
            (samples.len() - self.n_fft) / self.hop_length + 1
        };

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.n_fft);

        let window: Vec<f32> = (0..self.n_fft)
            .map(|i| {
                let x = (std::f32::consts::PI * i as f32 / self.n_fft as f32).sin();
                x * x
            })
            .collect();

        let mut mel = Array2::<f32>::zeros((n_frames, self.n_mels));
        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); self.n_fft];
        let mut power = vec![0.0f32; n_bins];

        for frame in 0..n_frames {
            let offset = frame * self.hop_length;
            for i in 0..self.n_fft {
                buffer[i] = Complex::new(samples[offset + i] * window[i], 0.0);
            }
            fft.process(&mut buffer);

            for (i, p) in power.iter_mut().enumerate() {
                *p = buffer[i].norm_sqr();
            }

            for m in 0..self.n_mels {
                let mut energy = 0.0f32;
                for (i, &p) in power.iter().enumerate() {
                    energy += self.filterbank[[m, i]] * p;
                }
                mel[[frame, m]] = (energy + 1e-6).log10();
            }
        }

        mel
    }

    /// Slice a mel matrix into fixed-length patches along time.
    ///
    /// The final partial patch is kept and zero-padded when at least
    /// half a patch of frames remains; shorter tails are dropped.
    pub fn patches(
        &self,
        mel: &Array2<f32>,
        patch_frames: usize,
        patch_hop: usize,
    ) -> Vec<Array2<f32>> {
        let total = mel.nrows();
        let mut patches = Vec::new();

        let mut start = 0usize;
        while start < total {
            let remaining = total - start;
            if remaining < patch_frames {
                if !patches.is_empty() && remaining * 2 >= patch_frames {
                    let mut padded = Array2::<f32>::zeros((patch_frames, self.n_mels));
                    for r in 0..remaining {
                        for c in 0..self.n_mels {
                            padded[[r, c]] = mel[[start + r, c]];
                        }
                    }
                    patches.push(padded);
                }
                break;
            }

            let mut patch = Array2::<f32>::zeros((patch_frames, self.n_mels));
            for r in 0..patch_frames {
                for c in 0..self.n_mels {
                    patch[[r, c]] = mel[[start + r, c]];
                }
            }
            patches.push(patch);
            start += patch_hop;
        }

        // A clip shorter than one patch still yields one padded patch
        if patches.is_empty() && total > 0 {
            let mut padded = Array2::<f32>::zeros((patch_frames, self.n_mels));
            for r in 0..total {
                for c in 0..self.n_mels {
                    padded[[r, c]] = mel[[r, c]];
                }
            }
            patches.push(padded);
        }

        patches
    }
}

/// Standard triangular mel filterbank over `n_fft/2 + 1` bins.
fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let f_max = sample_rate as f32 / 2.0;

    let mel_max = hz_to_mel(f_max);
    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let bin_points: Vec<f32> = mel_points
        .iter()
        .map(|&hz| hz * n_fft as f32 / sample_rate as f32)
        .collect();

    let mut filterbank = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let left = bin_points[m];
        let center = bin_points[m + 1];
        let right = bin_points[m + 2];

        for bin in 0..n_bins {
            let b = bin as f32;
            let weight = if b > left && b <= center {
                (b - left) / (center - left).max(1e-6)
            } else if b > center && b < right {
                (right - b) / (right - center).max(1e-6)
            } else {
                0.0
            };
            filterbank[[m, bin]] = weight;
        }
    }
    filterbank
}

#[inline]
fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

#[inline]
fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0f32.powf(mel / 2595.0) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, seconds: f64, sample_rate: u32) -> Vec<f32> {
        let n = (seconds * sample_rate as f64) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                (2.0 * std::f64::consts::PI * freq * t).sin() as f32
            })
            .collect()
    }

    #[test]
    fn test_log_mel_shape() {
        let frontend = MelFrontend::new(16_000);
        let samples = sine(440.0, 2.0, 16_000);
        let mel = frontend.log_mel(&samples);

        let expected_frames = (samples.len() - 1024) / 512 + 1;
        assert_eq!(mel.nrows(), expected_frames);
        assert_eq!(mel.ncols(), 96);
        assert!(mel.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_log_mel_too_short_is_empty() {
        let frontend = MelFrontend::new(16_000);
        let mel = frontend.log_mel(&vec![0.0; 100]);
        assert_eq!(mel.nrows(), 0);
    }

    #[test]
    fn test_patch_geometry_from_segment_spec() {
        let frontend = MelFrontend::new(16_000);
        let (frames, hop) = frontend.patch_geometry(&SegmentSpec {
            length_s: 4.096,
            hop_s: 2.048,
        });
        // 16000 / 512 = 31.25 frames/s
        assert_eq!(frames, 128);
        assert_eq!(hop, 64);
    }

    #[test]
    fn test_patches_cover_input() {
        let frontend = MelFrontend::new(16_000);
        let samples = sine(440.0, 10.0, 16_000);
        let mel = frontend.log_mel(&samples);
        let patches = frontend.patches(&mel, 128, 64);

        assert!(!patches.is_empty());
        for patch in &patches {
            assert_eq!(patch.nrows(), 128);
            assert_eq!(patch.ncols(), 96);
        }
    }

    #[test]
    fn test_short_clip_yields_single_padded_patch() {
        let frontend = MelFrontend::new(16_000);
        let samples = sine(440.0, 1.0, 16_000);
        let mel = frontend.log_mel(&samples);
        assert!(mel.nrows() < 128);

        let patches = frontend.patches(&mel, 128, 64);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].nrows(), 128);
    }

    #[test]
    fn test_filterbank_rows_nonzero() {
        let fb = mel_filterbank(16_000, 1024, 96);
        for m in 0..96 {
            let sum: f32 = (0..513).map(|b| fb[[m, b]]).sum();
            assert!(sum > 0.0, "mel band {} has an empty filter", m);
        }
    }
}
