//! 1/f (pink) noise via spectral shaping

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use super::{standardize, white};

struct Plane2d {
    height: usize,
    width: usize,
    row_fwd: Arc<dyn Fft<f32>>,
    row_inv: Arc<dyn Fft<f32>>,
    col_fwd: Arc<dyn Fft<f32>>,
    col_inv: Arc<dyn Fft<f32>>,
}

impl Plane2d {
    fn new(height: usize, width: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            height,
            width,
            row_fwd: planner.plan_fft_forward(width),
            row_inv: planner.plan_fft_inverse(width),
            col_fwd: planner.plan_fft_forward(height),
            col_inv: planner.plan_fft_inverse(height),
        }
    }

    fn transform(&self, buf: &mut [Complex32], inverse: bool) {
        let (row_fft, col_fft) = if inverse {
            (&self.row_inv, &self.col_inv)
        } else {
            (&self.row_fwd, &self.col_fwd)
        };

        for row in buf.chunks_mut(self.width) {
            row_fft.process(row);
        }

        let mut column = vec![Complex32::new(0.0, 0.0); self.height];
        for col in 0..self.width {
            for (row, slot) in column.iter_mut().enumerate() {
                *slot = buf[row * self.width + col];
            }
            col_fft.process(&mut column);
            for (row, value) in column.iter().enumerate() {
                buf[row * self.width + col] = *value;
            }
        }
    }
}

/// Signed frequency of FFT bin `k` out of `n`, in cycles per sample
fn bin_frequency(k: usize, n: usize) -> f32 {
    let k = if k <= n / 2 {
        k as f32
    } else {
        k as f32 - n as f32
    };
    k / n as f32
}

/// White noise filtered to a 1/f power spectrum per plane
///
/// The amplitude filter is `|f|^-1/2` with the DC bin removed. A 1x1 plane has
/// no non-DC content and keeps its white sample.
pub(crate) fn pink(shape: [usize; 4], seed: u64) -> Vec<f32> {
    let [batch, channels, height, width] = shape;
    let plane_len = height * width;
    let mut values = white::gaussian(batch * channels * plane_len, seed);

    if plane_len == 1 {
        return values;
    }

    let plane = Plane2d::new(height, width);
    let filter: Vec<f32> = (0..plane_len)
        .map(|i| {
            let fy = bin_frequency(i / width, height);
            let fx = bin_frequency(i % width, width);
            let f = (fx * fx + fy * fy).sqrt();
            if f == 0.0 { 0.0 } else { 1.0 / f.sqrt() }
        })
        .collect();

    for chunk in values.chunks_mut(plane_len) {
        let mut buf: Vec<Complex32> = chunk.iter().map(|&v| Complex32::new(v, 0.0)).collect();
        plane.transform(&mut buf, false);
        for (bin, gain) in buf.iter_mut().zip(&filter) {
            *bin *= *gain;
        }
        plane.transform(&mut buf, true);

        for (out, bin) in chunk.iter_mut().zip(&buf) {
            *out = bin.re;
        }
        standardize(chunk);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mean spectral power per bin within a frequency band
    fn band_power(plane: &[f32], height: usize, width: usize, low: bool) -> f32 {
        let fft = Plane2d::new(height, width);
        let mut buf: Vec<Complex32> = plane.iter().map(|&v| Complex32::new(v, 0.0)).collect();
        fft.transform(&mut buf, false);
        let powers: Vec<f32> = buf
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let fy = bin_frequency(i / width, height);
                let fx = bin_frequency(i % width, width);
                let f = (fx * fx + fy * fy).sqrt();
                f > 0.0 && if low { f < 0.125 } else { f > 0.375 }
            })
            .map(|(_, c)| c.norm_sqr())
            .collect();
        powers.iter().sum::<f32>() / powers.len() as f32
    }

    #[test]
    fn test_pink_favours_low_frequencies() {
        let noise = pink([1, 1, 32, 32], 21);
        let low = band_power(&noise, 32, 32, true);
        let high = band_power(&noise, 32, 32, false);
        assert!(low > 2.0 * high);
    }

    #[test]
    fn test_pink_is_real_and_standardized() {
        let noise = pink([1, 1, 8, 12], 2);
        let mean = noise.iter().sum::<f32>() / noise.len() as f32;
        assert!(mean.abs() < 1e-4);
        assert!(noise.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_single_pixel_plane_keeps_white_sample() {
        assert_eq!(pink([2, 3, 1, 1], 6), white::gaussian(6, 6));
    }
}
