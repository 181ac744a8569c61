//! Multi-octave gradient (Perlin) noise

use std::f32::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::standardize;

/// Lattice cells per side at the first octave
const BASE_CELLS: usize = 2;

/// Random unit gradients on a `(rows + 1) x (cols + 1)` lattice
struct GradientLattice {
    cols: usize,
    gradients: Vec<(f32, f32)>,
}

impl GradientLattice {
    fn random(rows: usize, cols: usize, rng: &mut StdRng) -> Self {
        let gradients = (0..(rows + 1) * (cols + 1))
            .map(|_| {
                let angle = rng.gen_range(0.0..TAU);
                (angle.cos(), angle.sin())
            })
            .collect();
        Self { cols, gradients }
    }

    fn gradient(&self, row: usize, col: usize) -> (f32, f32) {
        self.gradients[row * (self.cols + 1) + col]
    }

    /// Samples the lattice at `(y, x)` in cell units
    fn sample(&self, y: f32, x: f32) -> f32 {
        let row = y.floor() as usize;
        let col = x.floor() as usize;
        let ty = y - row as f32;
        let tx = x - col as f32;

        let corner = |dr: usize, dc: usize| {
            let (gx, gy) = self.gradient(row + dr, col + dc);
            gx * (tx - dc as f32) + gy * (ty - dr as f32)
        };

        let top = lerp(corner(0, 0), corner(0, 1), fade(tx));
        let bottom = lerp(corner(1, 0), corner(1, 1), fade(tx));
        lerp(top, bottom, fade(ty))
    }
}

fn fade(t: f32) -> f32 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Sums `octaves` gradient-noise layers per plane, halving the cell size each octave
pub(crate) fn perlin(shape: [usize; 4], seed: u64, octaves: usize, persistence: f32) -> Vec<f32> {
    let [batch, channels, height, width] = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(batch * channels * height * width);

    for _ in 0..batch * channels {
        let mut plane = vec![0.0f32; height * width];
        let mut amplitude = 1.0f32;

        for octave in 0..octaves {
            let cells = BASE_CELLS << octave;
            let lattice = GradientLattice::random(cells, cells, &mut rng);

            for y in 0..height {
                // Pixel centers never land on a lattice point, where gradient noise is zero
                let fy = (y as f32 + 0.5) / height as f32 * cells as f32;
                for x in 0..width {
                    let fx = (x as f32 + 0.5) / width as f32 * cells as f32;
                    plane[y * width + x] += amplitude * lattice.sample(fy, fx);
                }
            }
            amplitude *= persistence;
        }

        standardize(&mut plane);
        out.extend(plane);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbour_correlation(plane: &[f32], width: usize) -> f32 {
        let mut num = 0.0;
        let mut count = 0;
        for (i, v) in plane.iter().enumerate() {
            if (i + 1) % width != 0 {
                num += v * plane[i + 1];
                count += 1;
            }
        }
        num / count as f32
    }

    #[test]
    fn test_perlin_is_spatially_correlated() {
        let noise = perlin([1, 1, 32, 32], 4, 3, 0.5);
        assert!(neighbour_correlation(&noise, 32) > 0.5);

        let white = crate::noise::white::gaussian(32 * 32, 4);
        assert!(neighbour_correlation(&white, 32) < 0.2);
    }

    #[test]
    fn test_perlin_planes_are_standardized() {
        let noise = perlin([1, 2, 16, 16], 8, 4, 0.5);
        for plane in noise.chunks(256) {
            let mean = plane.iter().sum::<f32>() / 256.0;
            let var = plane.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 256.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }
}
