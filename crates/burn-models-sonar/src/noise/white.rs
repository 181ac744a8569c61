//! Independent-sample generators

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{StandardNormal, StudentT, Uniform};

use crate::error::{Result, SonarError};

/// Quantile used to clamp the scaled-down Student-t variant
const STUDENTT_TEST_QUANTILE: f32 = 0.75;

/// Scale applied after clamping the scaled-down Student-t variant
const STUDENTT_TEST_SCALE: f32 = 0.5;

pub(crate) fn gaussian(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

/// Uniform on [-sqrt(3), sqrt(3)] so the variance matches a standard normal
pub(crate) fn uniform(len: usize, seed: u64) -> Vec<f32> {
    let bound = 3.0f32.sqrt();
    let dist = Uniform::new(-bound, bound);
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.sample(&dist)).collect()
}

pub(crate) fn studentt(len: usize, seed: u64, df: f32) -> Result<Vec<f32>> {
    if !(df.is_finite() && df > 0.0) {
        return Err(SonarError::Configuration(format!(
            "Student-t degrees of freedom must be positive, got {df}"
        )));
    }
    let dist = StudentT::new(df).map_err(|e| SonarError::Configuration(e.to_string()))?;
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..len).map(|_| rng.sample(&dist)).collect())
}

/// Student-t samples clamped per batch item at the 75th percentile of |x|, then halved
///
/// Shares the raw draw with [`studentt`] for the same seed, so every element
/// is at most half the magnitude of its Student-t counterpart.
pub(crate) fn studentt_test(shape: [usize; 4], seed: u64, df: f32) -> Result<Vec<f32>> {
    let len = shape.iter().product();
    let mut values = studentt(len, seed, df)?;
    let per_item = len / shape[0];

    for item in values.chunks_mut(per_item) {
        let limit = abs_quantile(item, STUDENTT_TEST_QUANTILE);
        for v in item.iter_mut() {
            *v = v.clamp(-limit, limit) * STUDENTT_TEST_SCALE;
        }
    }
    Ok(values)
}

fn abs_quantile(values: &[f32], q: f32) -> f32 {
    let mut sorted: Vec<f32> = values.iter().map(|v| v.abs()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f32 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::mean_abs;

    fn moments(values: &[f32]) -> (f32, f32) {
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        (mean, var)
    }

    #[test]
    fn test_uniform_variance_matches_gaussian() {
        let values = uniform(20_000, 11);
        let (mean, var) = moments(&values);
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
        let bound = 3.0f32.sqrt();
        assert!(values.iter().all(|v| *v >= -bound && *v <= bound));
    }

    #[test]
    fn test_gaussian_moments() {
        let (mean, var) = moments(&gaussian(20_000, 3));
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_studentt_rejects_bad_df() {
        assert!(matches!(
            studentt(4, 0, 0.0),
            Err(SonarError::Configuration(_))
        ));
    }

    #[test]
    fn test_studentt_test_bounded_by_studentt() {
        let shape = [2, 4, 8, 8];
        let heavy = studentt(shape.iter().product(), 5, 4.0).unwrap();
        let light = studentt_test(shape, 5, 4.0).unwrap();
        for (h, l) in heavy.iter().zip(&light) {
            assert!(l.abs() <= h.abs() * 0.5 + 1e-6);
            assert!(l.signum() == h.signum() || *l == 0.0);
        }
        assert!(mean_abs(&light) < mean_abs(&heavy));
    }
}
