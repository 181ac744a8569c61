//! Noise generators for Sonar sampling
//!
//! Every generator is a pure function of `(shape, seed, params)` that fills a
//! flat `[batch, channel, height, width]` buffer on the CPU. The tensor-facing
//! entry point [`generate`] draws the seed from the run's RNG, so a seeded run
//! produces bit-identical noise on every backend.
//!
//! Spatially correlated variants (Perlin, pink, highres pyramid) operate per
//! `(batch, channel)` plane and standardize each plane to zero mean and unit
//! variance. Brownian noise is the increment of one Brownian path over the
//! bound sigma step, divided by the square root of the step length.

mod brownian;
mod chain;
mod custom;
mod perlin;
mod pink;
mod pyramid;
mod white;

pub use chain::{NoiseChain, NoiseItem, NoiseItemKind};
pub use custom::{
    CompositeNoise, GuidedNoise, NoiseMask, PermuteMode, RandomNoise, RepeatedNoise,
    ScheduledNoise,
};

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use rand::RngCore;
use rand::rngs::StdRng;

use crate::error::{Result, SonarError};
use brownian::BrownianPath;

/// Upper bound on Perlin octaves; the lattice doubles per octave
pub const MAX_PERLIN_OCTAVES: usize = 8;

/// Upper bound on downsampled pyramid levels
pub const MAX_PYRAMID_LEVELS: u32 = 16;

/// Noise generation algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NoiseType {
    /// Independent standard-normal samples
    #[default]
    Gaussian,
    /// Independent uniform samples, zero-centered with unit variance
    Uniform,
    /// Increment of a seeded Brownian path over the current sigma step
    Brownian,
    /// Multi-octave lattice-gradient noise
    Perlin,
    /// Heavy-tailed Student-t samples
    StudentT,
    /// Student-t samples clamped at the 75th percentile and halved
    StudentTTest,
    /// White noise shaped to a 1/f power spectrum
    Pink,
    /// Gaussian pyramid built at twice the latent resolution
    HighresPyramid,
}

impl NoiseType {
    /// All variants, in selector order
    pub const ALL: [NoiseType; 8] = [
        NoiseType::Gaussian,
        NoiseType::Uniform,
        NoiseType::Brownian,
        NoiseType::Perlin,
        NoiseType::StudentT,
        NoiseType::StudentTTest,
        NoiseType::Pink,
        NoiseType::HighresPyramid,
    ];

    /// Selector name as used by the host parameter surface
    pub fn name(&self) -> &'static str {
        match self {
            NoiseType::Gaussian => "gaussian",
            NoiseType::Uniform => "uniform",
            NoiseType::Brownian => "brownian",
            NoiseType::Perlin => "perlin",
            NoiseType::StudentT => "studentt",
            NoiseType::StudentTTest => "studentt_test",
            NoiseType::Pink => "pink",
            NoiseType::HighresPyramid => "highres_pyramid",
        }
    }

    /// Whether the generator needs the current sigma step
    pub fn is_sigma_dependent(&self) -> bool {
        matches!(self, NoiseType::Brownian)
    }
}

impl fmt::Display for NoiseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NoiseType {
    type Err = SonarError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        NoiseType::ALL
            .into_iter()
            .find(|t| t.name() == normalized)
            .ok_or_else(|| SonarError::UnsupportedNoiseType(s.to_string()))
    }
}

/// Tuning parameters for the noise generators
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseParams {
    /// Current sigma
    pub sigma: Option<f32>,
    /// Next sigma
    pub sigma_next: Option<f32>,
    /// Seed of the Brownian path shared by every step of a run
    ///
    /// Without one, each call draws an independent path from its own seed.
    pub path_seed: Option<u64>,
    /// Number of Perlin octaves
    pub perlin_octaves: usize,
    /// Amplitude falloff between Perlin octaves
    pub perlin_persistence: f32,
    /// Degrees of freedom for the Student-t variants
    pub studentt_df: f32,
    /// Weight falloff between pyramid levels
    pub pyramid_discount: f32,
    /// Number of downsampled pyramid levels
    pub pyramid_levels: u32,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            sigma: None,
            sigma_next: None,
            path_seed: None,
            perlin_octaves: 4,
            perlin_persistence: 0.5,
            studentt_df: 4.0,
            pyramid_discount: 0.7,
            pyramid_levels: 4,
        }
    }
}

impl NoiseParams {
    /// Returns a copy bound to the given sigma step
    pub fn with_sigmas(mut self, sigma: f32, sigma_next: f32) -> Self {
        self.sigma = Some(sigma);
        self.sigma_next = Some(sigma_next);
        self
    }

    /// Returns a copy that samples Brownian noise from one fixed path
    pub fn with_path_seed(mut self, seed: u64) -> Self {
        self.path_seed = Some(seed);
        self
    }

    /// Checks the tuning values before any generator runs
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PERLIN_OCTAVES).contains(&self.perlin_octaves) {
            return Err(SonarError::Configuration(format!(
                "perlin_octaves must be in 1..={MAX_PERLIN_OCTAVES}, got {}",
                self.perlin_octaves
            )));
        }
        if self.pyramid_levels > MAX_PYRAMID_LEVELS {
            return Err(SonarError::Configuration(format!(
                "pyramid_levels must be at most {MAX_PYRAMID_LEVELS}, got {}",
                self.pyramid_levels
            )));
        }
        for (name, value) in [
            ("perlin_persistence", self.perlin_persistence),
            ("pyramid_discount", self.pyramid_discount),
        ] {
            if !value.is_finite() {
                return Err(SonarError::Configuration(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        if !(self.studentt_df.is_finite() && self.studentt_df > 0.0) {
            return Err(SonarError::Configuration(format!(
                "studentt_df must be positive, got {}",
                self.studentt_df
            )));
        }
        if self.sigma.into_iter().chain(self.sigma_next).any(|s| !s.is_finite()) {
            return Err(SonarError::Configuration(
                "bound sigmas must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a sampler's fresh noise comes from
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseSource {
    /// A single generator
    Single(NoiseType),
    /// A weighted mix of generators
    Chain(NoiseChain),
}

impl Default for NoiseSource {
    fn default() -> Self {
        NoiseSource::Single(NoiseType::Gaussian)
    }
}

impl NoiseSource {
    /// Fills a flat buffer for `shape` from `seed`
    ///
    /// Stateful chain items advance, so a source is owned by one run.
    pub fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        match self {
            NoiseSource::Single(noise_type) => generate_values(shape, *noise_type, seed, params),
            NoiseSource::Chain(chain) => chain.generate_values(shape, seed, params),
        }
    }

    /// Generates a noise tensor, drawing the seed from `rng`
    pub fn generate<B: Backend>(
        &mut self,
        shape: [usize; 4],
        rng: &mut StdRng,
        params: &NoiseParams,
        device: &B::Device,
    ) -> Result<Tensor<B, 4>> {
        validate_shape(shape)?;
        let values = self.generate_values(shape, rng.next_u64(), params)?;
        into_tensor(values, shape, device)
    }
}

/// Rejects shapes with a zero dimension
pub fn validate_shape(shape: [usize; 4]) -> Result<()> {
    if shape.contains(&0) {
        return Err(SonarError::ShapeMismatch(format!(
            "non-positive dimension in {:?}",
            shape
        )));
    }
    Ok(())
}

/// Generates a flat noise buffer for one algorithm
///
/// Deterministic in `(shape, noise_type, seed, params)`.
pub fn generate_values(
    shape: [usize; 4],
    noise_type: NoiseType,
    seed: u64,
    params: &NoiseParams,
) -> Result<Vec<f32>> {
    validate_shape(shape)?;
    params.validate()?;
    let len = shape.iter().product();

    let values = match noise_type {
        NoiseType::Gaussian => white::gaussian(len, seed),
        NoiseType::Uniform => white::uniform(len, seed),
        NoiseType::Brownian => {
            let path = BrownianPath::new(len, params.path_seed.unwrap_or(seed));
            match (params.sigma, params.sigma_next) {
                (Some(sigma), Some(sigma_next)) => path.step_noise(sigma, sigma_next),
                _ => path.increment(0.0, 1.0),
            }
        }
        NoiseType::Perlin => {
            perlin::perlin(shape, seed, params.perlin_octaves, params.perlin_persistence)
        }
        NoiseType::StudentT => white::studentt(len, seed, params.studentt_df)?,
        NoiseType::StudentTTest => white::studentt_test(shape, seed, params.studentt_df)?,
        NoiseType::Pink => pink::pink(shape, seed),
        NoiseType::HighresPyramid => {
            pyramid::highres_pyramid(shape, seed, params.pyramid_discount, params.pyramid_levels)
        }
    };

    if values.len() != len {
        return Err(SonarError::ShapeMismatch(format!(
            "{} generator produced {} values for shape {:?}",
            noise_type,
            values.len(),
            shape
        )));
    }
    Ok(values)
}

/// Generates a noise tensor of `shape`, drawing the seed from `rng`
pub fn generate<B: Backend>(
    shape: [usize; 4],
    noise_type: NoiseType,
    rng: &mut StdRng,
    params: &NoiseParams,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    NoiseSource::Single(noise_type).generate(shape, rng, params, device)
}

/// Generates a noise tensor from a selector name
///
/// The selector is resolved before any RNG draw or tensor work.
pub fn generate_named<B: Backend>(
    shape: [usize; 4],
    selector: &str,
    rng: &mut StdRng,
    params: &NoiseParams,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let noise_type = selector.parse::<NoiseType>()?;
    generate(shape, noise_type, rng, params, device)
}

/// Scales noise by `factor`, optionally normalizing it first
///
/// Normalization brings each batch item to zero mean and unit std on its own.
/// Items with zero or undefined spread are only scaled.
pub fn scale_noise<B: Backend>(noise: Tensor<B, 4>, factor: f32, normalized: bool) -> Tensor<B, 4> {
    if !normalized {
        return if factor == 1.0 { noise } else { noise * factor };
    }

    let [batch, channels, height, width] = noise.dims();
    let flat = noise.reshape([batch, channels * height * width]);
    let mean = flat.clone().mean_dim(1);
    let std = flat.clone().var(1).sqrt();
    let std = std.clone().mask_fill(std.is_nan(), 0.0);

    let degenerate = std.clone().lower_equal_elem(1e-12);
    let mean = mean.mask_fill(degenerate.clone(), 0.0);
    let std = std.mask_fill(degenerate, 1.0);

    ((flat - mean) / std * factor).reshape([batch, channels, height, width])
}

/// Generates noise shaped like `latent`
///
/// The noise is normalized, multiplied by `multiplier` and, when
/// `add_to_latent` is set, added onto the reference latent. `sigmas` binds
/// sigma-dependent generators to a step. `source` is cloned, so stateful
/// items start fresh.
pub fn noisy_latent_like<B: Backend>(
    latent: &Tensor<B, 4>,
    source: &NoiseSource,
    seed: u64,
    multiplier: f32,
    add_to_latent: bool,
    sigmas: Option<(f32, f32)>,
) -> Result<Tensor<B, 4>> {
    let shape = latent.dims();
    validate_shape(shape)?;

    let mut params = NoiseParams::default();
    if let Some((sigma, sigma_next)) = sigmas {
        params = params.with_sigmas(sigma, sigma_next);
    }

    let mut source = source.clone();
    let values = source.generate_values(shape, seed, &params)?;
    let noise = into_tensor::<B>(values, shape, &latent.device())?;
    let noise = scale_noise(noise, multiplier, true);

    Ok(if add_to_latent {
        noise + latent.clone()
    } else {
        noise
    })
}

fn into_tensor<B: Backend>(
    values: Vec<f32>,
    shape: [usize; 4],
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(SonarError::ShapeMismatch(format!(
            "{} values for shape {:?}",
            values.len(),
            shape
        )));
    }
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

/// Shifts and scales a buffer to zero mean and unit population std
pub(crate) fn standardize(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let std = var.sqrt();

    if std > 1e-12 {
        for v in values.iter_mut() {
            *v = ((*v as f64 - mean) / std) as f32;
        }
    }
}

/// [`standardize`] applied to each batch item of a `shape` buffer
pub(crate) fn standardize_items(values: &mut [f32], shape: [usize; 4]) {
    let per_item = shape[1] * shape[2] * shape[3];
    if per_item == 0 {
        return;
    }
    for item in values.chunks_mut(per_item) {
        standardize(item);
    }
}

/// Mean absolute value of a buffer
pub fn mean_abs(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| v.abs() as f64).sum::<f64>() as f32 / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type TestBackend = NdArray;

    #[test]
    fn test_selector_round_trip() {
        for noise_type in NoiseType::ALL {
            assert_eq!(noise_type.name().parse::<NoiseType>().unwrap(), noise_type);
        }
        assert_eq!(
            "HIGHRES_PYRAMID".parse::<NoiseType>().unwrap(),
            NoiseType::HighresPyramid
        );
    }

    #[test]
    fn test_unknown_selector() {
        let err = "foo".parse::<NoiseType>().unwrap_err();
        assert!(matches!(err, SonarError::UnsupportedNoiseType(ref s) if s == "foo"));
    }

    #[test]
    fn test_shape_preserved_for_all_types() {
        let params = NoiseParams::default().with_sigmas(14.6, 7.2);
        for shape in [[1, 1, 4, 4], [2, 4, 8, 6], [1, 3, 1, 1], [1, 2, 5, 9]] {
            for noise_type in NoiseType::ALL {
                let values = generate_values(shape, noise_type, 7, &params).unwrap();
                assert_eq!(
                    values.len(),
                    shape.iter().product::<usize>(),
                    "{noise_type} {shape:?}"
                );
                assert!(values.iter().all(|v| v.is_finite()), "{noise_type} {shape:?}");
            }
        }
    }

    #[test]
    fn test_tensor_shape_matches_request() {
        let device = <TestBackend as Backend>::Device::default();
        let mut rng = StdRng::seed_from_u64(1);
        for noise_type in NoiseType::ALL {
            let noise: Tensor<TestBackend, 4> = generate(
                [2, 4, 8, 8],
                noise_type,
                &mut rng,
                &NoiseParams::default(),
                &device,
            )
            .unwrap();
            assert_eq!(noise.dims(), [2, 4, 8, 8]);
        }
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let err = generate_values([1, 4, 0, 8], NoiseType::Gaussian, 0, &NoiseParams::default())
            .unwrap_err();
        assert!(matches!(err, SonarError::ShapeMismatch(_)));
    }

    #[test]
    fn test_named_selector_fails_before_rng_draw() {
        let device = <TestBackend as Backend>::Device::default();
        let mut rng = StdRng::seed_from_u64(3);
        let mut untouched = StdRng::seed_from_u64(3);

        let result: Result<Tensor<TestBackend, 4>> = generate_named(
            [1, 1, 4, 4],
            "foo",
            &mut rng,
            &NoiseParams::default(),
            &device,
        );
        assert!(matches!(result, Err(SonarError::UnsupportedNoiseType(_))));
        assert_eq!(rng.next_u64(), untouched.next_u64());
    }

    #[test]
    fn test_deterministic_per_seed() {
        let params = NoiseParams::default();
        for noise_type in NoiseType::ALL {
            let a = generate_values([1, 4, 8, 8], noise_type, 42, &params).unwrap();
            let b = generate_values([1, 4, 8, 8], noise_type, 42, &params).unwrap();
            let c = generate_values([1, 4, 8, 8], noise_type, 43, &params).unwrap();
            assert_eq!(a, b, "{noise_type}");
            assert_ne!(a, c, "{noise_type}");
        }
    }

    #[test]
    fn test_studentt_test_smaller_than_studentt() {
        let params = NoiseParams::default();
        for seed in [0, 1, 99, 12345] {
            let heavy = generate_values([1, 4, 16, 16], NoiseType::StudentT, seed, &params).unwrap();
            let light =
                generate_values([1, 4, 16, 16], NoiseType::StudentTTest, seed, &params).unwrap();
            assert!(mean_abs(&light) < mean_abs(&heavy), "seed {seed}");
        }
    }

    #[test]
    fn test_scale_noise_normalizes() {
        let device = <TestBackend as Backend>::Device::default();
        let values: Vec<f32> = (0..16).map(|i| i as f32 * 3.0 + 10.0).collect();
        let noise: Tensor<TestBackend, 4> =
            Tensor::from_data(TensorData::new(values, [1, 1, 4, 4]), &device);

        let scaled = scale_noise(noise, 2.0, true);
        let flat = scaled.flatten::<1>(0, 3);
        let mean: f32 = flat.clone().mean().into_scalar().elem();
        let std: f32 = flat.var(0).sqrt().into_scalar().elem();
        assert!(mean.abs() < 1e-4);
        assert!((std - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_scale_noise_constant_input_is_not_nan() {
        let device = <TestBackend as Backend>::Device::default();
        let noise: Tensor<TestBackend, 4> = Tensor::full([1, 1, 2, 2], 0.5, &device);
        let scaled = scale_noise(noise, 1.0, true);
        let data: Vec<f32> = scaled.into_data().to_vec().unwrap();
        assert!(data.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn test_scale_noise_per_batch_item() {
        let device = <TestBackend as Backend>::Device::default();
        let params = NoiseParams::default();
        let single = generate_values([1, 1, 4, 4], NoiseType::Gaussian, 5, &params).unwrap();
        let batched = generate_values([2, 1, 4, 4], NoiseType::Gaussian, 5, &params).unwrap();
        assert_eq!(single[..], batched[..16]);

        let single: Tensor<TestBackend, 4> =
            Tensor::from_data(TensorData::new(single, [1, 1, 4, 4]), &device);
        let mut shifted = batched.clone();
        for v in shifted[16..].iter_mut() {
            *v = *v * 10.0 + 3.0;
        }
        let batched: Tensor<TestBackend, 4> =
            Tensor::from_data(TensorData::new(shifted, [2, 1, 4, 4]), &device);

        let single: Vec<f32> = scale_noise(single, 1.0, true).into_data().to_vec().unwrap();
        let batched: Vec<f32> = scale_noise(batched, 1.0, true).into_data().to_vec().unwrap();
        for (a, b) in single.iter().zip(&batched[..16]) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_brownian_differs_from_gaussian_after_normalization() {
        let device = <TestBackend as Backend>::Device::default();
        let params = NoiseParams::default().with_sigmas(14.6, 7.2);
        let shape = [1, 1, 4, 4];

        let normalized = |noise_type| -> Vec<f32> {
            let values = generate_values(shape, noise_type, 5, &params).unwrap();
            let noise: Tensor<TestBackend, 4> = Tensor::from_data(TensorData::new(values, shape), &device);
            scale_noise(noise, 1.0, true).into_data().to_vec().unwrap()
        };
        let brownian = normalized(NoiseType::Brownian);
        let gaussian = normalized(NoiseType::Gaussian);
        let max_diff = brownian
            .iter()
            .zip(&gaussian)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff > 0.1, "{max_diff}");
    }

    #[test]
    fn test_brownian_steps_share_one_path() {
        let shape = [1, 1, 8, 8];
        let base = NoiseParams::default().with_path_seed(77);
        let first = generate_values(shape, NoiseType::Brownian, 1, &base.with_sigmas(14.6, 7.2)).unwrap();
        let second = generate_values(shape, NoiseType::Brownian, 2, &base.with_sigmas(7.2, 3.1)).unwrap();
        let whole = generate_values(shape, NoiseType::Brownian, 3, &base.with_sigmas(14.6, 3.1)).unwrap();
        // Unit-variance step noise: undo the sqrt(dt) division before adding
        let (a_scale, b_scale, w_scale) = (7.4f32.sqrt(), 4.1f32.sqrt(), 11.5f32.sqrt());
        for ((a, b), w) in first.iter().zip(&second).zip(&whole) {
            assert!((a * a_scale + b * b_scale - w * w_scale).abs() < 1e-3);
        }
    }

    #[test]
    fn test_noise_params_validated() {
        let shape = [1, 1, 4, 4];
        for params in [
            NoiseParams { perlin_octaves: 0, ..NoiseParams::default() },
            NoiseParams { perlin_octaves: 70, ..NoiseParams::default() },
            NoiseParams { pyramid_levels: 64, ..NoiseParams::default() },
            NoiseParams { perlin_persistence: f32::NAN, ..NoiseParams::default() },
            NoiseParams { studentt_df: 0.0, ..NoiseParams::default() },
        ] {
            let err = generate_values(shape, NoiseType::Perlin, 0, &params).unwrap_err();
            assert!(matches!(err, SonarError::Configuration(_)), "{params:?}");
        }
        let params = NoiseParams { perlin_octaves: MAX_PERLIN_OCTAVES, ..NoiseParams::default() };
        assert!(generate_values(shape, NoiseType::Perlin, 0, &params).is_ok());
    }

    #[test]
    fn test_noisy_latent_like_adds_latent() {
        let device = <TestBackend as Backend>::Device::default();
        let latent: Tensor<TestBackend, 4> = Tensor::full([1, 4, 8, 8], 0.25, &device);
        let source = NoiseSource::default();

        let noise = noisy_latent_like(&latent, &source, 5, 1.0, false, None).unwrap();
        let noisy = noisy_latent_like(&latent, &source, 5, 1.0, true, None).unwrap();

        let diff: Vec<f32> = (noisy - noise - latent).into_data().to_vec().unwrap();
        assert!(diff.iter().all(|v| v.abs() < 1e-6));
    }
}
