//! Composite custom-noise items
//!
//! Each item wraps one or more nested [`NoiseChain`]s. [`RepeatedNoise`] is
//! the only stateful item: it caches outputs for the lifetime of the run that
//! owns it.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use super::pyramid::resize_bilinear;
use super::{NoiseChain, NoiseParams, standardize_items};
use crate::error::{Result, SonarError};
use crate::guidance::GuidanceKind;

fn non_empty(chain: &NoiseChain, what: &str) -> Result<()> {
    if chain.is_empty() {
        return Err(SonarError::Configuration(format!("{what} has no noise items")));
    }
    Ok(())
}

/// When cached noise is reshuffled before reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermuteMode {
    /// Only recycled entries
    #[default]
    Enabled,
    Disabled,
    /// Fresh entries as well
    Always,
}

impl PermuteMode {
    pub fn name(&self) -> &'static str {
        match self {
            PermuteMode::Enabled => "enabled",
            PermuteMode::Disabled => "disabled",
            PermuteMode::Always => "always",
        }
    }
}

impl fmt::Display for PermuteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PermuteMode {
    type Err = SonarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" => Ok(PermuteMode::Enabled),
            "disabled" => Ok(PermuteMode::Disabled),
            "always" => Ok(PermuteMode::Always),
            _ => Err(SonarError::Configuration(format!("unknown permute mode: {s}"))),
        }
    }
}

/// Random horizontal/vertical flips and a channel roll, shared by all batch items
fn permute(values: &[f32], shape: [usize; 4], rng: &mut StdRng) -> Vec<f32> {
    let [batch, channels, height, width] = shape;
    let flip_h = rng.gen_bool(0.5);
    let flip_v = rng.gen_bool(0.5);
    let roll = rng.gen_range(0..channels);

    let mut out = vec![0.0f32; values.len()];
    for b in 0..batch {
        for c in 0..channels {
            let src_c = (c + roll) % channels;
            for y in 0..height {
                let sy = if flip_v { height - 1 - y } else { y };
                for x in 0..width {
                    let sx = if flip_h { width - 1 - x } else { x };
                    out[((b * channels + c) * height + y) * width + x] =
                        values[((b * channels + src_c) * height + sy) * width + sx];
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
struct CachedNoise {
    values: Vec<f32>,
    uses: usize,
}

/// Reuses up to `repeat_length` outputs of a nested chain
///
/// Until the cache is full every call stores fresh noise. After that a random
/// entry is reused, optionally permuted, and replaced by fresh noise once it
/// has been used `max_recycle` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatedNoise {
    inner: NoiseChain,
    repeat_length: usize,
    max_recycle: usize,
    permute: PermuteMode,
    shape: Option<[usize; 4]>,
    cache: Vec<CachedNoise>,
}

impl RepeatedNoise {
    pub fn new(
        inner: NoiseChain,
        repeat_length: usize,
        max_recycle: usize,
        permute: PermuteMode,
    ) -> Result<Self> {
        non_empty(&inner, "repeated noise")?;
        if repeat_length == 0 || max_recycle == 0 {
            return Err(SonarError::Configuration(format!(
                "repeat_length and max_recycle must be at least 1, got {repeat_length} and {max_recycle}"
            )));
        }
        Ok(Self {
            inner,
            repeat_length,
            max_recycle,
            permute,
            shape: None,
            cache: Vec::new(),
        })
    }

    pub fn inner(&self) -> &NoiseChain {
        &self.inner
    }

    /// Number of cached entries
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        if self.shape != Some(shape) {
            self.cache.clear();
            self.shape = Some(shape);
        }
        let mut rng = StdRng::seed_from_u64(seed);

        let slot = if self.cache.len() < self.repeat_length {
            None
        } else {
            Some(rng.gen_range(0..self.cache.len()))
        };

        let reused = match slot {
            Some(idx) if self.cache[idx].uses < self.max_recycle => {
                let entry = &mut self.cache[idx];
                entry.uses += 1;
                Some(entry.values.clone())
            }
            _ => None,
        };

        match reused {
            Some(values) if self.permute == PermuteMode::Disabled => Ok(values),
            Some(values) => Ok(permute(&values, shape, &mut rng)),
            None => {
                let values = self.inner.generate_values(shape, rng.next_u64(), params)?;
                let entry = CachedNoise {
                    values: values.clone(),
                    uses: 1,
                };
                match slot {
                    Some(idx) => self.cache[idx] = entry,
                    None => self.cache.push(entry),
                }
                if self.permute == PermuteMode::Always {
                    Ok(permute(&values, shape, &mut rng))
                } else {
                    Ok(values)
                }
            }
        }
    }
}

/// Nested noise active inside a sigma window, fallback noise outside it
///
/// The window is inclusive: `end_sigma <= sigma <= start_sigma`. Without a
/// fallback, steps outside the window get zero noise. When no sigma is bound
/// the window counts as active.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledNoise {
    inner: NoiseChain,
    fallback: Option<NoiseChain>,
    start_sigma: f32,
    end_sigma: f32,
}

impl ScheduledNoise {
    pub fn new(
        inner: NoiseChain,
        start_sigma: f32,
        end_sigma: f32,
        fallback: Option<NoiseChain>,
    ) -> Result<Self> {
        non_empty(&inner, "scheduled noise")?;
        if let Some(fallback) = &fallback {
            non_empty(fallback, "scheduled noise fallback")?;
        }
        if !(start_sigma.is_finite() && end_sigma.is_finite() && end_sigma <= start_sigma) {
            return Err(SonarError::Configuration(format!(
                "scheduled noise window {start_sigma}..{end_sigma} must be finite and decreasing"
            )));
        }
        Ok(Self {
            inner,
            fallback,
            start_sigma,
            end_sigma,
        })
    }

    pub fn is_active(&self, sigma: Option<f32>) -> bool {
        sigma.is_none_or(|s| self.end_sigma <= s && s <= self.start_sigma)
    }

    pub(crate) fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        if self.is_active(params.sigma) {
            return self.inner.generate_values(shape, seed, params);
        }
        match &mut self.fallback {
            Some(fallback) => fallback.generate_values(shape, seed, params),
            None => Ok(vec![0.0; shape.iter().product()]),
        }
    }
}

/// Sums `mix_count` randomly chosen items of a nested chain per call
#[derive(Debug, Clone, PartialEq)]
pub struct RandomNoise {
    items: NoiseChain,
    mix_count: usize,
}

impl RandomNoise {
    pub fn new(items: NoiseChain, mix_count: usize) -> Result<Self> {
        non_empty(&items, "random noise")?;
        if mix_count == 0 {
            return Err(SonarError::Configuration(
                "mix_count must be at least 1".to_string(),
            ));
        }
        Ok(Self { items, mix_count })
    }

    pub fn items(&self) -> &NoiseChain {
        &self.items
    }

    pub(crate) fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = self.items.len();
        let chosen = rand::seq::index::sample(&mut rng, n, self.mix_count.min(n));

        let mut out = vec![0.0f32; shape.iter().product()];
        for index in chosen.iter() {
            let values = self.items.items_mut()[index].contribution(shape, rng.next_u64(), params)?;
            for (acc, v) in out.iter_mut().zip(&values) {
                *acc += v;
            }
        }
        Ok(out)
    }
}

/// Blend weights in [0, 1] over the spatial plane
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseMask {
    height: usize,
    width: usize,
    values: Vec<f32>,
}

impl NoiseMask {
    /// Values are clamped to [0, 1]
    pub fn new(height: usize, width: usize, values: Vec<f32>) -> Result<Self> {
        if height == 0 || width == 0 || values.len() != height * width {
            return Err(SonarError::ShapeMismatch(format!(
                "{} mask values for a {height}x{width} mask",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SonarError::Configuration("mask values must be finite".to_string()));
        }
        let values = values.into_iter().map(|v| v.clamp(0.0, 1.0)).collect();
        Ok(Self {
            height,
            width,
            values,
        })
    }

    /// Mask resized to `height x width`
    fn resized(&self, height: usize, width: usize) -> Vec<f32> {
        if (height, width) == (self.height, self.width) {
            self.values.clone()
        } else {
            resize_bilinear(&self.values, self.height, self.width, height, width)
        }
    }
}

/// `dst * (1 - mask) + src * mask`, the mask resized to the latent plane
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeNoise {
    dst: NoiseChain,
    src: NoiseChain,
    mask: NoiseMask,
}

impl CompositeNoise {
    pub fn new(dst: NoiseChain, src: NoiseChain, mask: NoiseMask) -> Result<Self> {
        non_empty(&dst, "composite noise dst")?;
        non_empty(&src, "composite noise src")?;
        Ok(Self { dst, src, mask })
    }

    pub(crate) fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        let [_, _, height, width] = shape;
        let mut rng = StdRng::seed_from_u64(seed);
        let dst = self.dst.generate_values(shape, rng.next_u64(), params)?;
        let src = self.src.generate_values(shape, rng.next_u64(), params)?;
        let mask = self.mask.resized(height, width);

        let plane = height * width;
        Ok(dst
            .iter()
            .zip(&src)
            .enumerate()
            .map(|(i, (d, s))| {
                let m = mask[i % plane];
                d * (1.0 - m) + s * m
            })
            .collect())
    }
}

/// Nested noise pulled toward a reference latent
///
/// Linear moves the noise `guidance_factor` of the way to the reference.
/// Euler scales that by `(sigma - sigma_next) / sigma` when a step is bound.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidedNoise {
    inner: NoiseChain,
    reference: Vec<f32>,
    reference_shape: [usize; 4],
    method: GuidanceKind,
    guidance_factor: f32,
}

impl GuidedNoise {
    pub fn new(
        inner: NoiseChain,
        reference: Vec<f32>,
        reference_shape: [usize; 4],
        method: GuidanceKind,
        guidance_factor: f32,
        normalize_ref: bool,
    ) -> Result<Self> {
        non_empty(&inner, "guided noise")?;
        if reference.len() != reference_shape.iter().product::<usize>() {
            return Err(SonarError::ShapeMismatch(format!(
                "{} reference values for shape {:?}",
                reference.len(),
                reference_shape
            )));
        }
        if !guidance_factor.is_finite() {
            return Err(SonarError::Configuration(format!(
                "guidance_factor must be finite, got {guidance_factor}"
            )));
        }
        let mut reference = reference;
        if normalize_ref {
            standardize_items(&mut reference, reference_shape);
        }
        Ok(Self {
            inner,
            reference,
            reference_shape,
            method,
            guidance_factor,
        })
    }

    /// Guided noise toward a latent tensor
    pub fn from_tensor<B: Backend>(
        inner: NoiseChain,
        reference: Tensor<B, 4>,
        method: GuidanceKind,
        guidance_factor: f32,
        normalize_ref: bool,
    ) -> Result<Self> {
        let shape = reference.dims();
        let values = reference
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| SonarError::TensorData(format!("{e:?}")))?;
        Self::new(inner, values, shape, method, guidance_factor, normalize_ref)
    }

    pub fn inner(&self) -> &NoiseChain {
        &self.inner
    }

    fn strength(&self, params: &NoiseParams) -> f32 {
        match (self.method, params.sigma, params.sigma_next) {
            (GuidanceKind::Euler, Some(sigma), Some(sigma_next)) if sigma > 0.0 => {
                self.guidance_factor * (sigma - sigma_next) / sigma
            }
            _ => self.guidance_factor,
        }
    }

    pub(crate) fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        if shape != self.reference_shape {
            return Err(SonarError::ShapeMismatch(format!(
                "guidance reference {:?} vs noise {:?}",
                self.reference_shape, shape
            )));
        }
        let strength = self.strength(params);
        let noise = self.inner.generate_values(shape, seed, params)?;
        Ok(noise
            .iter()
            .zip(&self.reference)
            .map(|(n, r)| n + (r - n) * strength)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::NoiseType;

    fn gaussian_chain() -> NoiseChain {
        NoiseChain::new().add(NoiseType::Gaussian, 1.0)
    }

    fn sorted(values: &[f32]) -> Vec<f32> {
        let mut values = values.to_vec();
        values.sort_by(|a, b| a.total_cmp(b));
        values
    }

    #[test]
    fn test_permute_mode_parse() {
        assert_eq!("ALWAYS".parse::<PermuteMode>().unwrap(), PermuteMode::Always);
        assert!("sometimes".parse::<PermuteMode>().is_err());
    }

    #[test]
    fn test_permute_keeps_values() {
        let values: Vec<f32> = (0..2 * 3 * 4 * 5).map(|v| v as f32).collect();
        let mut rng = StdRng::seed_from_u64(4);
        let out = permute(&values, [2, 3, 4, 5], &mut rng);
        assert_eq!(sorted(&out), values);
    }

    #[test]
    fn test_repeated_fills_cache_then_reuses() {
        let params = NoiseParams::default();
        let shape = [1, 1, 4, 4];
        let mut repeated = RepeatedNoise::new(gaussian_chain(), 2, 1000, PermuteMode::Disabled).unwrap();

        let a = repeated.generate_values(shape, 1, &params).unwrap();
        let b = repeated.generate_values(shape, 2, &params).unwrap();
        assert_ne!(a, b);
        assert_eq!(repeated.cached(), 2);

        for seed in 3..10 {
            let c = repeated.generate_values(shape, seed, &params).unwrap();
            assert!(c == a || c == b);
        }
        assert_eq!(repeated.cached(), 2);
    }

    #[test]
    fn test_repeated_permutes_recycled_noise() {
        let params = NoiseParams::default();
        let shape = [1, 2, 4, 4];
        let mut repeated = RepeatedNoise::new(gaussian_chain(), 1, 1000, PermuteMode::Enabled).unwrap();

        let first = repeated.generate_values(shape, 1, &params).unwrap();
        let again = repeated.generate_values(shape, 2, &params).unwrap();
        assert_eq!(sorted(&first), sorted(&again));
    }

    #[test]
    fn test_repeated_replaces_exhausted_entries() {
        let params = NoiseParams::default();
        let shape = [1, 1, 4, 4];
        let mut repeated = RepeatedNoise::new(gaussian_chain(), 1, 1, PermuteMode::Disabled).unwrap();

        let first = repeated.generate_values(shape, 1, &params).unwrap();
        let second = repeated.generate_values(shape, 2, &params).unwrap();
        assert_ne!(first, second);
        assert_eq!(repeated.cached(), 1);
    }

    #[test]
    fn test_repeated_rejects_zero_length() {
        assert!(RepeatedNoise::new(gaussian_chain(), 0, 1, PermuteMode::Enabled).is_err());
    }

    #[test]
    fn test_scheduled_window_and_fallback() {
        let shape = [1, 1, 4, 4];
        let fallback = NoiseChain::new().add(NoiseType::Uniform, 1.0);
        let mut scheduled = ScheduledNoise::new(gaussian_chain(), 10.0, 5.0, Some(fallback.clone())).unwrap();
        let mut bare = ScheduledNoise::new(gaussian_chain(), 10.0, 5.0, None).unwrap();

        let inside = NoiseParams::default().with_sigmas(7.2, 3.1);
        let outside = NoiseParams::default().with_sigmas(14.6, 7.2);

        assert_eq!(
            scheduled.generate_values(shape, 3, &inside).unwrap(),
            gaussian_chain().generate_values(shape, 3, &inside).unwrap()
        );
        assert_eq!(
            scheduled.generate_values(shape, 3, &outside).unwrap(),
            fallback.clone().generate_values(shape, 3, &outside).unwrap()
        );
        assert!(bare.generate_values(shape, 3, &outside).unwrap().iter().all(|v| *v == 0.0));
        assert!(scheduled.is_active(Some(10.0)) && scheduled.is_active(Some(5.0)));
    }

    #[test]
    fn test_scheduled_rejects_increasing_window() {
        assert!(ScheduledNoise::new(gaussian_chain(), 1.0, 5.0, None).is_err());
    }

    #[test]
    fn test_random_selects_mix_count_items() {
        let params = NoiseParams::default();
        let shape = [1, 1, 4, 4];
        let items = NoiseChain::new()
            .add(NoiseType::Gaussian, 1.0)
            .add(NoiseType::Uniform, 1.0)
            .add(NoiseType::Pink, 1.0);

        let mut single = RandomNoise::new(items.clone(), 1).unwrap();
        let out = single.generate_values(shape, 8, &params).unwrap();
        // A single standardized item
        let mean_sq = out.iter().map(|v| v * v).sum::<f32>() / out.len() as f32;
        assert!((mean_sq - 1.0).abs() < 1e-3);

        let mut again = RandomNoise::new(items, 1).unwrap();
        assert_eq!(again.generate_values(shape, 8, &params).unwrap(), out);
        assert!(RandomNoise::new(gaussian_chain(), 0).is_err());
    }

    #[test]
    fn test_composite_follows_mask() {
        let params = NoiseParams::default();
        let shape = [1, 1, 4, 4];
        let dst = NoiseChain::new().add(NoiseType::Gaussian, 1.0);
        let src = NoiseChain::new().add(NoiseType::Uniform, 1.0);

        let all_src = NoiseMask::new(1, 1, vec![1.0]).unwrap();
        let mut composite = CompositeNoise::new(dst.clone(), src.clone(), all_src).unwrap();
        let out = composite.generate_values(shape, 5, &params).unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        rng.next_u64();
        let expected = src.clone().generate_values(shape, rng.next_u64(), &params).unwrap();
        for (o, e) in out.iter().zip(&expected) {
            assert!((o - e).abs() < 1e-6);
        }

        let half = NoiseMask::new(2, 2, vec![0.0, 0.0, 2.0, 2.0]).unwrap();
        let mut composite = CompositeNoise::new(dst, src, half).unwrap();
        assert_eq!(composite.generate_values(shape, 5, &params).unwrap().len(), 16);
        assert!(NoiseMask::new(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_guided_linear_pulls_toward_reference() {
        let shape = [1, 1, 2, 2];
        let params = NoiseParams::default();
        let reference = vec![3.0; 4];
        let mut guided =
            GuidedNoise::new(gaussian_chain(), reference, shape, GuidanceKind::Linear, 1.0, false).unwrap();
        let out = guided.generate_values(shape, 2, &params).unwrap();
        assert!(out.iter().all(|v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_guided_euler_scales_with_step() {
        let shape = [1, 1, 2, 2];
        let params = NoiseParams::default().with_sigmas(10.0, 5.0);
        let reference = vec![2.0; 4];
        let mut guided =
            GuidedNoise::new(gaussian_chain(), reference, shape, GuidanceKind::Euler, 1.0, false).unwrap();
        let noise = gaussian_chain().generate_values(shape, 2, &params).unwrap();
        let out = guided.generate_values(shape, 2, &params).unwrap();
        for (o, n) in out.iter().zip(&noise) {
            assert!((o - (n + (2.0 - n) * 0.5)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_guided_shape_mismatch() {
        let mut guided =
            GuidedNoise::new(gaussian_chain(), vec![0.0; 4], [1, 1, 2, 2], GuidanceKind::Linear, 0.5, false)
                .unwrap();
        let err = guided
            .generate_values([1, 1, 4, 4], 0, &NoiseParams::default())
            .unwrap_err();
        assert!(matches!(err, SonarError::ShapeMismatch(_)));
    }
}
