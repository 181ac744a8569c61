//! Sonar sampler configuration
//!
//! [`SonarParams`] mirrors the host parameter surface (string selectors,
//! optional fields). [`SonarConfig`] is the validated, immutable record the
//! sampler reads from. Conversion happens once, up front, and fails before
//! any tensor is touched.
//!
//! Two decay knobs are easy to conflate:
//! - `momentum` is the momentum buffer's own EMA decay per step
//!   (`buffer' = momentum * buffer + (1 - momentum) * sample`).
//! - `momentum_hist` weights the buffer against the fresh sample when the
//!   guidance mixer builds the current step's perturbation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SonarError};
use crate::guidance::GuidanceKind;
use crate::mixer::HistoryMix;
use crate::noise::{
    CompositeNoise, GuidedNoise, NoiseChain, NoiseItemKind, NoiseMask, NoiseParams, NoiseSource,
    NoiseType, RandomNoise, RepeatedNoise, ScheduledNoise,
};

/// Initial contents of the momentum buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitType {
    /// All zeros
    #[default]
    Zero,
    /// A fresh sample from the random-init noise type
    Random,
    /// A configured scalar
    Constant,
    /// The starting latent of the run
    Sample,
}

impl InitType {
    pub fn name(&self) -> &'static str {
        match self {
            InitType::Zero => "zero",
            InitType::Random => "random",
            InitType::Constant => "constant",
            InitType::Sample => "sample",
        }
    }
}

impl fmt::Display for InitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InitType {
    type Err = SonarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(InitType::Zero),
            "random" | "rand" => Ok(InitType::Random),
            "constant" => Ok(InitType::Constant),
            "sample" => Ok(InitType::Sample),
            _ => Err(SonarError::Configuration(format!("unknown init_type: {s}"))),
        }
    }
}

/// One entry of a custom noise chain as supplied by the host
///
/// Tagged by `kind`; nested entries build nested chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseItemParams {
    /// A built-in generator
    Noise {
        noise_type: String,
        #[serde(default = "one")]
        factor: f32,
    },
    /// Caches and reuses outputs of `items`
    Repeated {
        items: Vec<NoiseItemParams>,
        #[serde(default = "one")]
        factor: f32,
        #[serde(default = "default_repeat_length")]
        repeat_length: usize,
        #[serde(default = "default_max_recycle")]
        max_recycle: usize,
        /// enabled, disabled or always
        #[serde(default = "default_permute")]
        permute: String,
    },
    /// `items` inside the sigma window, `fallback` (or nothing) outside
    Scheduled {
        items: Vec<NoiseItemParams>,
        #[serde(default)]
        fallback: Vec<NoiseItemParams>,
        start_sigma: f32,
        end_sigma: f32,
        #[serde(default = "one")]
        factor: f32,
    },
    /// `mix_count` randomly chosen entries of `items` per step
    Random {
        items: Vec<NoiseItemParams>,
        #[serde(default = "default_mix_count")]
        mix_count: usize,
        #[serde(default = "one")]
        factor: f32,
    },
    /// `dst` blended into `src` by a spatial mask
    Composite {
        dst: Vec<NoiseItemParams>,
        src: Vec<NoiseItemParams>,
        mask: MaskParams,
        #[serde(default = "one")]
        factor: f32,
    },
    /// `items` pulled toward a reference latent
    Guided {
        items: Vec<NoiseItemParams>,
        reference: ReferenceParams,
        /// linear or euler
        #[serde(default = "default_guidance_method")]
        method: String,
        #[serde(default = "default_guidance_factor")]
        guidance_factor: f32,
        #[serde(default = "yes")]
        normalize_ref: bool,
        #[serde(default = "one")]
        factor: f32,
    },
}

/// Row-major mask weights for composite noise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskParams {
    pub height: usize,
    pub width: usize,
    pub values: Vec<f32>,
}

/// Flat `[batch, channel, height, width]` reference latent for guided noise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParams {
    pub shape: [usize; 4],
    pub values: Vec<f32>,
}

fn one() -> f32 {
    1.0
}

fn default_mix_count() -> usize {
    1
}

fn yes() -> bool {
    true
}

fn default_repeat_length() -> usize {
    8
}

fn default_max_recycle() -> usize {
    1000
}

fn default_permute() -> String {
    "enabled".to_string()
}

fn default_guidance_method() -> String {
    GuidanceKind::Euler.name().to_string()
}

fn default_guidance_factor() -> f32 {
    0.0125
}

impl NoiseItemParams {
    /// A plain generator entry
    pub fn noise(noise_type: impl Into<String>, factor: f32) -> Self {
        NoiseItemParams::Noise {
            noise_type: noise_type.into(),
            factor,
        }
    }

    pub fn factor(&self) -> f32 {
        match self {
            NoiseItemParams::Noise { factor, .. }
            | NoiseItemParams::Repeated { factor, .. }
            | NoiseItemParams::Scheduled { factor, .. }
            | NoiseItemParams::Random { factor, .. }
            | NoiseItemParams::Composite { factor, .. }
            | NoiseItemParams::Guided { factor, .. } => *factor,
        }
    }

    fn build(&self) -> Result<NoiseItemKind> {
        Ok(match self {
            NoiseItemParams::Noise { noise_type, .. } => NoiseItemKind::Generator(noise_type.parse()?),
            NoiseItemParams::Repeated {
                items,
                repeat_length,
                max_recycle,
                permute,
                ..
            } => NoiseItemKind::Repeated(RepeatedNoise::new(
                build_chain(items, "repeated noise")?,
                *repeat_length,
                *max_recycle,
                permute.parse()?,
            )?),
            NoiseItemParams::Scheduled {
                items,
                fallback,
                start_sigma,
                end_sigma,
                ..
            } => {
                let fallback = if fallback.is_empty() {
                    None
                } else {
                    Some(build_chain(fallback, "scheduled noise fallback")?)
                };
                NoiseItemKind::Scheduled(ScheduledNoise::new(
                    build_chain(items, "scheduled noise")?,
                    *start_sigma,
                    *end_sigma,
                    fallback,
                )?)
            }
            NoiseItemParams::Random {
                items, mix_count, ..
            } => NoiseItemKind::Random(RandomNoise::new(
                build_chain(items, "random noise")?,
                *mix_count,
            )?),
            NoiseItemParams::Composite { dst, src, mask, .. } => {
                NoiseItemKind::Composite(CompositeNoise::new(
                    build_chain(dst, "composite noise dst")?,
                    build_chain(src, "composite noise src")?,
                    NoiseMask::new(mask.height, mask.width, mask.values.clone())?,
                )?)
            }
            NoiseItemParams::Guided {
                items,
                reference,
                method,
                guidance_factor,
                normalize_ref,
                ..
            } => NoiseItemKind::Guided(GuidedNoise::new(
                build_chain(items, "guided noise")?,
                reference.values.clone(),
                reference.shape,
                method.parse()?,
                *guidance_factor,
                *normalize_ref,
            )?),
        })
    }
}

/// Builds a chain from host entries, rejecting chains left empty
fn build_chain(items: &[NoiseItemParams], what: &str) -> Result<NoiseChain> {
    let mut chain = NoiseChain::new();
    for item in items {
        chain = chain.add_item(item.build()?, finite("custom_noise.factor", item.factor())?);
    }
    if chain.is_empty() {
        return Err(SonarError::Configuration(format!(
            "{what} has no items with a non-zero factor"
        )));
    }
    Ok(chain)
}

/// Raw Sonar parameters as supplied by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonarParams {
    /// Sign and magnitude of the guided perturbation
    pub direction: f32,
    /// EMA decay of the momentum buffer
    pub momentum: f32,
    /// Weight of the momentum buffer against the fresh sample in the perturbation
    pub momentum_hist: f32,
    /// zero, random, constant or sample
    pub init_type: String,
    /// Fill value for the constant init type
    pub init_value: f32,
    /// Noise type for fresh per-step samples
    pub noise_type: String,
    /// Noise type for the random init type
    pub rand_init_noise_type: String,
    /// Global noise scale
    pub s_noise: f32,
    /// RNG seed; a random seed is drawn when absent
    pub seed: Option<u64>,
    /// Normalize fresh samples to zero mean and unit std
    pub normalize: bool,
    /// Euler Ancestral only: how far the guided noise replaces the plain sample
    pub ancestral_blend: f32,
    /// Rule combining buffer and fresh sample (lerp or additive)
    pub history_mix: String,
    /// Optional noise chain; overrides `noise_type` when non-empty
    pub custom_noise: Vec<NoiseItemParams>,
    /// Rescale target for the chain factors; 0 disables rescaling
    pub custom_noise_rescale: f32,
}

impl Default for SonarParams {
    fn default() -> Self {
        Self {
            direction: 1.0,
            momentum: 0.95,
            momentum_hist: 0.75,
            init_type: InitType::Zero.name().to_string(),
            init_value: 0.0,
            noise_type: NoiseType::Gaussian.name().to_string(),
            rand_init_noise_type: NoiseType::Gaussian.name().to_string(),
            s_noise: 1.0,
            seed: None,
            normalize: true,
            ancestral_blend: 1.0,
            history_mix: HistoryMix::Lerp.name().to_string(),
            custom_noise: Vec::new(),
            custom_noise_rescale: 0.0,
        }
    }
}

impl SonarParams {
    /// Parses parameters from a JSON object; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SonarError::Configuration(e.to_string()))
    }
}

/// Validated, immutable Sonar configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SonarConfig {
    direction: f32,
    momentum: f32,
    momentum_hist: f32,
    init_type: InitType,
    init_value: f32,
    noise: NoiseSource,
    rand_init_noise_type: NoiseType,
    s_noise: f32,
    seed: Option<u64>,
    normalize: bool,
    ancestral_blend: f32,
    history_mix: HistoryMix,
    noise_params: NoiseParams,
}

impl Default for SonarConfig {
    fn default() -> Self {
        Self {
            direction: 1.0,
            momentum: 0.95,
            momentum_hist: 0.75,
            init_type: InitType::Zero,
            init_value: 0.0,
            noise: NoiseSource::default(),
            rand_init_noise_type: NoiseType::Gaussian,
            s_noise: 1.0,
            seed: None,
            normalize: true,
            ancestral_blend: 1.0,
            history_mix: HistoryMix::Lerp,
            noise_params: NoiseParams::default(),
        }
    }
}

fn finite(name: &str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SonarError::Configuration(format!(
            "{name} must be finite, got {value}"
        )))
    }
}

impl SonarConfig {
    /// Validates raw parameters
    ///
    /// Numeric parameters are not clamped; values outside the usual ranges
    /// (negative `direction`, `momentum` outside [0.85, 1.0]) are accepted as
    /// experimental settings.
    pub fn from_params(params: &SonarParams) -> Result<Self> {
        let noise_type = params.noise_type.parse::<NoiseType>()?;
        let rand_init_noise_type = params.rand_init_noise_type.parse::<NoiseType>()?;
        if rand_init_noise_type.is_sigma_dependent() {
            return Err(SonarError::Configuration(format!(
                "{rand_init_noise_type} noise cannot initialize the momentum buffer"
            )));
        }

        let noise = if params.custom_noise.is_empty() {
            NoiseSource::Single(noise_type)
        } else {
            let chain = build_chain(&params.custom_noise, "custom_noise")?;
            let rescale = finite("custom_noise_rescale", params.custom_noise_rescale)?;
            if rescale < 0.0 {
                return Err(SonarError::Configuration(format!(
                    "custom_noise_rescale must not be negative, got {rescale}"
                )));
            }
            NoiseSource::Chain(chain.rescaled(rescale))
        };

        Ok(Self {
            direction: finite("direction", params.direction)?,
            momentum: finite("momentum", params.momentum)?,
            momentum_hist: finite("momentum_hist", params.momentum_hist)?,
            init_type: params.init_type.parse()?,
            init_value: finite("init_value", params.init_value)?,
            noise,
            rand_init_noise_type,
            s_noise: finite("s_noise", params.s_noise)?,
            seed: params.seed,
            normalize: params.normalize,
            ancestral_blend: finite("ancestral_blend", params.ancestral_blend)?,
            history_mix: params.history_mix.parse()?,
            noise_params: NoiseParams::default(),
        })
    }

    /// Parses and validates parameters from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_params(&SonarParams::from_json(json)?)
    }

    pub fn direction(&self) -> f32 {
        self.direction
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn momentum_hist(&self) -> f32 {
        self.momentum_hist
    }

    pub fn init_type(&self) -> InitType {
        self.init_type
    }

    pub fn init_value(&self) -> f32 {
        self.init_value
    }

    /// Source of fresh per-step noise
    pub fn noise(&self) -> &NoiseSource {
        &self.noise
    }

    pub fn rand_init_noise_type(&self) -> NoiseType {
        self.rand_init_noise_type
    }

    pub fn s_noise(&self) -> f32 {
        self.s_noise
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn normalize(&self) -> bool {
        self.normalize
    }

    pub fn ancestral_blend(&self) -> f32 {
        self.ancestral_blend
    }

    pub fn history_mix(&self) -> HistoryMix {
        self.history_mix
    }

    pub fn noise_params(&self) -> &NoiseParams {
        &self.noise_params
    }
}

impl TryFrom<SonarParams> for SonarConfig {
    type Error = SonarError;

    fn try_from(params: SonarParams) -> Result<Self> {
        Self::from_params(&params)
    }
}

/// Options of the base integrator, outside the Sonar parameter set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerOptions {
    /// Ancestral noise amount (0 = deterministic, 1 = full ancestral)
    pub eta: f32,
    /// Euler churn amount
    pub s_churn: f32,
    /// Lowest sigma that receives churn
    pub s_tmin: f32,
    /// Highest sigma that receives churn; unbounded when absent
    pub s_tmax: Option<f32>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            eta: 1.0,
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: None,
        }
    }
}

impl SamplerOptions {
    /// Upper churn bound, infinite when unset
    pub fn churn_tmax(&self) -> f32 {
        self.s_tmax.unwrap_or(f32::INFINITY)
    }

    /// Rejects NaN values and negative eta or churn
    pub fn validate(&self) -> Result<()> {
        finite("eta", self.eta)?;
        finite("s_churn", self.s_churn)?;
        finite("s_tmin", self.s_tmin)?;
        if self.s_tmax.is_some_and(f32::is_nan) {
            return Err(SonarError::Configuration("s_tmax must not be NaN".to_string()));
        }
        if self.eta < 0.0 || self.s_churn < 0.0 {
            return Err(SonarError::Configuration(format!(
                "eta and s_churn must not be negative, got {} and {}",
                self.eta, self.s_churn
            )));
        }
        Ok(())
    }
}
