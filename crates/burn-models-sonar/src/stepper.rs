//! Sonar steppers
//!
//! Euler and Euler Ancestral samplers whose per-step noise is biased by a
//! running average of earlier noise samples.
//!
//! Each step:
//! 1. draws a fresh noise sample from the configured generator,
//! 2. mixes it with the momentum buffer into a perturbation,
//! 3. applies the base step equation and adds the perturbation,
//! 4. folds the same fresh sample into the momentum buffer.
//!
//! Steps are strictly sequential: step `n + 1` consumes the latent and buffer
//! produced by step `n`.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::ElementConversion;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{Level, debug, trace, warn};

use crate::config::{SamplerOptions, SonarConfig, SonarParams};
use crate::error::{Result, SonarError};
use crate::guidance::ReferenceGuidance;
use crate::mixer::GuidanceMixer;
use crate::momentum::{MomentumBuffer, MomentumState};
use crate::noise::{NoiseParams, NoiseSource, NoiseType, scale_noise, validate_shape};
use crate::scheduler::{churn_gamma, get_ancestral_step, to_d, validate_sigmas};

/// Base integrator wrapped by a Sonar stepper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Euler,
    EulerAncestral,
}

impl SamplerKind {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerKind::Euler => "euler",
            SamplerKind::EulerAncestral => "euler_ancestral",
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SamplerKind {
    type Err = SonarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euler" => Ok(SamplerKind::Euler),
            "euler_ancestral" | "euler_a" => Ok(SamplerKind::EulerAncestral),
            _ => Err(SonarError::UnsupportedSampler(s.to_string())),
        }
    }
}

/// Plain Euler step from `sigma` to `sigma_next`
pub fn euler_step<B: Backend>(
    x: Tensor<B, 4>,
    denoised: Tensor<B, 4>,
    sigma: f32,
    sigma_next: f32,
) -> Tensor<B, 4> {
    let d = to_d(x.clone(), sigma, denoised);
    x + d * (sigma_next - sigma)
}

/// Plain Euler Ancestral step with caller-supplied noise
///
/// Steps to `sigma_down`, then adds `noise * s_noise * sigma_up`.
pub fn euler_ancestral_step<B: Backend>(
    x: Tensor<B, 4>,
    denoised: Tensor<B, 4>,
    sigma: f32,
    sigma_next: f32,
    eta: f32,
    s_noise: f32,
    noise: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let (sigma_down, sigma_up) = get_ancestral_step(sigma, sigma_next, eta);
    let d = to_d(x.clone(), sigma, denoised);
    let x = x + d * (sigma_down - sigma);

    if sigma_up > 0.0 {
        x + noise * (s_noise * sigma_up)
    } else {
        x
    }
}

/// Result of one Sonar step
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// Latent at `sigma_next`
    pub latent: Tensor<B, 4>,
    /// Difference from the unguided base step driven by the same noise
    pub perturbation: Tensor<B, 4>,
    /// Fresh noise sample drawn for this step (after normalization)
    pub noise: Tensor<B, 4>,
}

/// Progress report passed to the sampling callback after every step
#[derive(Debug, Clone)]
pub struct SonarStepInfo<B: Backend> {
    /// Current step (0-indexed)
    pub step: usize,
    /// Total number of steps
    pub total_steps: usize,
    pub sigma: f32,
    /// Sigma after churn (equal to `sigma` without churn)
    pub sigma_hat: f32,
    pub sigma_next: f32,
    /// Latent after the step
    pub latent: Tensor<B, 4>,
    /// Denoiser prediction the step consumed
    pub denoised: Tensor<B, 4>,
}

fn ensure_finite<B: Backend>(tensor: &Tensor<B, 4>, what: &'static str, step: usize) -> Result<()> {
    let values = tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SonarError::TensorData(format!("{e:?}")))?;

    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        warn!(step, what, "non-finite values after sonar step");
        Err(SonarError::NumericalInstability { what, step })
    }
}

/// Momentum-guided sampler state for one run
///
/// Owns the run's RNG, noise source, Brownian path seed and momentum buffer.
/// Not shared between runs.
pub struct SonarStepper<B: Backend> {
    kind: SamplerKind,
    config: SonarConfig,
    options: SamplerOptions,
    mixer: GuidanceMixer,
    seed: u64,
    rng: StdRng,
    noise: NoiseSource,
    path_seed: u64,
    momentum: MomentumBuffer<B>,
    reference: Option<ReferenceGuidance<B>>,
    step_index: usize,
}

impl<B: Backend> SonarStepper<B> {
    /// Create a stepper; a random seed is drawn when the config has none
    pub fn new(kind: SamplerKind, config: SonarConfig, options: SamplerOptions) -> Result<Self> {
        options.validate()?;
        let seed = config.seed().unwrap_or_else(rand::random);

        debug!(
            sampler = %kind,
            seed,
            direction = config.direction(),
            momentum = config.momentum(),
            momentum_hist = config.momentum_hist(),
            init_type = %config.init_type(),
            s_noise = config.s_noise(),
            eta = options.eta,
            "created sonar stepper"
        );

        let mut stepper = Self {
            kind,
            mixer: GuidanceMixer::new(&config),
            noise: config.noise().clone(),
            config,
            options,
            seed,
            rng: StdRng::seed_from_u64(seed),
            path_seed: 0,
            momentum: MomentumBuffer::new(),
            reference: None,
            step_index: 0,
        };
        stepper.reset();
        Ok(stepper)
    }

    /// Attach reference-latent guidance
    pub fn with_reference_guidance(mut self, guidance: ReferenceGuidance<B>) -> Self {
        self.reference = Some(guidance);
        self
    }

    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    pub fn config(&self) -> &SonarConfig {
        &self.config
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    /// Seed the run's RNG was built from
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Momentum buffer as left by the latest step
    pub fn momentum(&self) -> &MomentumBuffer<B> {
        &self.momentum
    }

    /// Number of steps taken since the run started
    pub fn steps_taken(&self) -> usize {
        self.step_index
    }

    /// Reference guidance, if attached
    pub fn reference_guidance(&self) -> Option<&ReferenceGuidance<B>> {
        self.reference.as_ref()
    }

    /// Starts a new run: replays the RNG from the seed, redraws the Brownian
    /// path and discards the momentum buffer and noise caches
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.path_seed = self.rng.next_u64();
        self.noise = self.config.noise().clone();
        self.momentum = MomentumBuffer::new();
        self.step_index = 0;
    }

    /// Performs one guided step from `sigma` to `sigma_next`
    ///
    /// `denoised` is the denoiser's prediction at `sigma`. The momentum buffer
    /// is initialized on the first step (from `latent` for the sample init
    /// type) and updated with the same fresh sample the perturbation was
    /// built from.
    pub fn step(
        &mut self,
        latent: Tensor<B, 4>,
        denoised: Tensor<B, 4>,
        sigma: f32,
        sigma_next: f32,
    ) -> Result<StepOutput<B>> {
        let shape = latent.dims();
        validate_shape(shape)?;
        if denoised.dims() != shape {
            return Err(SonarError::ShapeMismatch(format!(
                "prediction {:?} vs latent {:?}",
                denoised.dims(),
                shape
            )));
        }
        if !(sigma.is_finite() && sigma > 0.0 && sigma_next.is_finite() && sigma_next >= 0.0) {
            return Err(SonarError::Configuration(format!(
                "invalid sigma step {sigma} -> {sigma_next}"
            )));
        }

        let step = self.step_index;
        let device = latent.device();

        if self.momentum.state() == MomentumState::Uninitialized {
            self.momentum = MomentumBuffer::initialize(&self.config, &latent, &mut self.rng)?;
            debug!(init_type = %self.config.init_type(), ?shape, "initialized momentum buffer");
        }

        let denoised = match &self.reference {
            Some(guidance) => guidance.apply(step, denoised, sigma, sigma_next)?,
            None => denoised,
        };

        let buffer = match self.momentum.tensor() {
            Some(buffer) if buffer.dims() == shape => buffer.clone(),
            Some(buffer) => {
                return Err(SonarError::ShapeMismatch(format!(
                    "momentum buffer {:?} vs latent {:?}",
                    buffer.dims(),
                    shape
                )));
            }
            None => {
                return Err(SonarError::Configuration(
                    "momentum buffer missing after initialization".to_string(),
                ));
            }
        };

        let params = self
            .config
            .noise_params()
            .with_path_seed(self.path_seed)
            .with_sigmas(sigma, sigma_next);
        let noise = self.noise.generate(shape, &mut self.rng, &params, &device)?;
        let noise = scale_noise(noise, 1.0, self.config.normalize());

        let (next, perturbation) = match self.kind {
            SamplerKind::Euler => {
                // Guidance strength follows the noise level a full ancestral step would inject
                let (_, scale) = get_ancestral_step(sigma, sigma_next, 1.0);
                let perturbation = self.mixer.perturbation(buffer, noise.clone(), scale);
                let next = euler_step(latent, denoised, sigma, sigma_next) + perturbation.clone();
                (next, perturbation)
            }
            SamplerKind::EulerAncestral => {
                let (_, sigma_up) = get_ancestral_step(sigma, sigma_next, self.options.eta);
                let perturbation = self
                    .mixer
                    .ancestral_perturbation(buffer, noise.clone(), sigma_up);
                let next = euler_ancestral_step(
                    latent,
                    denoised,
                    sigma,
                    sigma_next,
                    self.options.eta,
                    self.config.s_noise(),
                    noise.clone(),
                ) + perturbation.clone();
                (next, perturbation)
            }
        };

        let momentum = self
            .momentum
            .clone()
            .update(noise.clone(), self.config.momentum())?;

        ensure_finite(&next, "latent", step)?;
        if let Some(buffer) = momentum.tensor() {
            ensure_finite(buffer, "momentum buffer", step)?;
        }

        self.momentum = momentum;
        self.step_index += 1;
        if tracing::enabled!(Level::TRACE) {
            let perturbation_mean_abs: f32 = perturbation.clone().abs().mean().into_scalar().elem();
            trace!(step, sigma, sigma_next, perturbation_mean_abs, "sonar step done");
        }

        Ok(StepOutput {
            latent: next,
            perturbation,
            noise,
        })
    }

    /// Runs the full sigma schedule and returns the final latent
    ///
    /// `model(x, sigma)` returns the denoised prediction; host-specific
    /// arguments belong in its closure. The run starts from a reset state.
    /// Euler mode applies churn per [`SamplerOptions`]; `disable` silences
    /// per-step progress events.
    pub fn sample<M, F>(
        &mut self,
        mut model: M,
        x: Tensor<B, 4>,
        sigmas: &[f32],
        mut callback: F,
        disable: bool,
    ) -> Result<Tensor<B, 4>>
    where
        M: FnMut(Tensor<B, 4>, f32) -> Tensor<B, 4>,
        F: FnMut(SonarStepInfo<B>),
    {
        validate_sigmas(sigmas)?;
        validate_shape(x.dims())?;
        self.reset();

        let total_steps = sigmas.len().saturating_sub(1);
        let device = x.device();
        let mut x = x;

        for i in 0..total_steps {
            let (sigma, sigma_next) = (sigmas[i], sigmas[i + 1]);

            let mut sigma_hat = sigma;
            if self.kind == SamplerKind::Euler {
                let gamma = churn_gamma(
                    sigma,
                    self.options.s_churn,
                    self.options.s_tmin,
                    self.options.churn_tmax(),
                    total_steps,
                );
                if gamma > 0.0 {
                    sigma_hat = sigma * (gamma + 1.0);
                    let eps = NoiseSource::Single(NoiseType::Gaussian).generate(
                        x.dims(),
                        &mut self.rng,
                        &NoiseParams::default(),
                        &device,
                    )?;
                    let churn = (sigma_hat.powi(2) - sigma.powi(2)).sqrt();
                    x = x + eps * (self.config.s_noise() * churn);
                }
            }

            let denoised = model(x.clone(), sigma_hat);
            let output = self.step(x, denoised.clone(), sigma_hat, sigma_next)?;
            x = output.latent;

            if !disable {
                debug!(step = i + 1, total_steps, sigma = sigma_hat, sigma_next, "sonar sampling");
            }
            callback(SonarStepInfo {
                step: i,
                total_steps,
                sigma,
                sigma_hat,
                sigma_next,
                latent: x.clone(),
                denoised,
            });
        }

        Ok(x)
    }
}

/// Validated sampler description handed to the host's registration code
///
/// Creates a fresh [`SonarStepper`] per run. Holds no tensors apart from an
/// optional guidance reference.
#[derive(Debug, Clone)]
pub struct StepperHandle<B: Backend> {
    kind: SamplerKind,
    config: SonarConfig,
    options: SamplerOptions,
    guidance: Option<ReferenceGuidance<B>>,
}

impl<B: Backend> StepperHandle<B> {
    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    pub fn config(&self) -> &SonarConfig {
        &self.config
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    pub fn guidance(&self) -> Option<&ReferenceGuidance<B>> {
        self.guidance.as_ref()
    }

    /// Attach reference-latent guidance to every run
    pub fn with_reference_guidance(mut self, guidance: ReferenceGuidance<B>) -> Self {
        self.guidance = Some(guidance);
        self
    }

    /// Creates the per-run stepper
    pub fn stepper(&self) -> Result<SonarStepper<B>> {
        let stepper = SonarStepper::new(self.kind, self.config.clone(), self.options)?;
        Ok(match &self.guidance {
            Some(guidance) => stepper.with_reference_guidance(guidance.clone()),
            None => stepper,
        })
    }

    /// Runs one complete sampling pass with a fresh stepper
    pub fn sample<M, F>(
        &self,
        model: M,
        x: Tensor<B, 4>,
        sigmas: &[f32],
        callback: F,
        disable: bool,
    ) -> Result<Tensor<B, 4>>
    where
        M: FnMut(Tensor<B, 4>, f32) -> Tensor<B, 4>,
        F: FnMut(SonarStepInfo<B>),
    {
        self.stepper()?.sample(model, x, sigmas, callback, disable)
    }
}

/// Builds a stepper handle for the named base sampler
///
/// Fails with [`SonarError::UnsupportedSampler`] for anything other than
/// Euler or Euler Ancestral.
pub fn make_sonar_stepper<B: Backend>(
    sampler: &str,
    config: SonarConfig,
    options: SamplerOptions,
    guidance: Option<ReferenceGuidance<B>>,
) -> Result<StepperHandle<B>> {
    let kind = sampler.parse::<SamplerKind>()?;
    options.validate()?;
    debug!(sampler = %kind, guided = guidance.is_some(), "registered sonar sampler");
    Ok(StepperHandle {
        kind,
        config,
        options,
        guidance,
    })
}

/// Host-facing sampling entry point
///
/// Resolves the sampler name and validates all parameters before any tensor
/// work, then runs the full schedule.
#[allow(clippy::too_many_arguments)]
pub fn sample_sonar<B, M, F>(
    sampler: &str,
    model: M,
    x: Tensor<B, 4>,
    sigmas: &[f32],
    callback: F,
    disable: bool,
    options: SamplerOptions,
    params: &SonarParams,
    guidance: Option<ReferenceGuidance<B>>,
) -> Result<Tensor<B, 4>>
where
    B: Backend,
    M: FnMut(Tensor<B, 4>, f32) -> Tensor<B, 4>,
    F: FnMut(SonarStepInfo<B>),
{
    let config = SonarConfig::from_params(params)?;
    make_sonar_stepper(sampler, config, options, guidance)?.sample(model, x, sigmas, callback, disable)
}
