//! Momentum-guided Euler and Euler Ancestral sampling
//!
//! A Sonar sampler keeps a running average of the noise it has drawn and
//! biases each step's noise toward (or away from) that history.
//!
//! ```ignore
//! let config = SonarConfig::from_json(r#"{"momentum": 0.95, "noise_type": "pink"}"#)?;
//! let sampler = make_sonar_stepper("euler_a", config, SamplerOptions::default(), None)?;
//! let latent = sampler.sample(|x, sigma| model.denoise(x, sigma), noise, &sigmas, |_| {}, false)?;
//! ```

pub mod config;
pub mod error;
pub mod guidance;
pub mod mixer;
pub mod momentum;
pub mod noise;
pub mod scheduler;
pub mod stepper;

pub use config::{
    InitType, MaskParams, NoiseItemParams, ReferenceParams, SamplerOptions, SonarConfig,
    SonarParams,
};
pub use error::{Result, SonarError};
pub use guidance::{GuidanceKind, ReferenceGuidance};
pub use mixer::{GuidanceMixer, HistoryMix};
pub use momentum::{MomentumBuffer, MomentumState, ema_update};
pub use noise::{
    CompositeNoise, GuidedNoise, NoiseChain, NoiseItem, NoiseItemKind, NoiseMask, NoiseParams,
    NoiseSource, NoiseType, PermuteMode, RandomNoise, RepeatedNoise, ScheduledNoise, generate,
    generate_named, generate_values, noisy_latent_like, scale_noise,
};
pub use scheduler::{churn_gamma, get_ancestral_step, to_d, validate_sigmas};
pub use stepper::{
    SamplerKind, SonarStepInfo, SonarStepper, StepOutput, StepperHandle, euler_ancestral_step,
    euler_step, make_sonar_stepper, sample_sonar,
};
