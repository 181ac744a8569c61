//! Momentum buffer: running EMA of noise directions
//!
//! Lifecycle per run: `Uninitialized -> Initialized -> Updated*`. The buffer is
//! owned by one stepper and dropped when the run ends.

use burn::prelude::*;
use rand::rngs::StdRng;

use crate::config::{InitType, SonarConfig};
use crate::error::{Result, SonarError};
use crate::noise::{NoiseSource, scale_noise};

/// Where a momentum buffer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentumState {
    Uninitialized,
    Initialized,
    /// Number of updates applied since initialization
    Updated(usize),
}

/// EMA update: `momentum * buffer + (1 - momentum) * sample`
///
/// `momentum = 1` returns the buffer unchanged and `momentum = 0` returns the
/// sample, for any finite inputs.
pub fn ema_update<B: Backend>(
    buffer: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    momentum: f32,
) -> Tensor<B, 4> {
    buffer * momentum + sample * (1.0 - momentum)
}

/// Running exponential average of the noise samples seen by a stepper
#[derive(Debug, Clone)]
pub struct MomentumBuffer<B: Backend> {
    state: MomentumState,
    buffer: Option<Tensor<B, 4>>,
}

impl<B: Backend> Default for MomentumBuffer<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> MomentumBuffer<B> {
    /// Create an uninitialized buffer
    pub fn new() -> Self {
        Self {
            state: MomentumState::Uninitialized,
            buffer: None,
        }
    }

    /// Fills the buffer according to the configured init type
    ///
    /// The buffer takes the shape and device of `latent`, the run's starting
    /// latent. `Sample` copies it (normalized when the config normalizes).
    /// `Random` draws one sample of the configured random-init noise type
    /// from `rng`; the other init types leave `rng` untouched.
    pub fn initialize(config: &SonarConfig, latent: &Tensor<B, 4>, rng: &mut StdRng) -> Result<Self> {
        let shape = latent.dims();
        let device = latent.device();
        crate::noise::validate_shape(shape)?;

        let buffer = match config.init_type() {
            InitType::Zero => Tensor::zeros(shape, &device),
            InitType::Constant => Tensor::full(shape, config.init_value(), &device),
            InitType::Sample => scale_noise(latent.clone(), 1.0, config.normalize()),
            InitType::Random => {
                let noise = NoiseSource::Single(config.rand_init_noise_type()).generate(
                    shape,
                    rng,
                    config.noise_params(),
                    &device,
                )?;
                scale_noise(noise, 1.0, config.normalize())
            }
        };

        Ok(Self {
            state: MomentumState::Initialized,
            buffer: Some(buffer),
        })
    }

    /// Wraps an existing tensor as an initialized buffer
    pub fn from_tensor(buffer: Tensor<B, 4>) -> Self {
        Self {
            state: MomentumState::Initialized,
            buffer: Some(buffer),
        }
    }

    pub fn state(&self) -> MomentumState {
        self.state
    }

    /// Current buffer contents, if initialized
    pub fn tensor(&self) -> Option<&Tensor<B, 4>> {
        self.buffer.as_ref()
    }

    /// Shape of the buffer, if initialized
    pub fn dims(&self) -> Option<[usize; 4]> {
        self.buffer.as_ref().map(|b| b.dims())
    }

    /// Folds `sample` into the buffer with the given EMA decay
    pub fn update(self, sample: Tensor<B, 4>, momentum: f32) -> Result<Self> {
        let buffer = self.buffer.ok_or_else(|| {
            SonarError::Configuration("momentum buffer updated before initialization".to_string())
        })?;
        if buffer.dims() != sample.dims() {
            return Err(SonarError::ShapeMismatch(format!(
                "momentum buffer {:?} vs sample {:?}",
                buffer.dims(),
                sample.dims()
            )));
        }

        let updates = match self.state {
            MomentumState::Updated(n) => n + 1,
            _ => 1,
        };
        Ok(Self {
            state: MomentumState::Updated(updates),
            buffer: Some(ema_update(buffer, sample, momentum)),
        })
    }
}
