//! Reference-latent guidance
//!
//! Nudges the denoiser's prediction toward a reference latent for a window of
//! steps, before the Sonar step equations run.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;

use crate::error::{Result, SonarError};
use crate::noise::scale_noise;

/// How the prediction moves toward the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuidanceKind {
    /// `denoised + (reference - denoised) * factor`
    Linear,
    /// Euler step toward the reference: the linear move scaled by
    /// `(sigma - sigma_next) / sigma`
    #[default]
    Euler,
}

impl GuidanceKind {
    pub fn name(&self) -> &'static str {
        match self {
            GuidanceKind::Linear => "linear",
            GuidanceKind::Euler => "euler",
        }
    }
}

impl fmt::Display for GuidanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GuidanceKind {
    type Err = SonarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(GuidanceKind::Linear),
            "euler" => Ok(GuidanceKind::Euler),
            _ => Err(SonarError::Configuration(format!("unknown guidance type: {s}"))),
        }
    }
}

/// Reference-latent guidance active over an inclusive step window
#[derive(Debug, Clone)]
pub struct ReferenceGuidance<B: Backend> {
    kind: GuidanceKind,
    factor: f32,
    start_step: usize,
    end_step: usize,
    reference: Tensor<B, 4>,
}

impl<B: Backend> ReferenceGuidance<B> {
    /// Create guidance toward `reference`
    ///
    /// When `normalize` is set the reference is shifted and scaled to zero
    /// mean and unit std first.
    pub fn new(
        kind: GuidanceKind,
        factor: f32,
        start_step: usize,
        end_step: usize,
        reference: Tensor<B, 4>,
        normalize: bool,
    ) -> Result<Self> {
        if !factor.is_finite() {
            return Err(SonarError::Configuration(format!(
                "guidance factor must be finite, got {factor}"
            )));
        }
        if start_step > end_step {
            return Err(SonarError::Configuration(format!(
                "guidance start_step {start_step} is after end_step {end_step}"
            )));
        }

        Ok(Self {
            kind,
            factor,
            start_step,
            end_step,
            reference: scale_noise(reference, 1.0, normalize),
        })
    }

    pub fn kind(&self) -> GuidanceKind {
        self.kind
    }

    /// Whether guidance applies at `step`
    pub fn is_active(&self, step: usize) -> bool {
        self.factor != 0.0 && (self.start_step..=self.end_step).contains(&step)
    }

    /// Returns the guided prediction for `step`
    pub fn apply(
        &self,
        step: usize,
        denoised: Tensor<B, 4>,
        sigma: f32,
        sigma_next: f32,
    ) -> Result<Tensor<B, 4>> {
        if !self.is_active(step) {
            return Ok(denoised);
        }
        if self.reference.dims() != denoised.dims() {
            return Err(SonarError::ShapeMismatch(format!(
                "reference latent {:?} vs prediction {:?}",
                self.reference.dims(),
                denoised.dims()
            )));
        }

        let strength = match self.kind {
            GuidanceKind::Linear => self.factor,
            GuidanceKind::Euler => self.factor * (sigma - sigma_next) / sigma,
        };
        let delta = self.reference.clone() - denoised.clone();
        Ok(denoised + delta * strength)
    }
}
