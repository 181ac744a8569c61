//! Sigma utilities shared by the Sonar base equations
//!
//! k-diffusion formulation: the denoiser returns a denoised estimate and the
//! latent moves along `d = (x - denoised) / sigma`.

use burn::prelude::*;

use crate::error::{Result, SonarError};

/// Converts a denoised estimate into the ODE derivative `(x - denoised) / sigma`
pub fn to_d<B: Backend>(x: Tensor<B, 4>, sigma: f32, denoised: Tensor<B, 4>) -> Tensor<B, 4> {
    (x - denoised) / sigma
}

/// Compute ancestral sampling step parameters
///
/// Returns `(sigma_down, sigma_up)`: the deterministic step target and the
/// noise injection level. `eta` scales the noise (0 = ODE, 1 = full ancestral).
/// At `sigma_next == 0` both are zero.
pub fn get_ancestral_step(sigma: f32, sigma_next: f32, eta: f32) -> (f32, f32) {
    if sigma_next == 0.0 || eta == 0.0 {
        return (sigma_next, 0.0);
    }

    let sigma_up = (eta
        * (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
            .max(0.0)
            .sqrt())
    .min(sigma_next);
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();

    (sigma_down, sigma_up)
}

/// Euler churn factor for one step
///
/// `min(s_churn / (n - 1), sqrt(2) - 1)` when `s_tmin <= sigma <= s_tmax`,
/// otherwise 0.
pub fn churn_gamma(sigma: f32, s_churn: f32, s_tmin: f32, s_tmax: f32, total_steps: usize) -> f32 {
    if s_churn <= 0.0 || sigma < s_tmin || sigma > s_tmax {
        return 0.0;
    }
    let denom = total_steps.saturating_sub(1).max(1) as f32;
    (s_churn / denom).min(std::f32::consts::SQRT_2 - 1.0)
}

/// Checks a host-supplied sigma schedule
///
/// Every value must be finite and non-negative, and every sigma a step starts
/// from must be positive.
pub fn validate_sigmas(sigmas: &[f32]) -> Result<()> {
    if let Some((i, s)) = sigmas
        .iter()
        .enumerate()
        .find(|(_, s)| !s.is_finite() || **s < 0.0)
    {
        return Err(SonarError::Configuration(format!(
            "sigma[{i}] = {s} is not a finite non-negative value"
        )));
    }
    if sigmas.len() > 1 {
        if let Some(i) = sigmas[..sigmas.len() - 1].iter().position(|s| *s == 0.0) {
            return Err(SonarError::Configuration(format!(
                "sigma[{i}] is zero but is followed by another step"
            )));
        }
    }
    if let Some(i) = sigmas.windows(2).position(|w| w[1] > w[0]) {
        return Err(SonarError::Configuration(format!(
            "sigma[{}] = {} rises above sigma[{i}] = {}",
            i + 1,
            sigmas[i + 1],
            sigmas[i]
        )));
    }
    Ok(())
}
