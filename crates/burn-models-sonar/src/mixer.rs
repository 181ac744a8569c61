//! Guidance mixer
//!
//! Builds the perturbation a Sonar step adds on top of its base update. The
//! momentum buffer and the step's fresh noise sample are first combined by a
//! [`HistoryMix`] rule weighted by `momentum_hist`, then signed and scaled by
//! `direction` and `s_noise`.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;

use crate::config::SonarConfig;
use crate::error::{Result, SonarError};

/// Rule combining the momentum buffer with a fresh sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMix {
    /// `momentum_hist * buffer + (1 - momentum_hist) * sample`
    #[default]
    Lerp,
    /// `sample + momentum_hist * buffer`
    Additive,
}

impl HistoryMix {
    pub fn name(&self) -> &'static str {
        match self {
            HistoryMix::Lerp => "lerp",
            HistoryMix::Additive => "additive",
        }
    }

    pub fn mix<B: Backend>(
        &self,
        buffer: Tensor<B, 4>,
        sample: Tensor<B, 4>,
        momentum_hist: f32,
    ) -> Tensor<B, 4> {
        match self {
            HistoryMix::Lerp => buffer * momentum_hist + sample * (1.0 - momentum_hist),
            HistoryMix::Additive => sample + buffer * momentum_hist,
        }
    }
}

impl fmt::Display for HistoryMix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HistoryMix {
    type Err = SonarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lerp" => Ok(HistoryMix::Lerp),
            "additive" => Ok(HistoryMix::Additive),
            _ => Err(SonarError::Configuration(format!("unknown history_mix: {s}"))),
        }
    }
}

/// Combines fresh noise, momentum history and configuration into a perturbation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceMixer {
    direction: f32,
    s_noise: f32,
    momentum_hist: f32,
    history_mix: HistoryMix,
    ancestral_blend: f32,
}

impl GuidanceMixer {
    pub fn new(config: &SonarConfig) -> Self {
        Self {
            direction: config.direction(),
            s_noise: config.s_noise(),
            momentum_hist: config.momentum_hist(),
            history_mix: config.history_mix(),
            ancestral_blend: config.ancestral_blend(),
        }
    }

    /// Buffer and sample combined by the history rule, before any scaling
    pub fn guided_noise<B: Backend>(&self, buffer: Tensor<B, 4>, sample: Tensor<B, 4>) -> Tensor<B, 4> {
        self.history_mix.mix(buffer, sample, self.momentum_hist)
    }

    /// Perturbation added to a deterministic (Euler) step
    ///
    /// `direction * s_noise * scale * guided_noise`
    pub fn perturbation<B: Backend>(
        &self,
        buffer: Tensor<B, 4>,
        sample: Tensor<B, 4>,
        scale: f32,
    ) -> Tensor<B, 4> {
        self.guided_noise(buffer, sample) * (self.direction * self.s_noise * scale)
    }

    /// Perturbation relative to a plain ancestral step using `sample`
    ///
    /// The ancestral noise term becomes
    /// `s_noise * scale * (sample + direction * blend * (guided_noise - sample))`,
    /// so `direction = 1, blend = 1` replaces the plain sample with the guided
    /// noise and `direction = 0` leaves the plain step untouched.
    pub fn ancestral_perturbation<B: Backend>(
        &self,
        buffer: Tensor<B, 4>,
        sample: Tensor<B, 4>,
        scale: f32,
    ) -> Tensor<B, 4> {
        let guided = self.guided_noise(buffer, sample.clone());
        (guided - sample) * (self.direction * self.ancestral_blend * self.s_noise * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SonarParams;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn mixer(direction: f32, momentum_hist: f32) -> GuidanceMixer {
        GuidanceMixer::new(
            &SonarConfig::from_params(&SonarParams {
                direction,
                momentum_hist,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn tensor(values: &[f32]) -> Tensor<TestBackend, 4> {
        let device = <TestBackend as Backend>::Device::default();
        Tensor::from_data(TensorData::new(values.to_vec(), [1, 1, 2, 2]), &device)
    }

    fn to_vec(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_lerp_rule_regression() {
        // 0.3 * buffer + 0.7 * sample
        let out = HistoryMix::Lerp.mix(
            tensor(&[1.0, 0.0, -2.0, 4.0]),
            tensor(&[0.0, 1.0, 2.0, -4.0]),
            0.3,
        );
        let expected = [0.3, 0.7, 0.8, -1.6];
        for (v, e) in to_vec(out).iter().zip(expected) {
            assert!((v - e).abs() < 1e-6, "{v} vs {e}");
        }
    }

    #[test]
    fn test_additive_rule() {
        let out = HistoryMix::Additive.mix(tensor(&[1.0; 4]), tensor(&[2.0; 4]), 0.5);
        assert!(to_vec(out).iter().all(|v| (v - 2.5).abs() < 1e-6));
    }

    #[test]
    fn test_unknown_rule() {
        assert!("cubic".parse::<HistoryMix>().is_err());
    }

    #[test]
    fn test_sign_symmetry() {
        let buffer = tensor(&[0.5, -1.0, 2.0, 0.25]);
        let sample = tensor(&[1.5, 0.5, -0.75, 3.0]);

        for d in [0.5, 1.0, 2.5] {
            let pos = mixer(d, 0.75).perturbation(buffer.clone(), sample.clone(), 1.3);
            let neg = mixer(-d, 0.75).perturbation(buffer.clone(), sample.clone(), 1.3);
            for (p, n) in to_vec(pos).iter().zip(to_vec(neg)) {
                assert_eq!(*p, -n);
            }

            let pos = mixer(d, 0.75).ancestral_perturbation(buffer.clone(), sample.clone(), 0.8);
            let neg = mixer(-d, 0.75).ancestral_perturbation(buffer.clone(), sample.clone(), 0.8);
            for (p, n) in to_vec(pos).iter().zip(to_vec(neg)) {
                assert_eq!(*p, -n);
            }
        }
    }

    #[test]
    fn test_zero_direction_is_neutral() {
        let buffer = tensor(&[0.5, -1.0, 2.0, 0.25]);
        let sample = tensor(&[1.5, 0.5, -0.75, 3.0]);
        let m = mixer(0.0, 0.75);
        assert!(to_vec(m.perturbation(buffer.clone(), sample.clone(), 2.0)).iter().all(|v| *v == 0.0));
        assert!(to_vec(m.ancestral_perturbation(buffer, sample, 2.0)).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_momentum_hist_one_uses_only_buffer() {
        let buffer = tensor(&[0.5, -1.0, 2.0, 0.25]);
        let sample = tensor(&[1.5, 0.5, -0.75, 3.0]);
        let out = mixer(1.0, 1.0).guided_noise(buffer.clone(), sample);
        assert_eq!(to_vec(out), to_vec(buffer));
    }
}
