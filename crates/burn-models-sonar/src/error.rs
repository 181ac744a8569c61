//! Error types for Sonar sampling

/// Errors raised while configuring or running a Sonar sampler
#[derive(Debug, thiserror::Error)]
pub enum SonarError {
    /// Invalid enum value or malformed numeric parameter
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A tensor shape diverged from the latent shape, or a dimension was not positive
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Unknown noise selector
    #[error("unsupported noise type: {0}")]
    UnsupportedNoiseType(String),

    /// Unknown or unsupported base integrator
    #[error("unsupported sampler: {0}")]
    UnsupportedSampler(String),

    /// NaN or Inf detected in sampler state after a step
    #[error("numerical instability in {what} at step {step}")]
    NumericalInstability { what: &'static str, step: usize },

    /// Tensor data could not be read back from the backend
    #[error("tensor data error: {0}")]
    TensorData(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SonarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SonarError::UnsupportedNoiseType("foo".to_string());
        assert_eq!(err.to_string(), "unsupported noise type: foo");

        let err = SonarError::ShapeMismatch(format!("non-positive dimension in {:?}", [1, 4, 8, 0]));
        assert!(err.to_string().contains("[1, 4, 8, 0]"));
    }
}
