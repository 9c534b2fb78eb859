//! Error taxonomy for the engine.
//!
//! Only [`SlamError::Configuration`] is fatal. Everything else is either a
//! rejected sample (`InvalidInput`) or an internal condition that tracking and
//! the mapping threads recover from locally.

use thiserror::Error;

use crate::vocabulary::VocabularyError;

#[derive(Debug, Error)]
pub enum SlamError {
    /// Bad calibration, bad parameters or an unusable vocabulary.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A sensor sample was rejected; engine state is unchanged.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Map bootstrap failed for this frame and will be retried.
    #[error("map initialization failed: {0}")]
    InitializationFailure(String),

    /// Tracking could not estimate the pose of this frame.
    #[error("tracking lost: {0}")]
    TrackingLoss(String),

    /// An optimization produced a non-finite or worse estimate and was discarded.
    #[error("optimization diverged: {0}")]
    OptimizationDivergence(String),

    /// A worker thread missed the reset handshake. Nothing was reset; retry.
    #[error("worker did not respond: {0}")]
    WorkerTimeout(String),
}

impl SlamError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SlamError::Configuration(_))
    }

    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        SlamError::InvalidInput(msg.into())
    }
}

impl From<VocabularyError> for SlamError {
    fn from(err: VocabularyError) -> Self {
        SlamError::Configuration(err.to_string())
    }
}

impl From<serde_yaml::Error> for SlamError {
    fn from(err: serde_yaml::Error) -> Self {
        SlamError::Configuration(format!("malformed settings: {err}"))
    }
}

pub type Result<T, E = SlamError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(SlamError::Configuration("x".into()).is_fatal());
        assert!(!SlamError::InvalidInput("x".into()).is_fatal());
        assert!(!SlamError::TrackingLoss("x".into()).is_fatal());
        assert!(!SlamError::OptimizationDivergence("x".into()).is_fatal());
    }

    #[test]
    fn test_vocabulary_error_maps_to_configuration() {
        let err: SlamError = VocabularyError::Parse("bad header".into()).into();
        assert!(matches!(err, SlamError::Configuration(_)));
    }
}
