use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy shared by the pipeline, the store and the front ends.
///
/// Every variant carries a human-readable message. None of them are retried
/// automatically; the caller decides whether to re-trigger the failed step.
#[derive(Debug, Error)]
pub enum InspectError {
    /// Missing or malformed input (blank chamber id, out-of-order transition).
    #[error("{0}")]
    Validation(String),

    /// The image could not be captured, read or decoded.
    #[error("image acquisition failed: {0}")]
    Acquisition(String),

    /// The detection capability could not be initialized or failed to run.
    #[error("detection model unavailable: {0}")]
    ModelUnavailable(String),

    /// Inference did not finish within the configured bound.
    #[error("inference timed out after {}ms", .0.as_millis())]
    InferenceTimeout(Duration),

    /// Storage I/O failed (disk full, lock contention, corrupt row).
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A query or delete matched nothing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl InspectError {
    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            InspectError::Validation(_) => "validation_error",
            InspectError::Acquisition(_) => "acquisition_error",
            InspectError::ModelUnavailable(_) => "model_unavailable",
            InspectError::InferenceTimeout(_) => "inference_timeout",
            InspectError::Persistence(_) => "persistence_error",
            InspectError::NotFound(_) => "not_found",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            InspectError::Validation(_) | InspectError::Acquisition(_) => 400,
            InspectError::NotFound(_) => 404,
            InspectError::Persistence(_) => 500,
            InspectError::ModelUnavailable(_) => 503,
            InspectError::InferenceTimeout(_) => 504,
        }
    }

    pub(crate) fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        InspectError::Persistence(format!("{context}: {err}"))
    }
}

impl From<rusqlite::Error> for InspectError {
    fn from(err: rusqlite::Error) -> Self {
        InspectError::Persistence(err.to_string())
    }
}

pub type Result<T, E = InspectError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_follow_taxonomy() {
        let cases = [
            (InspectError::Validation("x".into()), "validation_error", 400),
            (InspectError::Acquisition("x".into()), "acquisition_error", 400),
            (InspectError::NotFound("x".into()), "not_found", 404),
            (InspectError::Persistence("x".into()), "persistence_error", 500),
            (InspectError::ModelUnavailable("x".into()), "model_unavailable", 503),
            (
                InspectError::InferenceTimeout(Duration::from_millis(250)),
                "inference_timeout",
                504,
            ),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn timeout_message_reports_bound() {
        let err = InspectError::InferenceTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "inference timed out after 1500ms");
    }
}
