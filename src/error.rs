//! Error taxonomy for the vectorization control loop.
//!
//! Backend failures ([`TraceFailure`], [`RenderFailure`]) are data inside a search run:
//! the controller records them as zero-score evaluations. Configuration and domain
//! violations ([`ParamError`], [`VectorizeError::InvalidConfig`]) are fatal and surface
//! before any backend call.

use std::time::Duration;

use thiserror::Error;

use crate::search::Termination;

/// The tracing backend could not produce a candidate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraceFailure {
    #[error("backend rejected parameters: {0}")]
    Rejected(String),

    #[error("trace timed out after {0:?}")]
    TimedOut(Duration),

    #[error("backend produced empty geometry")]
    EmptyGeometry,

    #[error("trace worker exited without a result")]
    Disconnected,
}

/// The renderer could not rasterize a candidate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderFailure {
    #[error("malformed geometry: {0}")]
    Malformed(String),

    #[error("render timed out after {0:?}")]
    TimedOut(Duration),

    #[error("render worker exited without a result")]
    Disconnected,
}

/// A parameter set that does not fit the declared schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("unknown option `{0}`")]
    UnknownOption(String),

    #[error("missing option `{0}`")]
    MissingOption(String),

    #[error("option `{name}` = {value} is outside its domain {domain}")]
    OutOfDomain {
        name: String,
        value: String,
        domain: String,
    },
}

impl ParamError {
    pub fn out_of_domain(name: &str, value: impl ToString, domain: impl ToString) -> Self {
        Self::OutOfDomain {
            name: name.to_owned(),
            value: value.to_string(),
            domain: domain.to_string(),
        }
    }
}

/// A sub-metric could not be computed; the caller scores it as 0.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{metric} unavailable: {reason}")]
pub struct MetricUnavailable {
    pub metric: &'static str,
    pub reason: String,
}

impl MetricUnavailable {
    pub fn new(metric: &'static str, reason: impl Into<String>) -> Self {
        Self { metric, reason: reason.into() }
    }
}

/// The search ended without meeting its target. Carries the best-effort score so the
/// caller can decide whether to keep the candidate anyway.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("search exhausted ({reason:?}): best composite {best_score:.2} below target {target:.2}")]
pub struct SearchExhausted {
    pub reason: Termination,
    pub best_score: f64,
    pub target: f64,
}

#[derive(Debug, Error)]
pub enum VectorizeError {
    #[error("invalid parameter set: {0}")]
    InvalidParameterSet(#[from] ParamError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Trace(#[from] TraceFailure),

    #[error(transparent)]
    Render(#[from] RenderFailure),

    #[error(transparent)]
    SearchExhausted(#[from] SearchExhausted),

    #[error("input image is empty")]
    EmptyImage,

    #[error("settings I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl VectorizeError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

pub type Result<T, E = VectorizeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_option() {
        let err = VectorizeError::from(ParamError::out_of_domain("colors", 99, "0..=64"));
        let msg = err.to_string();
        assert!(msg.contains("colors"));
        assert!(msg.contains("99"));
        assert!(msg.contains("0..=64"));
    }

    #[test]
    fn test_exhausted_reports_best_effort_score() {
        let err = SearchExhausted {
            reason: Termination::IterationBudget,
            best_score: 87.5,
            target: 99.0,
        };
        assert!(err.to_string().contains("87.50"));
        assert!(matches!(VectorizeError::from(err), VectorizeError::SearchExhausted(_)));
    }
}
