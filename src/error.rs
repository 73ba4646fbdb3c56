//! Unified error hierarchy for trainload
//!
//! Each pipeline stage has its own error enum; `EngineError` folds them
//! together and classifies them for callers and for the tracing system.

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{AthleteId, MetricType};
use crate::normalize::InvalidActivity;

/// Top-level error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range raw activity
    #[error("Invalid activity: {0}")]
    InvalidActivity(#[from] InvalidActivity),

    /// Load computation errors
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Rolling window errors
    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    /// Plan seeding or mutation errors
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// External profile store or persistence failure
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Athlete has no state in the engine
    #[error("Unknown athlete: {0}")]
    UnknownAthlete(AthleteId),

    /// Athlete exists but has no plan yet
    #[error("No training plan for athlete {0}")]
    NoPlan(AthleteId),

    /// Exclusive access to the athlete record was not granted in time
    #[error("Timed out after {waited_ms}ms waiting for athlete {athlete_id}")]
    LockTimeout { athlete_id: AthleteId, waited_ms: u64 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Background replay task panicked or was cancelled
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// Load calculator errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoadError {
    /// None of the metrics in the activity has a configured threshold
    #[error("Missing threshold for {metrics:?} in activity {activity_id}")]
    MissingThreshold {
        activity_id: String,
        metrics: Vec<MetricType>,
    },

    /// Activity belongs to a different athlete than the profile
    #[error("Activity {activity_id} belongs to {activity_athlete}, profile is {profile_athlete}")]
    AthleteMismatch {
        activity_id: String,
        activity_athlete: AthleteId,
        profile_athlete: AthleteId,
    },
}

/// Load aggregator errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregateError {
    /// A newer replay request superseded this one
    #[error("Replay generation {generation} superseded by {latest}")]
    OutOfOrderReplayConflict { generation: u64, latest: u64 },

    /// Sample predates the folded checkpoint and cannot be replayed
    #[error("Sample dated {date} is before the retention horizon {horizon}")]
    SampleBeyondRetention { date: NaiveDate, horizon: NaiveDate },

    /// Sample addressed to another athlete's timeline
    #[error("Sample for {got} sent to timeline of {expected}")]
    AthleteMismatch { expected: AthleteId, got: AthleteId },
}

/// Periodization planner and plan mutation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    /// Target event is closer than the minimum plan length
    #[error("Target date {target_date} is less than {min_days} days after {as_of}")]
    InsufficientLeadTime {
        as_of: NaiveDate,
        target_date: NaiveDate,
        min_days: i64,
    },

    /// Profile has no target event date
    #[error("Athlete {0} has no target event date")]
    MissingTargetDate(AthleteId),

    /// Policy values are inconsistent
    #[error("Invalid plan policy: {0}")]
    InvalidPolicy(String),

    /// Programming error: broken plan invariant
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// A broken internal invariant, e.g. mutating a block that already started
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Invariant violated in {operation}: {detail}")]
pub struct InvariantViolation {
    pub operation: String,
    pub detail: String,
}

impl InvariantViolation {
    pub fn new(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        InvariantViolation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Errors reported by external collaborators
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaboratorError {
    /// Profile store has no profile for the athlete
    #[error("Profile not found: {0}")]
    ProfileNotFound(AthleteId),

    /// Collaborator could not be reached
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable { collaborator: String, reason: String },

    /// Collaborator refused the write
    #[error("{collaborator} rejected write: {reason}")]
    Rejected { collaborator: String, reason: String },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy exposed to the surrounding service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidActivity,
    MissingThreshold,
    OutOfOrderReplayConflict,
    InsufficientLeadTime,
    InvariantViolation,
    Collaborator,
    NotFound,
    Busy,
    Configuration,
    Internal,
}

impl EngineError {
    /// Taxonomy bucket of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidActivity(_) => ErrorKind::InvalidActivity,
            EngineError::Load(LoadError::MissingThreshold { .. }) => ErrorKind::MissingThreshold,
            EngineError::Load(LoadError::AthleteMismatch { .. }) => ErrorKind::InvariantViolation,
            EngineError::Aggregate(AggregateError::OutOfOrderReplayConflict { .. }) => {
                ErrorKind::OutOfOrderReplayConflict
            }
            EngineError::Aggregate(AggregateError::SampleBeyondRetention { .. }) => {
                ErrorKind::InvalidActivity
            }
            EngineError::Aggregate(AggregateError::AthleteMismatch { .. }) => {
                ErrorKind::InvariantViolation
            }
            EngineError::Plan(PlanError::InsufficientLeadTime { .. })
            | EngineError::Plan(PlanError::MissingTargetDate(_)) => ErrorKind::InsufficientLeadTime,
            EngineError::Plan(PlanError::InvalidPolicy(_)) => ErrorKind::Configuration,
            EngineError::Plan(PlanError::Invariant(_)) => ErrorKind::InvariantViolation,
            EngineError::Collaborator(CollaboratorError::ProfileNotFound(_)) => ErrorKind::NotFound,
            EngineError::Collaborator(_) => ErrorKind::Collaborator,
            EngineError::UnknownAthlete(_) | EngineError::NoPlan(_) => ErrorKind::NotFound,
            EngineError::LockTimeout { .. } => ErrorKind::Busy,
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::TaskFailed(_) => ErrorKind::Internal,
        }
    }

    /// Check if the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Collaborator(CollaboratorError::Unavailable { .. })
                | EngineError::LockTimeout { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::OutOfOrderReplayConflict => ErrorSeverity::Info,
            ErrorKind::InvalidActivity | ErrorKind::MissingThreshold | ErrorKind::NotFound => {
                ErrorSeverity::Warning
            }
            ErrorKind::InsufficientLeadTime | ErrorKind::Busy => ErrorSeverity::Warning,
            ErrorKind::InvariantViolation | ErrorKind::Internal => ErrorSeverity::Critical,
            ErrorKind::Collaborator | ErrorKind::Configuration => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            EngineError::InvalidActivity(invalid) => {
                format!("The activity could not be accepted: {}", invalid.reason)
            }
            EngineError::Load(LoadError::MissingThreshold { metrics, .. }) => {
                let names: Vec<&str> = metrics.iter().map(|m| m.as_str()).collect();
                format!(
                    "Set a threshold for {} in your profile to compute training load.",
                    names.join(", ")
                )
            }
            EngineError::Plan(PlanError::InsufficientLeadTime { target_date, .. }) => {
                format!(
                    "Your event on {} is too close to build a training plan.",
                    target_date
                )
            }
            EngineError::Plan(PlanError::MissingTargetDate(_)) => {
                "Set a target event date to generate a training plan.".to_string()
            }
            EngineError::LockTimeout { .. } => {
                "Your training data is being updated. Please try again shortly.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Broken invariant, needs a developer
    Critical,
    /// Operation failed but the engine can continue
    Error,
    /// Rejected input or expected condition
    Warning,
    /// Informational, not surfaced to users
    Info,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::RejectionReason;

    #[test]
    fn test_error_kind_mapping() {
        let err = EngineError::Aggregate(AggregateError::OutOfOrderReplayConflict {
            generation: 1,
            latest: 2,
        });
        assert_eq!(err.kind(), ErrorKind::OutOfOrderReplayConflict);
        assert_eq!(err.severity(), ErrorSeverity::Info);

        let err = EngineError::from(PlanError::from(InvariantViolation::new(
            "mutate_block",
            "block 0 already started",
        )));
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_error_retryable() {
        let err = EngineError::Collaborator(CollaboratorError::Unavailable {
            collaborator: "profile-store".to_string(),
            reason: "timeout".to_string(),
        });
        assert!(err.is_retryable());

        let err = EngineError::InvalidActivity(InvalidActivity {
            activity_id: Some("a1".to_string()),
            reason: RejectionReason::NonPositiveDuration,
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_user_messages() {
        let err = EngineError::Load(LoadError::MissingThreshold {
            activity_id: "a1".to_string(),
            metrics: vec![MetricType::Power],
        });
        assert!(err.user_message().contains("power"));
        assert_eq!(err.kind(), ErrorKind::MissingThreshold);
    }
}
