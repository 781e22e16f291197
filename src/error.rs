//! Error types for mastery tracking
//!
//! Library modules return [`TrackError`]; the CLI wraps them in `anyhow`.

use thiserror::Error;

/// Main error type for mastery-track operations
#[derive(Error, Debug)]
pub enum TrackError {
    /// No progress row exists for the learner in this program
    #[error("Learner {user_id} is not enrolled in program {program_id}")]
    NotEnrolled { user_id: i64, program_id: i64 },

    /// The course has no mapping in this program
    #[error("Course {course_id} is not configured for program {program_id}")]
    UnconfiguredCourse { course_id: i64, program_id: i64 },

    #[error("Program not found: {0}")]
    ProgramNotFound(i64),

    #[error("Progress record not found: {0}")]
    ProgressNotFound(i64),

    #[error("Email template not found: {0}")]
    EmailNotFound(i64),

    #[error("Course tags not found: {0}")]
    TagsNotFound(i64),

    /// External enrolment call failed
    #[error("Enrolment in course {course_id} failed: {reason}")]
    Enrolment { course_id: i64, reason: String },

    /// Text-generation service failed or returned non-2xx
    #[error("Text generation failed: {0}")]
    Generation(String),

    /// Mail transport rejected the message
    #[error("Mail delivery failed: {0}")]
    Delivery(String),

    #[error("Invalid path type: {0}")]
    InvalidPath(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid depth-of-knowledge level {0}, expected 1-4")]
    InvalidDokLevel(i64),

    /// Malformed structured reply from the text generator
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for mastery-track operations
pub type Result<T> = std::result::Result<T, TrackError>;

impl TrackError {
    /// True for failures caused by a collaborator outside our database
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            TrackError::Enrolment { .. } | TrackError::Generation(_) | TrackError::Delivery(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackError::NotEnrolled { user_id: 7, program_id: 3 };
        assert_eq!(err.to_string(), "Learner 7 is not enrolled in program 3");

        let err = TrackError::UnconfiguredCourse { course_id: 12, program_id: 3 };
        assert_eq!(err.to_string(), "Course 12 is not configured for program 3");
    }

    #[test]
    fn test_external_classification() {
        assert!(TrackError::Generation("HTTP 500".into()).is_external());
        assert!(TrackError::Delivery("smtp down".into()).is_external());
        assert!(!TrackError::ProgramNotFound(1).is_external());
    }
}
