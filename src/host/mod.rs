//! Host platform collaborators
//!
//! The course-management system owns users, courses, cohorts, enrolments
//! and completion records. The tracking services only see it through these
//! traits, so tests can swap in in-memory fakes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

mod sqlite;

pub use sqlite::SqliteHost;

/// A learner as known to the host directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Learner {
    pub id: i64,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
}

/// Course details used for links, prompts and reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseInfo {
    pub id: i64,
    pub fullname: String,
    pub shortname: String,
    pub summary: String,
}

/// A course completion reported by the host
#[derive(Debug, Clone, PartialEq)]
pub struct HostCompletion {
    pub user_id: i64,
    pub course_id: i64,
    pub completed_at: DateTime<Utc>,
    /// Final course grade; absent when the host has not graded it
    pub grade: Option<f64>,
}

/// External course/enrolment system
pub trait CourseEnrolment {
    /// Whether the learner is enrolled in this specific course
    fn is_enrolled(&self, user_id: i64, course_id: i64) -> Result<bool>;

    /// Whether the learner holds any course enrolment at all
    fn has_any_enrolment(&self, user_id: i64) -> Result<bool>;

    /// Enrol the learner; `Ok(false)` means the host refused
    fn enrol(&self, course_id: i64, user_id: i64) -> Result<bool>;
}

/// Source of course completions for the progress sweep
pub trait CompletionSource {
    fn completions(&self, course_id: i64) -> Result<Vec<HostCompletion>>;
}

/// Read access to users, courses and cohorts
pub trait Directory {
    fn user(&self, user_id: i64) -> Result<Option<Learner>>;

    fn course(&self, course_id: i64) -> Result<Option<CourseInfo>>;

    fn cohort_members(&self, cohort_id: i64) -> Result<Vec<i64>>;
}
