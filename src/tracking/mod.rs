//! Progress tracking and adaptive paths
//!
//! Two services work in sequence on the same persisted progress row:
//!
//! - [`ProgressTracker`] records completions, recomputes totals and sets
//!   the mastery flag.
//! - [`PathSelector`] classifies a grade (single event or rolling window)
//!   and re-enrols the learner when their path changes.
//!
//! ## Path thresholds
//! - grade < 70: remedial
//! - 70 <= grade < 95: standard
//! - grade >= 95: challenge

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TrackError;

pub mod aggregator;
pub mod selector;
pub mod sweep;

pub use aggregator::{CompletionOutcome, ProgressTracker};
pub use selector::{EnrolmentSummary, PathChange, PathSelector};
pub use sweep::{SweepReport, sweep_paths, sweep_progress};

/// Grades below this are remedial
pub const REMEDIAL_BELOW: f64 = 70.0;

/// Grades at or above this are challenge
pub const CHALLENGE_FROM: f64 = 95.0;

/// One of the three curated course sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    #[default]
    Standard,
    Remedial,
    Challenge,
}

impl PathType {
    pub const ALL: [PathType; 3] = [PathType::Standard, PathType::Remedial, PathType::Challenge];

    pub fn as_str(&self) -> &'static str {
        match self {
            PathType::Standard => "standard",
            PathType::Remedial => "remedial",
            PathType::Challenge => "challenge",
        }
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathType {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(PathType::Standard),
            "remedial" => Ok(PathType::Remedial),
            "challenge" => Ok(PathType::Challenge),
            other => Err(TrackError::InvalidPath(other.to_string())),
        }
    }
}

impl ToSql for PathType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PathType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: TrackError| FromSqlError::Other(Box::new(e)))
    }
}

/// Map a grade to a path
///
/// Total over f64: out-of-range grades follow the same rule, and NaN falls
/// through both comparisons to standard.
pub fn classify(grade: f64) -> PathType {
    if grade < REMEDIAL_BELOW {
        PathType::Remedial
    } else if grade >= CHALLENGE_FROM {
        PathType::Challenge
    } else {
        PathType::Standard
    }
}
