//! Progress aggregation
//!
//! The only writer of point records and progress totals. Totals are always
//! recomputed from `user_points`, never incremented.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use super::selector::{PathChange, PathSelector};
use crate::config::EnrolmentCheck;
use crate::error::{Result, TrackError};
use crate::host::CourseEnrolment;
use crate::storage::{self, PointRecordWrite};

/// Result of recording one course completion
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub progress_id: i64,
    pub total_points: i64,
    pub mastery_achieved: bool,
    /// Mastery was reached by this completion
    pub newly_mastered: bool,
    pub path: PathChange,
}

/// Recomputed total and mastery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recomputed {
    pub total_points: i64,
    pub mastery_achieved: bool,
    pub newly_mastered: bool,
}

pub struct ProgressTracker<'a> {
    conn: &'a mut Connection,
    enrolment: &'a dyn CourseEnrolment,
    check: EnrolmentCheck,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(
        conn: &'a mut Connection,
        enrolment: &'a dyn CourseEnrolment,
        check: EnrolmentCheck,
    ) -> Self {
        Self { conn, enrolment, check }
    }

    /// Record a completion happening now
    pub fn record_completion(
        &mut self,
        user_id: i64,
        program_id: i64,
        course_id: i64,
        grade: f64,
    ) -> Result<CompletionOutcome> {
        let now = Utc::now();
        self.record_completion_at(user_id, program_id, course_id, grade, now, now)
    }

    /// Record a completion that happened at `completed_at`, observed at `now`
    ///
    /// Only the point record carries `completed_at`. The progress row, the
    /// mastery date and any path change are stamped with `now`. Nothing is
    /// written when the learner is not enrolled or the course is not mapped
    /// in the program.
    pub fn record_completion_at(
        &mut self,
        user_id: i64,
        program_id: i64,
        course_id: i64,
        grade: f64,
        completed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let progress = storage::find_progress(&tx, program_id, user_id)?
            .ok_or(TrackError::NotEnrolled { user_id, program_id })?;
        let mapping = storage::find_course_mapping(&tx, program_id, course_id)?
            .ok_or(TrackError::UnconfiguredCourse { course_id, program_id })?;

        storage::upsert_point_record(
            &tx,
            &PointRecordWrite {
                progress_id: progress.id,
                course_id,
                topic_id: mapping.topic_id,
                tactic_id: mapping.tactic_id,
                points_earned: mapping.points,
                grade,
                time_completed: completed_at,
            },
        )?;
        let recomputed = recompute_in(&tx, progress.id, now)?;
        tx.commit()?;

        info!(
            "User {} completed course {} in program {}: {} points (grade {:.1})",
            user_id, course_id, program_id, mapping.points, grade
        );
        if recomputed.newly_mastered {
            info!("User {} achieved mastery in program {}", user_id, program_id);
        }

        let path = PathSelector::new(&mut *self.conn, self.enrolment, self.check)
            .evaluate_and_apply(user_id, program_id, grade, now)?;

        Ok(CompletionOutcome {
            progress_id: progress.id,
            total_points: recomputed.total_points,
            mastery_achieved: recomputed.mastery_achieved,
            newly_mastered: recomputed.newly_mastered,
            path,
        })
    }

    /// Recompute a progress row's total from its point records
    ///
    /// Safe to call any number of times.
    pub fn recompute_total(&mut self, progress_id: i64, now: DateTime<Utc>) -> Result<Recomputed> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let recomputed = recompute_in(&tx, progress_id, now)?;
        tx.commit()?;
        Ok(recomputed)
    }
}

/// Recompute inside a caller's transaction
fn recompute_in(conn: &Connection, progress_id: i64, now: DateTime<Utc>) -> Result<Recomputed> {
    let progress = storage::find_progress_by_id(conn, progress_id)?
        .ok_or(TrackError::ProgressNotFound(progress_id))?;
    let program = storage::get_program(conn, progress.program_id)?;

    let total = storage::sum_completed_points(conn, progress_id)?;
    let reached = (total >= program.mastery_goal && !progress.mastery_achieved).then_some(now);
    storage::write_total(conn, progress_id, total, reached, now)?;

    debug!(
        "Progress {} total {} / goal {}",
        progress_id, total, program.mastery_goal
    );

    Ok(Recomputed {
        total_points: total,
        mastery_achieved: progress.mastery_achieved || reached.is_some(),
        newly_mastered: reached.is_some(),
    })
}
