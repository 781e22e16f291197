//! Adaptive path selection and path enrolment

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{PathType, classify};
use crate::config::EnrolmentCheck;
use crate::error::Result;
use crate::host::CourseEnrolment;
use crate::storage::{self, Progress};

/// Courses enrolled by one path change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrolmentSummary {
    /// New enrolments made
    pub enrolled: usize,
    /// Enrolments the host refused or failed
    pub failed: usize,
}

/// What a path evaluation did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathChange {
    /// No progress row, or an empty grade window
    NotApplicable,
    Unchanged(PathType),
    Changed {
        from: PathType,
        to: PathType,
        enrolment: EnrolmentSummary,
    },
}

impl PathChange {
    pub fn is_changed(&self) -> bool {
        matches!(self, PathChange::Changed { .. })
    }
}

pub struct PathSelector<'a> {
    conn: &'a mut Connection,
    enrolment: &'a dyn CourseEnrolment,
    check: EnrolmentCheck,
}

impl<'a> PathSelector<'a> {
    pub fn new(
        conn: &'a mut Connection,
        enrolment: &'a dyn CourseEnrolment,
        check: EnrolmentCheck,
    ) -> Self {
        Self { conn, enrolment, check }
    }

    /// Classify a single grade and move the learner if the path differs
    pub fn evaluate_and_apply(
        &mut self,
        user_id: i64,
        program_id: i64,
        grade: f64,
        now: DateTime<Utc>,
    ) -> Result<PathChange> {
        self.apply(user_id, program_id, classify(grade), now)
    }

    /// Classify the mean grade of completions in the trailing window
    ///
    /// An empty window skips the learner: no write and no enrolment.
    pub fn evaluate_window(
        &mut self,
        progress: &Progress,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<PathChange> {
        let since = now - Duration::days(window_days);
        let Some(average) = storage::window_average_grade(self.conn, progress.id, since)? else {
            debug!(
                "No completions for user {} in program {} since {}",
                progress.user_id, progress.program_id, since
            );
            return Ok(PathChange::NotApplicable);
        };

        debug!(
            "User {} window average {:.2} over {} days",
            progress.user_id, average, window_days
        );
        self.apply(progress.user_id, progress.program_id, classify(average), now)
    }

    fn apply(
        &mut self,
        user_id: i64,
        program_id: i64,
        new_path: PathType,
        now: DateTime<Utc>,
    ) -> Result<PathChange> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(progress) = storage::find_progress(&tx, program_id, user_id)? else {
            return Ok(PathChange::NotApplicable);
        };
        let from = progress.current_path;
        if from == new_path {
            return Ok(PathChange::Unchanged(from));
        }

        storage::set_current_path(&tx, progress.id, new_path, now)?;
        tx.commit()?;

        info!(
            "User {} in program {} moved from {} to {} path",
            user_id, program_id, from, new_path
        );

        let enrolment = self.enroll_in_path(user_id, program_id, new_path)?;
        Ok(PathChange::Changed { from, to: new_path, enrolment })
    }

    /// Enrol the learner in every course of a path they are not yet in
    ///
    /// Additive: earlier enrolments are never removed. A refused or failed
    /// enrolment is counted and the next course is tried.
    pub fn enroll_in_path(
        &mut self,
        user_id: i64,
        program_id: i64,
        path: PathType,
    ) -> Result<EnrolmentSummary> {
        let mappings = storage::list_course_mappings(self.conn, program_id, Some(path))?;
        let mut summary = EnrolmentSummary::default();

        for mapping in mappings {
            let already = match self.check {
                EnrolmentCheck::PerCourse => self.enrolment.is_enrolled(user_id, mapping.course_id),
                EnrolmentCheck::AnyCourse => self.enrolment.has_any_enrolment(user_id),
            };

            match already {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("Enrolment check for user {} failed: {}", user_id, e);
                    summary.failed += 1;
                    continue;
                }
            }

            match self.enrolment.enrol(mapping.course_id, user_id) {
                Ok(true) => summary.enrolled += 1,
                Ok(false) => {
                    warn!(
                        "Host refused enrolment of user {} in course {}",
                        user_id, mapping.course_id
                    );
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(
                        "Enrolment of user {} in course {} failed: {}",
                        user_id, mapping.course_id, e
                    );
                    summary.failed += 1;
                }
            }
        }

        debug!(
            "Path {} enrolment for user {}: {} new, {} failed",
            path, user_id, summary.enrolled, summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fakes::RecordingEnrolment;
    use crate::storage::{NewCourseMapping, NewProgram, PointRecordWrite, open_in_memory};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 20, 10, 0, 0).unwrap()
    }

    fn setup() -> (Connection, i64, Progress) {
        let conn = open_in_memory().unwrap();
        let start = now() - Duration::days(30);
        let program = storage::insert_program(&conn, &NewProgram::new("P", start), start).unwrap();

        for (course, path) in [
            (1, PathType::Standard),
            (11, PathType::Remedial),
            (12, PathType::Remedial),
            (21, PathType::Challenge),
        ] {
            storage::insert_course_mapping(&conn, program, &NewCourseMapping::new(course, 5, path), start)
                .unwrap();
        }
        storage::insert_progress(&conn, program, 7, start).unwrap();
        let progress = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        (conn, program, progress)
    }

    fn completed(conn: &Connection, progress_id: i64, course_id: i64, grade: f64, at: DateTime<Utc>) {
        storage::upsert_point_record(
            conn,
            &PointRecordWrite {
                progress_id,
                course_id,
                topic_id: None,
                tactic_id: None,
                points_earned: 5,
                grade,
                time_completed: at,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_same_path_is_a_no_op() {
        let (mut conn, program, progress) = setup();
        let enrolment = RecordingEnrolment::default();

        let change = PathSelector::new(&mut conn, &enrolment, EnrolmentCheck::PerCourse)
            .evaluate_and_apply(7, program, 80.0, now())
            .unwrap();
        assert_eq!(change, PathChange::Unchanged(PathType::Standard));
        assert!(enrolment.calls().is_empty());
        assert_eq!(*enrolment.check_calls.borrow(), 0);

        let after = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(after.time_modified, progress.time_modified);
    }

    #[test]
    fn test_missing_progress_is_not_applicable() {
        let (mut conn, program, _) = setup();
        let enrolment = RecordingEnrolment::default();
        let change = PathSelector::new(&mut conn, &enrolment, EnrolmentCheck::PerCourse)
            .evaluate_and_apply(404, program, 10.0, now())
            .unwrap();
        assert_eq!(change, PathChange::NotApplicable);
    }

    #[test]
    fn test_change_enrols_path_courses() {
        let (mut conn, program, _) = setup();
        let enrolment = RecordingEnrolment::with_existing(&[(7, 12)]);

        let change = PathSelector::new(&mut conn, &enrolment, EnrolmentCheck::PerCourse)
            .evaluate_and_apply(7, program, 40.0, now())
            .unwrap();
        assert_eq!(
            change,
            PathChange::Changed {
                from: PathType::Standard,
                to: PathType::Remedial,
                enrolment: EnrolmentSummary { enrolled: 1, failed: 0 },
            }
        );
        assert_eq!(enrolment.calls(), vec![(11, 7)]);

        let progress = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(progress.current_path, PathType::Remedial);
        assert_eq!(progress.time_modified, now());
    }

    #[test]
    fn test_any_course_check_skips_after_first_enrolment() {
        let (mut conn, program, _) = setup();
        let enrolment = RecordingEnrolment::default();

        let summary = PathSelector::new(&mut conn, &enrolment, EnrolmentCheck::AnyCourse)
            .enroll_in_path(7, program, PathType::Remedial)
            .unwrap();
        assert_eq!(summary.enrolled, 1);
        assert_eq!(enrolment.calls(), vec![(11, 7)]);
    }

    #[test]
    fn test_refused_enrolment_is_counted() {
        let (mut conn, program, _) = setup();
        let mut enrolment = RecordingEnrolment::default();
        enrolment.refuse.insert(11);

        let summary = PathSelector::new(&mut conn, &enrolment, EnrolmentCheck::PerCourse)
            .enroll_in_path(7, program, PathType::Remedial)
            .unwrap();
        assert_eq!(summary, EnrolmentSummary { enrolled: 1, failed: 1 });
        assert_eq!(enrolment.calls(), vec![(11, 7), (12, 7)]);
    }

    #[test]
    fn test_window_average_moves_challenge_to_standard() {
        let (mut conn, _, progress) = setup();
        completed(&conn, progress.id, 1, 60.0, now() - Duration::days(3));
        completed(&conn, progress.id, 11, 96.0, now() - Duration::days(2));
        completed(&conn, progress.id, 21, 80.0, now() - Duration::days(1));
        storage::set_current_path(&conn, progress.id, PathType::Challenge, now()).unwrap();

        let enrolment = RecordingEnrolment::with_existing(&[(7, 1)]);
        let change = PathSelector::new(&mut conn, &enrolment, EnrolmentCheck::PerCourse)
            .evaluate_window(&progress, 7, now())
            .unwrap();
        assert_eq!(
            change,
            PathChange::Changed {
                from: PathType::Challenge,
                to: PathType::Standard,
                enrolment: EnrolmentSummary::default(),
            }
        );
    }

    #[test]
    fn test_empty_window_skips_learner() {
        let (mut conn, program, progress) = setup();
        completed(&conn, progress.id, 1, 20.0, now() - Duration::days(8));

        let enrolment = RecordingEnrolment::default();
        let change = PathSelector::new(&mut conn, &enrolment, EnrolmentCheck::PerCourse)
            .evaluate_window(&progress, 7, now())
            .unwrap();
        assert_eq!(change, PathChange::NotApplicable);
        assert!(enrolment.calls().is_empty());

        let after = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(after.current_path, PathType::Standard);
        assert_eq!(after.time_modified, progress.time_modified);
    }
}
