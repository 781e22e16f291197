//! Periodic tracking sweeps
//!
//! Both sweeps isolate failures per learner: one bad row is logged and
//! counted, and the sweep moves on. Re-running either sweep is safe.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

use super::{PathChange, PathSelector, ProgressTracker};
use crate::config::PathConfig;
use crate::error::Result;
use crate::host::{CompletionSource, CourseEnrolment, HostCompletion};
use crate::storage::{self, Program};

/// Counts from one sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// New course enrolments caused by path changes
    pub enrolled: usize,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined {}, changed {}, unchanged {}, skipped {}, failed {}, enrolled {}",
            self.examined, self.changed, self.unchanged, self.skipped, self.failed, self.enrolled
        )
    }
}

enum Step {
    Recorded(PathChange),
    AlreadyRecorded,
    NotInProgram,
}

/// Pull host completions for every mapped course of every active program
/// and record the ones not seen yet
///
/// A completion without a host grade counts as grade 0. Point records keep
/// the host's completion time; everything else is stamped with `now`.
pub fn sweep_progress(
    conn: &mut Connection,
    source: &dyn CompletionSource,
    enrolment: &dyn CourseEnrolment,
    config: &PathConfig,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for program in storage::list_programs(conn, true)? {
        let courses: BTreeSet<i64> = storage::list_course_mappings(conn, program.id, None)?
            .into_iter()
            .map(|m| m.course_id)
            .collect();

        for course_id in courses {
            let completions = match source.completions(course_id) {
                Ok(completions) => completions,
                Err(e) => {
                    warn!("Could not read completions for course {}: {}", course_id, e);
                    report.failed += 1;
                    continue;
                }
            };

            for completion in completions {
                match sweep_completion(conn, enrolment, config, &program, &completion, now) {
                    Ok(Step::Recorded(change)) => {
                        report.examined += 1;
                        report.changed += 1;
                        if let PathChange::Changed { enrolment, .. } = change {
                            report.enrolled += enrolment.enrolled;
                        }
                    }
                    Ok(Step::AlreadyRecorded) => {
                        report.examined += 1;
                        report.unchanged += 1;
                    }
                    Ok(Step::NotInProgram) => report.skipped += 1,
                    Err(e) => {
                        warn!(
                            "Failed to record completion of course {} by user {}: {}",
                            completion.course_id, completion.user_id, e
                        );
                        report.examined += 1;
                        report.failed += 1;
                    }
                }
            }
        }
    }

    info!("Progress sweep: {}", report);
    Ok(report)
}

fn sweep_completion(
    conn: &mut Connection,
    enrolment: &dyn CourseEnrolment,
    config: &PathConfig,
    program: &Program,
    completion: &HostCompletion,
    now: DateTime<Utc>,
) -> Result<Step> {
    let Some(progress) = storage::find_progress(conn, program.id, completion.user_id)? else {
        return Ok(Step::NotInProgram);
    };

    let grade = completion.grade.unwrap_or(0.0);
    if let Some(record) = storage::find_point_record(conn, progress.id, completion.course_id)? {
        if record.completed
            && record.grade == grade
            && record.time_completed == Some(completion.completed_at)
        {
            return Ok(Step::AlreadyRecorded);
        }
    }

    let outcome = ProgressTracker::new(conn, enrolment, config.enrolment_check).record_completion_at(
        completion.user_id,
        program.id,
        completion.course_id,
        grade,
        completion.completed_at,
        now,
    )?;
    Ok(Step::Recorded(outcome.path))
}

/// Re-evaluate every learner in an active program on their trailing window
pub fn sweep_paths(
    conn: &mut Connection,
    enrolment: &dyn CourseEnrolment,
    config: &PathConfig,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let candidates = storage::list_sweep_candidates(conn, config.skip_mastered)?;
    debug!("Path sweep over {} learners", candidates.len());

    for progress in candidates {
        report.examined += 1;
        let result = PathSelector::new(conn, enrolment, config.enrolment_check).evaluate_window(
            &progress,
            config.window_days,
            now,
        );

        match result {
            Ok(PathChange::NotApplicable) => report.skipped += 1,
            Ok(PathChange::Unchanged(_)) => report.unchanged += 1,
            Ok(PathChange::Changed { enrolment, .. }) => {
                report.changed += 1;
                report.enrolled += enrolment.enrolled;
            }
            Err(e) => {
                warn!(
                    "Path evaluation failed for user {} in program {}: {}",
                    progress.user_id, progress.program_id, e
                );
                report.failed += 1;
            }
        }
    }

    info!("Path sweep: {}", report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackError;
    use crate::host::fakes::{MemoryHost, RecordingEnrolment};
    use crate::storage::{NewCourseMapping, NewProgram, PointRecordWrite, open_in_memory};
    use crate::tracking::PathType;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 11, 6, 0, 0).unwrap()
    }

    fn setup(users: &[i64]) -> (Connection, i64) {
        let conn = open_in_memory().unwrap();
        let start = now() - Duration::days(20);
        let program = storage::insert_program(&conn, &NewProgram::new("P", start), start).unwrap();
        for (course, points, path) in [
            (1, 10, PathType::Standard),
            (2, 20, PathType::Standard),
            (11, 5, PathType::Remedial),
            (21, 5, PathType::Challenge),
        ] {
            storage::insert_course_mapping(&conn, program, &NewCourseMapping::new(course, points, path), start)
                .unwrap();
        }
        for user in users {
            storage::insert_progress(&conn, program, *user, start).unwrap();
        }
        (conn, program)
    }

    fn host_completion(user_id: i64, course_id: i64, grade: Option<f64>) -> HostCompletion {
        HostCompletion {
            user_id,
            course_id,
            completed_at: now() - Duration::days(1),
            grade,
        }
    }

    #[test]
    fn test_progress_sweep_records_new_completions_once() {
        let (mut conn, program) = setup(&[7, 8]);
        let mut host = MemoryHost::default();
        host.completions = vec![
            host_completion(7, 1, Some(85.0)),
            host_completion(8, 2, None),
            host_completion(9, 1, Some(90.0)),
        ];
        let enrolment = RecordingEnrolment::default();
        let config = PathConfig::default();

        let report = sweep_progress(&mut conn, &host, &enrolment, &config, now()).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);

        let seven = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(seven.total_points, 10);
        assert_eq!(seven.current_path, PathType::Standard);

        let eight = storage::find_progress(&conn, program, 8).unwrap().unwrap();
        assert_eq!(eight.total_points, 20);
        assert_eq!(eight.current_path, PathType::Remedial);

        let again = sweep_progress(&mut conn, &host, &enrolment, &config, now()).unwrap();
        assert_eq!(again.changed, 0);
        assert_eq!(again.unchanged, 2);
    }

    #[test]
    fn test_progress_sweep_picks_up_regrades() {
        let (mut conn, program) = setup(&[7]);
        let mut host = MemoryHost::default();
        host.completions = vec![host_completion(7, 1, Some(85.0))];
        let enrolment = RecordingEnrolment::default();
        let config = PathConfig::default();
        sweep_progress(&mut conn, &host, &enrolment, &config, now()).unwrap();

        host.completions = vec![host_completion(7, 1, Some(97.0))];
        let report = sweep_progress(&mut conn, &host, &enrolment, &config, now()).unwrap();
        assert_eq!(report.changed, 1);

        let progress = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(progress.total_points, 10);
        assert_eq!(progress.current_path, PathType::Challenge);
    }

    struct FlakySource {
        inner: MemoryHost,
    }

    impl CompletionSource for FlakySource {
        fn completions(&self, course_id: i64) -> Result<Vec<HostCompletion>> {
            if course_id == 1 {
                return Err(TrackError::Enrolment {
                    course_id,
                    reason: "host unavailable".to_string(),
                });
            }
            self.inner.completions(course_id)
        }
    }

    #[test]
    fn test_progress_sweep_continues_past_failures() {
        let (mut conn, program) = setup(&[7]);
        let mut inner = MemoryHost::default();
        inner.completions = vec![host_completion(7, 1, Some(85.0)), host_completion(7, 2, Some(85.0))];
        let source = FlakySource { inner };
        let enrolment = RecordingEnrolment::default();

        let report = sweep_progress(&mut conn, &source, &enrolment, &PathConfig::default(), now()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.changed, 1);

        let progress = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(progress.total_points, 20);
    }

    fn completed(conn: &Connection, program: i64, user: i64, course: i64, grade: f64, days_ago: i64) {
        let progress = storage::find_progress(conn, program, user).unwrap().unwrap();
        storage::upsert_point_record(
            conn,
            &PointRecordWrite {
                progress_id: progress.id,
                course_id: course,
                topic_id: None,
                tactic_id: None,
                points_earned: 10,
                grade,
                time_completed: now() - Duration::days(days_ago),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_late_host_completion_keeps_timestamps_ordered() {
        let (mut conn, program) = setup(&[]);
        let start = now() - Duration::days(20);
        storage::insert_course_mapping(&conn, program, &NewCourseMapping::new(3, 30, PathType::Standard), start)
            .unwrap();
        let created = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        storage::insert_progress(&conn, program, 7, created).unwrap();

        let completed_at = created - Duration::days(40);
        let mut host = MemoryHost::default();
        host.completions = vec![HostCompletion {
            user_id: 7,
            course_id: 3,
            completed_at,
            grade: Some(80.0),
        }];
        let enrolment = RecordingEnrolment::default();

        let report = sweep_progress(&mut conn, &host, &enrolment, &PathConfig::default(), now()).unwrap();
        assert_eq!(report.changed, 1);

        let progress = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert!(progress.time_modified >= progress.time_created);
        assert_eq!(progress.time_modified, now());
        assert!(progress.mastery_achieved);
        assert_eq!(progress.mastery_date, Some(now()));

        let records = storage::list_point_records(&conn, progress.id).unwrap();
        assert_eq!(records[0].time_completed, Some(completed_at));

        // The stored completion time still deduplicates the next sweep
        let again = sweep_progress(&mut conn, &host, &enrolment, &PathConfig::default(), now()).unwrap();
        assert_eq!(again.unchanged, 1);
    }

    fn mark_mastered(conn: &Connection, program: i64, user: i64) {
        let progress = storage::find_progress(conn, program, user).unwrap().unwrap();
        storage::write_total(conn, progress.id, 40, Some(now()), now()).unwrap();
    }

    #[test]
    fn test_path_sweep() {
        let (mut conn, program) = setup(&[7, 8, 9]);
        completed(&conn, program, 7, 1, 50.0, 1);
        completed(&conn, program, 7, 2, 60.0, 2);
        completed(&conn, program, 8, 1, 10.0, 30);
        completed(&conn, program, 9, 1, 99.0, 1);
        mark_mastered(&conn, program, 9);

        let enrolment = RecordingEnrolment::default();
        let config = PathConfig::default();
        assert!(config.skip_mastered);
        let report = sweep_paths(&mut conn, &enrolment, &config, now()).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.enrolled, 1);
        assert_eq!(enrolment.calls(), vec![(11, 7)]);

        let seven = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(seven.current_path, PathType::Remedial);
        let eight = storage::find_progress(&conn, program, 8).unwrap().unwrap();
        assert_eq!(eight.current_path, PathType::Standard);
        // Mastered learners are left alone
        assert_eq!(
            storage::find_progress(&conn, program, 9).unwrap().unwrap().current_path,
            PathType::Standard
        );

        let again = sweep_paths(&mut conn, &enrolment, &config, now()).unwrap();
        assert_eq!(again.changed, 0);
        assert_eq!(again.unchanged, 1);
    }

    #[test]
    fn test_path_sweep_can_include_mastered() {
        let (mut conn, program) = setup(&[7, 9]);
        completed(&conn, program, 9, 1, 99.0, 1);
        mark_mastered(&conn, program, 9);

        let enrolment = RecordingEnrolment::default();
        let config = PathConfig {
            skip_mastered: false,
            ..Default::default()
        };
        let report = sweep_paths(&mut conn, &enrolment, &config, now()).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(enrolment.calls(), vec![(21, 9)]);
        assert_eq!(
            storage::find_progress(&conn, program, 9).unwrap().unwrap().current_path,
            PathType::Challenge
        );
    }

    #[test]
    fn test_path_sweep_continues_past_failures() {
        let (mut conn, program) = setup(&[7, 8]);
        completed(&conn, program, 7, 1, 40.0, 1);
        completed(&conn, program, 8, 1, 45.0, 1);
        conn.execute_batch(
            "CREATE TRIGGER progress_locked BEFORE UPDATE ON progress WHEN OLD.user_id = 7
             BEGIN SELECT RAISE(ABORT, 'progress row locked'); END;",
        )
        .unwrap();

        let enrolment = RecordingEnrolment::default();
        let report = sweep_paths(&mut conn, &enrolment, &PathConfig::default(), now()).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.changed, 1);
        assert_eq!(enrolment.calls(), vec![(11, 8)]);

        let seven = storage::find_progress(&conn, program, 7).unwrap().unwrap();
        assert_eq!(seven.current_path, PathType::Standard);
        let eight = storage::find_progress(&conn, program, 8).unwrap().unwrap();
        assert_eq!(eight.current_path, PathType::Remedial);
    }
}
