//! Individual and group progress reports

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::error::Result;
use crate::host::{Directory, Learner};
use crate::storage::{self, Program, Progress};
use crate::tracking::PathType;

/// Points earned under one topic or tactic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    pub id: i64,
    pub name: String,
    pub points: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseResult {
    pub course_id: i64,
    pub course_name: Option<String>,
    pub points: i64,
    pub grade: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndividualReport {
    pub program: Program,
    pub progress: Progress,
    pub learner: Option<Learner>,
    pub topics: Vec<Breakdown>,
    pub tactics: Vec<Breakdown>,
    pub courses: Vec<CourseResult>,
    /// Share of the mastery goal reached, may exceed 100
    pub percent_complete: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStat {
    pub id: i64,
    pub name: String,
    pub learners: i64,
    pub avg_points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathShare {
    pub path: PathType,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatistics {
    pub program: Program,
    pub total_learners: i64,
    pub mastered: i64,
    pub mastery_rate: f64,
    pub avg_points: f64,
    pub min_points: i64,
    pub max_points: i64,
    pub topics: Vec<TopicStat>,
    pub paths: Vec<PathShare>,
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { round2(part / whole * 100.0) } else { 0.0 }
}

/// Report for one learner; `None` when they are not in the program
pub fn individual_report(
    conn: &Connection,
    directory: &dyn Directory,
    user_id: i64,
    program_id: i64,
) -> Result<Option<IndividualReport>> {
    let Some(progress) = storage::find_progress(conn, program_id, user_id)? else {
        return Ok(None);
    };
    let program = storage::get_program(conn, program_id)?;

    let topics = breakdown(
        conn,
        r#"
        SELECT t.id, t.name, SUM(up.points_earned)
        FROM user_points up JOIN topics t ON up.topic_id = t.id
        WHERE up.progress_id = ?1 AND up.completed = 1
        GROUP BY t.id, t.name ORDER BY t.id
        "#,
        progress.id,
    )?;
    let tactics = breakdown(
        conn,
        r#"
        SELECT tc.id, tc.name, SUM(up.points_earned)
        FROM user_points up JOIN tactics tc ON up.tactic_id = tc.id
        WHERE up.progress_id = ?1 AND up.completed = 1
        GROUP BY tc.id, tc.name ORDER BY tc.id
        "#,
        progress.id,
    )?;

    let mut courses = Vec::new();
    for record in storage::list_point_records(conn, progress.id)? {
        let course_name = directory.course(record.course_id)?.map(|c| c.fullname);
        courses.push(CourseResult {
            course_id: record.course_id,
            course_name,
            points: record.points_earned,
            grade: round2(record.grade),
            completed_at: record.time_completed,
        });
    }

    // A goal of zero is met by any total
    let percent_complete = if program.mastery_goal > 0 {
        percent(progress.total_points as f64, program.mastery_goal as f64)
    } else {
        100.0
    };

    Ok(Some(IndividualReport {
        learner: directory.user(user_id)?,
        program,
        progress,
        topics,
        tactics,
        courses,
        percent_complete,
    }))
}

fn breakdown(conn: &Connection, sql: &str, progress_id: i64) -> Result<Vec<Breakdown>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![progress_id], |row| {
        Ok(Breakdown {
            id: row.get(0)?,
            name: row.get(1)?,
            points: row.get(2)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Aggregate statistics over every learner in a program
pub fn group_statistics(conn: &Connection, program_id: i64) -> Result<GroupStatistics> {
    let program = storage::get_program(conn, program_id)?;

    let (total, mastered, avg, min, max): (i64, i64, Option<f64>, Option<i64>, Option<i64>) = conn
        .query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN mastery_achieved = 1 THEN 1 ELSE 0 END), 0),
                   AVG(total_points), MIN(total_points), MAX(total_points)
            FROM progress WHERE program_id = ?1
            "#,
            params![program_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

    let mut stmt = conn.prepare(
        r#"
        SELECT t.id, t.name, COUNT(DISTINCT up.progress_id), AVG(up.points_earned)
        FROM user_points up
        JOIN progress p ON up.progress_id = p.id
        JOIN topics t ON up.topic_id = t.id
        WHERE p.program_id = ?1 AND up.completed = 1
        GROUP BY t.id, t.name ORDER BY t.id
        "#,
    )?;
    let topics = stmt
        .query_map(params![program_id], |row| {
            Ok(TopicStat {
                id: row.get(0)?,
                name: row.get(1)?,
                learners: row.get(2)?,
                avg_points: round2(row.get(3)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut paths = Vec::with_capacity(PathType::ALL.len());
    for path in PathType::ALL {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM progress WHERE program_id = ?1 AND current_path = ?2",
            params![program_id, path],
            |row| row.get(0),
        )?;
        paths.push(PathShare {
            path,
            count,
            percentage: percent(count as f64, total as f64),
        });
    }

    Ok(GroupStatistics {
        program,
        total_learners: total,
        mastered,
        mastery_rate: percent(mastered as f64, total as f64),
        avg_points: round2(avg.unwrap_or(0.0)),
        min_points: min.unwrap_or(0),
        max_points: max.unwrap_or(0),
        topics,
        paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnrolmentCheck;
    use crate::host::fakes::{MemoryHost, RecordingEnrolment};
    use crate::storage::{NewCourseMapping, NewProgram, open_in_memory};
    use crate::tracking::ProgressTracker;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Connection, i64) {
        let mut conn = open_in_memory().unwrap();
        let program = storage::insert_program(&conn, &NewProgram::new("P", now()), now()).unwrap();
        let ransomware = storage::topic_id_by_name(&conn, "Ransomware").unwrap();
        let url = storage::tactic_id_by_name(&conn, "URL Phish").unwrap();

        let mut first = NewCourseMapping::new(1, 9, PathType::Standard);
        first.topic_id = ransomware;
        first.tactic_id = url;
        let mut second = NewCourseMapping::new(2, 6, PathType::Standard);
        second.topic_id = ransomware;
        storage::insert_course_mapping(&conn, program, &first, now()).unwrap();
        storage::insert_course_mapping(&conn, program, &second, now()).unwrap();

        for user in [7, 8, 9] {
            storage::insert_progress(&conn, program, user, now()).unwrap();
        }

        let enrolment = RecordingEnrolment::default();
        let mut tracker = ProgressTracker::new(&mut conn, &enrolment, EnrolmentCheck::PerCourse);
        tracker.record_completion_at(7, program, 1, 88.123, now(), now()).unwrap();
        tracker.record_completion_at(7, program, 2, 75.0, now(), now()).unwrap();
        tracker.record_completion_at(8, program, 1, 40.0, now(), now()).unwrap();
        (conn, program)
    }

    #[test]
    fn test_individual_report() {
        let (conn, program) = setup();
        let mut host = MemoryHost::default();
        host.add_user(7, "Grace", "Hopper");
        host.add_course(1, "Spotting Ransomware");

        let report = individual_report(&conn, &host, 7, program).unwrap().unwrap();
        assert_eq!(report.progress.total_points, 15);
        assert_eq!(report.percent_complete, 55.56);
        assert_eq!(report.topics.len(), 1);
        assert_eq!(report.topics[0].name, "Ransomware");
        assert_eq!(report.topics[0].points, 15);
        assert_eq!(report.tactics.len(), 1);
        assert_eq!(report.tactics[0].points, 9);
        assert_eq!(report.courses.len(), 2);
        assert_eq!(report.courses[0].grade, 88.12);
        assert_eq!(report.learner.unwrap().firstname, "Grace");

        assert!(individual_report(&conn, &host, 99, program).unwrap().is_none());
    }

    #[test]
    fn test_group_statistics() {
        let (conn, program) = setup();
        let stats = group_statistics(&conn, program).unwrap();

        assert_eq!(stats.total_learners, 3);
        assert_eq!(stats.mastered, 0);
        assert_eq!(stats.min_points, 0);
        assert_eq!(stats.max_points, 15);
        assert_eq!(stats.avg_points, 8.0);

        assert_eq!(stats.topics.len(), 1);
        assert_eq!(stats.topics[0].learners, 2);
        assert_eq!(stats.topics[0].avg_points, 8.0);

        let remedial = stats.paths.iter().find(|p| p.path == PathType::Remedial).unwrap();
        assert_eq!(remedial.count, 1);
        assert_eq!(remedial.percentage, 33.33);
    }

    #[test]
    fn test_group_statistics_empty_program() {
        let conn = open_in_memory().unwrap();
        let program = storage::insert_program(&conn, &NewProgram::new("Empty", now()), now()).unwrap();
        let stats = group_statistics(&conn, program).unwrap();
        assert_eq!(stats.total_learners, 0);
        assert_eq!(stats.mastery_rate, 0.0);
        assert!(stats.paths.iter().all(|p| p.count == 0 && p.percentage == 0.0));
    }
}
