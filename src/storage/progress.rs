//! Progress and point-record rows
//!
//! Only the tracking services write here. `total_points` is derived from
//! `user_points` by [`sum_completed_points`] and written back whole.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use super::{from_ts, to_ts};
use crate::error::Result;
use crate::tracking::PathType;

/// A learner's standing in one program
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub id: i64,
    pub program_id: i64,
    pub user_id: i64,
    pub total_points: i64,
    pub mastery_achieved: bool,
    pub mastery_date: Option<DateTime<Utc>>,
    pub current_path: PathType,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

/// Points earned for one course
#[derive(Debug, Clone, Serialize)]
pub struct PointRecord {
    pub id: i64,
    pub progress_id: i64,
    pub course_id: i64,
    pub topic_id: Option<i64>,
    pub tactic_id: Option<i64>,
    pub points_earned: i64,
    pub grade: f64,
    pub completed: bool,
    pub time_completed: Option<DateTime<Utc>>,
}

/// Values written by a completion upsert
#[derive(Debug, Clone)]
pub struct PointRecordWrite {
    pub progress_id: i64,
    pub course_id: i64,
    pub topic_id: Option<i64>,
    pub tactic_id: Option<i64>,
    pub points_earned: i64,
    pub grade: f64,
    pub time_completed: DateTime<Utc>,
}

const PROGRESS_COLUMNS: &str = "id, program_id, user_id, total_points, mastery_achieved, \
     mastery_date, current_path, time_created, time_modified";

const POINT_COLUMNS: &str = "id, progress_id, course_id, topic_id, tactic_id, points_earned, \
     grade, completed, time_completed";

fn progress_from_row(row: &Row<'_>) -> rusqlite::Result<Progress> {
    Ok(Progress {
        id: row.get(0)?,
        program_id: row.get(1)?,
        user_id: row.get(2)?,
        total_points: row.get(3)?,
        mastery_achieved: row.get(4)?,
        mastery_date: row.get::<_, Option<i64>>(5)?.map(from_ts),
        current_path: row.get(6)?,
        time_created: from_ts(row.get(7)?),
        time_modified: from_ts(row.get(8)?),
    })
}

fn point_from_row(row: &Row<'_>) -> rusqlite::Result<PointRecord> {
    Ok(PointRecord {
        id: row.get(0)?,
        progress_id: row.get(1)?,
        course_id: row.get(2)?,
        topic_id: row.get(3)?,
        tactic_id: row.get(4)?,
        points_earned: row.get(5)?,
        grade: row.get(6)?,
        completed: row.get(7)?,
        time_completed: row.get::<_, Option<i64>>(8)?.map(from_ts),
    })
}

/// Create the progress row for a learner if it does not exist yet
///
/// Returns true when a row was inserted.
pub fn insert_progress(
    conn: &Connection,
    program_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO progress
        (program_id, user_id, total_points, mastery_achieved, current_path, time_created, time_modified)
        VALUES (?1, ?2, 0, 0, ?3, ?4, ?4)
        "#,
        params![program_id, user_id, PathType::default(), to_ts(now)],
    )?;
    Ok(inserted > 0)
}

pub fn find_progress(conn: &Connection, program_id: i64, user_id: i64) -> Result<Option<Progress>> {
    let sql = format!(
        "SELECT {} FROM progress WHERE program_id = ?1 AND user_id = ?2",
        PROGRESS_COLUMNS
    );
    conn.query_row(&sql, params![program_id, user_id], progress_from_row)
        .optional()
        .map_err(Into::into)
}

pub fn find_progress_by_id(conn: &Connection, progress_id: i64) -> Result<Option<Progress>> {
    let sql = format!("SELECT {} FROM progress WHERE id = ?1", PROGRESS_COLUMNS);
    conn.query_row(&sql, params![progress_id], progress_from_row)
        .optional()
        .map_err(Into::into)
}

pub fn list_progress_for_program(conn: &Connection, program_id: i64) -> Result<Vec<Progress>> {
    let sql = format!(
        "SELECT {} FROM progress WHERE program_id = ?1 ORDER BY user_id ASC",
        PROGRESS_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![program_id], progress_from_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Progress rows in active programs, for the path sweep
pub fn list_sweep_candidates(conn: &Connection, skip_mastered: bool) -> Result<Vec<Progress>> {
    let sql = format!(
        "SELECT {} FROM progress \
         WHERE program_id IN (SELECT id FROM programs WHERE active = 1) \
         AND (?1 = 0 OR mastery_achieved = 0) \
         ORDER BY program_id ASC, user_id ASC",
        PROGRESS_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![skip_mastered], progress_from_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn find_point_record(
    conn: &Connection,
    progress_id: i64,
    course_id: i64,
) -> Result<Option<PointRecord>> {
    let sql = format!(
        "SELECT {} FROM user_points WHERE progress_id = ?1 AND course_id = ?2",
        POINT_COLUMNS
    );
    conn.query_row(&sql, params![progress_id, course_id], point_from_row)
        .optional()
        .map_err(Into::into)
}

pub fn list_point_records(conn: &Connection, progress_id: i64) -> Result<Vec<PointRecord>> {
    let sql = format!(
        "SELECT {} FROM user_points WHERE progress_id = ?1 ORDER BY time_completed ASC, id ASC",
        POINT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![progress_id], point_from_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Insert or overwrite the point record for (progress, course)
pub fn upsert_point_record(conn: &Connection, record: &PointRecordWrite) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO user_points
        (progress_id, course_id, topic_id, tactic_id, points_earned, grade, completed, time_completed)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
        ON CONFLICT(progress_id, course_id) DO UPDATE SET
            topic_id = excluded.topic_id,
            tactic_id = excluded.tactic_id,
            points_earned = excluded.points_earned,
            grade = excluded.grade,
            completed = 1,
            time_completed = excluded.time_completed
        "#,
        params![
            record.progress_id,
            record.course_id,
            record.topic_id,
            record.tactic_id,
            record.points_earned,
            record.grade,
            to_ts(record.time_completed),
        ],
    )?;

    let id = conn.query_row(
        "SELECT id FROM user_points WHERE progress_id = ?1 AND course_id = ?2",
        params![record.progress_id, record.course_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Sum of points over completed records; zero when there are none
pub fn sum_completed_points(conn: &Connection, progress_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(points_earned), 0) FROM user_points WHERE progress_id = ?1 AND completed = 1",
        params![progress_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Write a recomputed total; `mastery_reached` stamps the mastery flag and date
pub fn write_total(
    conn: &Connection,
    progress_id: i64,
    total: i64,
    mastery_reached: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    match mastery_reached {
        Some(at) => conn.execute(
            r#"
            UPDATE progress
            SET total_points = ?1, time_modified = ?2, mastery_achieved = 1, mastery_date = ?3
            WHERE id = ?4
            "#,
            params![total, to_ts(now), to_ts(at), progress_id],
        )?,
        None => conn.execute(
            "UPDATE progress SET total_points = ?1, time_modified = ?2 WHERE id = ?3",
            params![total, to_ts(now), progress_id],
        )?,
    };
    Ok(())
}

pub fn set_current_path(
    conn: &Connection,
    progress_id: i64,
    path: PathType,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE progress SET current_path = ?1, time_modified = ?2 WHERE id = ?3",
        params![path, to_ts(now), progress_id],
    )?;
    Ok(())
}

/// Mean grade of completions strictly after `since`; `None` for an empty window
pub fn window_average_grade(
    conn: &Connection,
    progress_id: i64,
    since: DateTime<Utc>,
) -> Result<Option<f64>> {
    conn.query_row(
        r#"
        SELECT AVG(grade) FROM user_points
        WHERE progress_id = ?1 AND completed = 1 AND time_completed > ?2
        "#,
        params![progress_id, to_ts(since)],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_in_memory;
    use crate::storage::programs::{NewProgram, insert_program};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Connection, i64) {
        let conn = open_in_memory().unwrap();
        let program = insert_program(&conn, &NewProgram::new("P", now()), now()).unwrap();
        (conn, program)
    }

    fn write(progress_id: i64, course_id: i64, points: i64, grade: f64, at: DateTime<Utc>) -> PointRecordWrite {
        PointRecordWrite {
            progress_id,
            course_id,
            topic_id: None,
            tactic_id: None,
            points_earned: points,
            grade,
            time_completed: at,
        }
    }

    #[test]
    fn test_insert_progress_is_idempotent() {
        let (conn, program) = setup();
        assert!(insert_progress(&conn, program, 5, now()).unwrap());
        assert!(!insert_progress(&conn, program, 5, now()).unwrap());

        let progress = find_progress(&conn, program, 5).unwrap().unwrap();
        assert_eq!(progress.current_path, PathType::Standard);
        assert_eq!(progress.total_points, 0);
        assert!(!progress.mastery_achieved);
    }

    #[test]
    fn test_upsert_overwrites() {
        let (conn, program) = setup();
        insert_progress(&conn, program, 5, now()).unwrap();
        let progress = find_progress(&conn, program, 5).unwrap().unwrap();

        let first = upsert_point_record(&conn, &write(progress.id, 10, 3, 50.0, now())).unwrap();
        let second = upsert_point_record(&conn, &write(progress.id, 10, 3, 90.0, now())).unwrap();
        assert_eq!(first, second);

        let records = list_point_records(&conn, progress.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].grade, 90.0);
        assert!(records[0].completed);
    }

    #[test]
    fn test_sum_with_no_rows_is_zero() {
        let (conn, program) = setup();
        insert_progress(&conn, program, 5, now()).unwrap();
        let progress = find_progress(&conn, program, 5).unwrap().unwrap();
        assert_eq!(sum_completed_points(&conn, progress.id).unwrap(), 0);
    }

    #[test]
    fn test_window_average() {
        let (conn, program) = setup();
        insert_progress(&conn, program, 5, now()).unwrap();
        let progress = find_progress(&conn, program, 5).unwrap().unwrap();

        upsert_point_record(&conn, &write(progress.id, 1, 1, 40.0, now() - Duration::days(10))).unwrap();
        upsert_point_record(&conn, &write(progress.id, 2, 1, 80.0, now() - Duration::days(2))).unwrap();
        upsert_point_record(&conn, &write(progress.id, 3, 1, 90.0, now() - Duration::days(1))).unwrap();

        let avg = window_average_grade(&conn, progress.id, now() - Duration::days(7)).unwrap();
        assert_eq!(avg, Some(85.0));

        let empty = window_average_grade(&conn, progress.id, now()).unwrap();
        assert_eq!(empty, None);
    }

    #[test]
    fn test_sweep_candidates_respect_active_and_mastery() {
        let (conn, program) = setup();
        let mut inactive = NewProgram::new("Old", now());
        inactive.active = false;
        let inactive = insert_program(&conn, &inactive, now()).unwrap();

        insert_progress(&conn, program, 1, now()).unwrap();
        insert_progress(&conn, program, 2, now()).unwrap();
        insert_progress(&conn, inactive, 3, now()).unwrap();

        let mastered = find_progress(&conn, program, 2).unwrap().unwrap();
        write_total(&conn, mastered.id, 30, Some(now()), now()).unwrap();

        assert_eq!(list_sweep_candidates(&conn, false).unwrap().len(), 2);
        let unmastered = list_sweep_candidates(&conn, true).unwrap();
        assert_eq!(unmastered.len(), 1);
        assert_eq!(unmastered[0].user_id, 1);
    }
}
