//! Program and course-mapping rows

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use super::{from_ts, to_ts};
use crate::error::{Result, TrackError};
use crate::tracking::PathType;

/// Default point threshold for mastery
pub const DEFAULT_MASTERY_GOAL: i64 = 27;

/// A mastery-track program
#[derive(Debug, Clone, Serialize)]
pub struct Program {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub cohort_id: Option<i64>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub mastery_goal: i64,
    pub active: bool,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

/// Fields for a new program
#[derive(Debug, Clone)]
pub struct NewProgram {
    pub name: String,
    pub description: String,
    pub cohort_id: Option<i64>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub mastery_goal: i64,
    pub active: bool,
}

impl NewProgram {
    pub fn new(name: impl Into<String>, start_date: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            cohort_id: None,
            start_date,
            end_date: None,
            mastery_goal: DEFAULT_MASTERY_GOAL,
            active: true,
        }
    }
}

/// Partial update; `None` keeps the stored value
#[derive(Debug, Clone, Default)]
pub struct ProgramUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cohort_id: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub mastery_goal: Option<i64>,
    pub active: Option<bool>,
}

/// One course in one path of a program
#[derive(Debug, Clone, Serialize)]
pub struct CourseMapping {
    pub id: i64,
    pub program_id: i64,
    pub course_id: i64,
    /// Webb's depth-of-knowledge level, 1-4; informational only
    pub dok_level: i64,
    pub points: i64,
    pub path_type: PathType,
    pub topic_id: Option<i64>,
    pub tactic_id: Option<i64>,
    pub sequence_order: i64,
    pub prerequisite_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewCourseMapping {
    pub course_id: i64,
    pub dok_level: i64,
    pub points: i64,
    pub path_type: PathType,
    pub topic_id: Option<i64>,
    pub tactic_id: Option<i64>,
    pub sequence_order: i64,
    pub prerequisite_score: Option<f64>,
}

impl NewCourseMapping {
    pub fn new(course_id: i64, points: i64, path_type: PathType) -> Self {
        Self {
            course_id,
            dok_level: 1,
            points,
            path_type,
            topic_id: None,
            tactic_id: None,
            sequence_order: 0,
            prerequisite_score: None,
        }
    }
}

const PROGRAM_COLUMNS: &str = "id, name, description, cohort_id, start_date, end_date, \
     mastery_goal, active, time_created, time_modified";

const MAPPING_COLUMNS: &str = "id, program_id, course_id, dok_level, points, path_type, \
     topic_id, tactic_id, sequence_order, prerequisite_score";

fn program_from_row(row: &Row<'_>) -> rusqlite::Result<Program> {
    Ok(Program {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        cohort_id: row.get(3)?,
        start_date: from_ts(row.get(4)?),
        end_date: row.get::<_, Option<i64>>(5)?.map(from_ts),
        mastery_goal: row.get(6)?,
        active: row.get(7)?,
        time_created: from_ts(row.get(8)?),
        time_modified: from_ts(row.get(9)?),
    })
}

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<CourseMapping> {
    Ok(CourseMapping {
        id: row.get(0)?,
        program_id: row.get(1)?,
        course_id: row.get(2)?,
        dok_level: row.get(3)?,
        points: row.get(4)?,
        path_type: row.get(5)?,
        topic_id: row.get(6)?,
        tactic_id: row.get(7)?,
        sequence_order: row.get(8)?,
        prerequisite_score: row.get(9)?,
    })
}

pub fn insert_program(conn: &Connection, program: &NewProgram, now: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO programs
        (name, description, cohort_id, start_date, end_date, mastery_goal, active, time_created, time_modified)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        "#,
        params![
            program.name,
            program.description,
            program.cohort_id,
            to_ts(program.start_date),
            program.end_date.map(to_ts),
            program.mastery_goal,
            program.active,
            to_ts(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_program(conn: &Connection, program_id: i64) -> Result<Option<Program>> {
    let sql = format!("SELECT {} FROM programs WHERE id = ?1", PROGRAM_COLUMNS);
    conn.query_row(&sql, params![program_id], program_from_row)
        .optional()
        .map_err(Into::into)
}

/// Fetch a program, failing when it does not exist
pub fn get_program(conn: &Connection, program_id: i64) -> Result<Program> {
    find_program(conn, program_id)?.ok_or(TrackError::ProgramNotFound(program_id))
}

pub fn list_programs(conn: &Connection, active_only: bool) -> Result<Vec<Program>> {
    let sql = if active_only {
        format!("SELECT {} FROM programs WHERE active = 1 ORDER BY name ASC", PROGRAM_COLUMNS)
    } else {
        format!("SELECT {} FROM programs ORDER BY name ASC", PROGRAM_COLUMNS)
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], program_from_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn update_program(
    conn: &Connection,
    program_id: i64,
    update: &ProgramUpdate,
    now: DateTime<Utc>,
) -> Result<Program> {
    let mut program = get_program(conn, program_id)?;

    if let Some(name) = &update.name {
        program.name = name.clone();
    }
    if let Some(description) = &update.description {
        program.description = description.clone();
    }
    if update.cohort_id.is_some() {
        program.cohort_id = update.cohort_id;
    }
    if let Some(start) = update.start_date {
        program.start_date = start;
    }
    if update.end_date.is_some() {
        program.end_date = update.end_date;
    }
    if let Some(goal) = update.mastery_goal {
        program.mastery_goal = goal;
    }
    if let Some(active) = update.active {
        program.active = active;
    }
    program.time_modified = now;

    conn.execute(
        r#"
        UPDATE programs SET
            name = ?1, description = ?2, cohort_id = ?3, start_date = ?4, end_date = ?5,
            mastery_goal = ?6, active = ?7, time_modified = ?8
        WHERE id = ?9
        "#,
        params![
            program.name,
            program.description,
            program.cohort_id,
            to_ts(program.start_date),
            program.end_date.map(to_ts),
            program.mastery_goal,
            program.active,
            to_ts(now),
            program_id,
        ],
    )?;

    Ok(program)
}

/// Delete a program and everything hanging off it
///
/// Callers run this inside a transaction so the delete is all-or-nothing.
pub fn delete_program_rows(conn: &Connection, program_id: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM user_points WHERE progress_id IN (SELECT id FROM progress WHERE program_id = ?1)",
        params![program_id],
    )?;
    conn.execute("DELETE FROM course_mappings WHERE program_id = ?1", params![program_id])?;
    conn.execute("DELETE FROM progress WHERE program_id = ?1", params![program_id])?;
    conn.execute("DELETE FROM email_log WHERE program_id = ?1", params![program_id])?;
    conn.execute("DELETE FROM emails WHERE program_id = ?1", params![program_id])?;
    let deleted = conn.execute("DELETE FROM programs WHERE id = ?1", params![program_id])?;
    Ok(deleted)
}

pub fn insert_course_mapping(
    conn: &Connection,
    program_id: i64,
    mapping: &NewCourseMapping,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO course_mappings
        (program_id, course_id, dok_level, points, path_type, topic_id, tactic_id,
         sequence_order, prerequisite_score, time_created)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            program_id,
            mapping.course_id,
            mapping.dok_level,
            mapping.points,
            mapping.path_type,
            mapping.topic_id,
            mapping.tactic_id,
            mapping.sequence_order,
            mapping.prerequisite_score,
            to_ts(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Mapping for a course in a program
///
/// A course may sit in more than one path; the earliest in sequence wins.
pub fn find_course_mapping(
    conn: &Connection,
    program_id: i64,
    course_id: i64,
) -> Result<Option<CourseMapping>> {
    let sql = format!(
        "SELECT {} FROM course_mappings WHERE program_id = ?1 AND course_id = ?2 \
         ORDER BY sequence_order ASC, id ASC LIMIT 1",
        MAPPING_COLUMNS
    );
    conn.query_row(&sql, params![program_id, course_id], mapping_from_row)
        .optional()
        .map_err(Into::into)
}

/// Mappings of a program, optionally restricted to one path, in sequence order
pub fn list_course_mappings(
    conn: &Connection,
    program_id: i64,
    path: Option<PathType>,
) -> Result<Vec<CourseMapping>> {
    let mappings = match path {
        Some(path) => {
            let sql = format!(
                "SELECT {} FROM course_mappings WHERE program_id = ?1 AND path_type = ?2 \
                 ORDER BY sequence_order ASC, id ASC",
                MAPPING_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![program_id, path], mapping_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let sql = format!(
                "SELECT {} FROM course_mappings WHERE program_id = ?1 \
                 ORDER BY sequence_order ASC, id ASC",
                MAPPING_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![program_id], mapping_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_in_memory;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_insert_and_get_program() {
        let conn = open_in_memory().unwrap();
        let id = insert_program(&conn, &NewProgram::new("Phishing 101", start()), start()).unwrap();

        let program = get_program(&conn, id).unwrap();
        assert_eq!(program.name, "Phishing 101");
        assert_eq!(program.mastery_goal, DEFAULT_MASTERY_GOAL);
        assert!(program.active);
        assert_eq!(program.start_date, start());
        assert!(program.end_date.is_none());
    }

    #[test]
    fn test_missing_program() {
        let conn = open_in_memory().unwrap();
        assert!(matches!(get_program(&conn, 99), Err(TrackError::ProgramNotFound(99))));
    }

    #[test]
    fn test_update_keeps_unset_fields() {
        let conn = open_in_memory().unwrap();
        let mut new = NewProgram::new("Original", start());
        new.description = "keep me".to_string();
        let id = insert_program(&conn, &new, start()).unwrap();

        let update = ProgramUpdate {
            mastery_goal: Some(40),
            active: Some(false),
            ..Default::default()
        };
        let updated = update_program(&conn, id, &update, start()).unwrap();
        assert_eq!(updated.name, "Original");
        assert_eq!(updated.description, "keep me");
        assert_eq!(updated.mastery_goal, 40);
        assert!(!updated.active);

        let active = list_programs(&conn, true).unwrap();
        assert!(active.is_empty());
        assert_eq!(list_programs(&conn, false).unwrap().len(), 1);
    }

    #[test]
    fn test_course_mappings_by_path_in_sequence() {
        let conn = open_in_memory().unwrap();
        let id = insert_program(&conn, &NewProgram::new("P", start()), start()).unwrap();

        let mut second = NewCourseMapping::new(20, 2, PathType::Remedial);
        second.sequence_order = 2;
        let mut first = NewCourseMapping::new(10, 1, PathType::Remedial);
        first.sequence_order = 1;
        insert_course_mapping(&conn, id, &second, start()).unwrap();
        insert_course_mapping(&conn, id, &first, start()).unwrap();
        insert_course_mapping(&conn, id, &NewCourseMapping::new(30, 3, PathType::Challenge), start())
            .unwrap();

        let remedial = list_course_mappings(&conn, id, Some(PathType::Remedial)).unwrap();
        let courses: Vec<i64> = remedial.iter().map(|m| m.course_id).collect();
        assert_eq!(courses, vec![10, 20]);

        assert_eq!(list_course_mappings(&conn, id, None).unwrap().len(), 3);

        let mapping = find_course_mapping(&conn, id, 30).unwrap().unwrap();
        assert_eq!(mapping.points, 3);
        assert_eq!(mapping.path_type, PathType::Challenge);
        assert!(find_course_mapping(&conn, id, 99).unwrap().is_none());
    }
}
