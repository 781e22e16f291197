//! Program lifecycle
//!
//! Creating a program with a cohort starts every cohort member on the
//! standard path. Deleting a program removes everything hanging off it in
//! one transaction.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{Result, TrackError};
use crate::host::Directory;
use crate::storage::{self, CourseMapping, NewCourseMapping, NewProgram, Program, ProgramUpdate};
use crate::tracking::PathType;

/// A newly created program and how many learners it started with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedProgram {
    pub id: i64,
    pub enrolled: usize,
}

pub fn create_program(
    conn: &mut Connection,
    directory: &dyn Directory,
    program: &NewProgram,
    now: DateTime<Utc>,
) -> Result<CreatedProgram> {
    let members = match program.cohort_id {
        Some(cohort_id) => directory.cohort_members(cohort_id)?,
        None => Vec::new(),
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let id = storage::insert_program(&tx, program, now)?;
    let enrolled = enrol_users(&tx, id, &members, now)?;
    tx.commit()?;

    info!(
        "Created program {} ({}) with {} learners",
        id, program.name, enrolled
    );
    Ok(CreatedProgram { id, enrolled })
}

pub fn update_program(
    conn: &Connection,
    program_id: i64,
    update: &ProgramUpdate,
    now: DateTime<Utc>,
) -> Result<Program> {
    let program = storage::update_program(conn, program_id, update, now)?;
    debug!("Updated program {}", program_id);
    Ok(program)
}

/// Delete a program with its mappings, progress, point records and emails
///
/// Returns false when the program did not exist.
pub fn delete_program(conn: &mut Connection, program_id: i64) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let deleted = storage::delete_program_rows(&tx, program_id)?;
    tx.commit()?;

    if deleted > 0 {
        info!("Deleted program {}", program_id);
    }
    Ok(deleted > 0)
}

/// Start every member of the cohort who has no progress row yet
///
/// Idempotent: existing learners keep their progress. Returns the number
/// of learners added.
pub fn enroll_cohort_members(
    conn: &mut Connection,
    directory: &dyn Directory,
    program_id: i64,
    cohort_id: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    let members = directory.cohort_members(cohort_id)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    storage::get_program(&tx, program_id)?;
    let enrolled = enrol_users(&tx, program_id, &members, now)?;
    tx.commit()?;

    info!(
        "Enrolled {} of {} cohort {} members in program {}",
        enrolled,
        members.len(),
        cohort_id,
        program_id
    );
    Ok(enrolled)
}

fn enrol_users(conn: &Connection, program_id: i64, users: &[i64], now: DateTime<Utc>) -> Result<usize> {
    let mut count = 0;
    for user_id in users {
        if storage::insert_progress(conn, program_id, *user_id, now)? {
            count += 1;
        }
    }
    Ok(count)
}

pub fn add_course_to_program(
    conn: &Connection,
    program_id: i64,
    mapping: &NewCourseMapping,
    now: DateTime<Utc>,
) -> Result<i64> {
    if !(1..=4).contains(&mapping.dok_level) {
        return Err(TrackError::InvalidDokLevel(mapping.dok_level));
    }
    storage::get_program(conn, program_id)?;
    let id = storage::insert_course_mapping(conn, program_id, mapping, now)?;
    debug!(
        "Mapped course {} into program {} ({} path, {} points)",
        mapping.course_id, program_id, mapping.path_type, mapping.points
    );
    Ok(id)
}

/// Courses of a program in sequence order, optionally for one path
pub fn program_courses(
    conn: &Connection,
    program_id: i64,
    path: Option<PathType>,
) -> Result<Vec<CourseMapping>> {
    storage::list_course_mappings(conn, program_id, path)
}
