//! Host collaborators backed by the host tables in the shared database

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::debug;

use super::{CompletionSource, CourseEnrolment, CourseInfo, Directory, HostCompletion, Learner};
use crate::error::Result;
use crate::storage::{self, from_ts, to_ts};

/// Host platform view over `users`, `courses`, `cohort_members`,
/// `user_enrolments` and `course_completions`
///
/// Holds its own connection so enrolment calls made after a tracking
/// transaction commits never contend with the tracker's borrow.
pub struct SqliteHost {
    conn: Connection,
}

impl SqliteHost {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = storage::open(db_path)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn add_user(&self, user_id: i64, firstname: &str, lastname: &str, email: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO users (id, firstname, lastname, email) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                firstname = excluded.firstname,
                lastname = excluded.lastname,
                email = excluded.email
            "#,
            params![user_id, firstname, lastname, email],
        )?;
        Ok(())
    }

    pub fn add_course(&self, course_id: i64, fullname: &str, shortname: &str, summary: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO courses (id, fullname, shortname, summary) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                fullname = excluded.fullname,
                shortname = excluded.shortname,
                summary = excluded.summary
            "#,
            params![course_id, fullname, shortname, summary],
        )?;
        Ok(())
    }

    pub fn add_cohort_member(&self, cohort_id: i64, user_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO cohort_members (cohort_id, user_id) VALUES (?1, ?2)",
            params![cohort_id, user_id],
        )?;
        Ok(())
    }

    /// Record a host-side course completion (what the LMS would log)
    pub fn record_course_completion(
        &self,
        user_id: i64,
        course_id: i64,
        completed_at: DateTime<Utc>,
        grade: Option<f64>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO course_completions (user_id, course_id, time_completed, final_grade)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, course_id) DO UPDATE SET
                time_completed = excluded.time_completed,
                final_grade = excluded.final_grade
            "#,
            params![user_id, course_id, to_ts(completed_at), grade],
        )?;
        Ok(())
    }

    /// Course ids the learner is enrolled in
    pub fn enrolments(&self, user_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT course_id FROM user_enrolments WHERE user_id = ?1 ORDER BY course_id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }
}

impl CourseEnrolment for SqliteHost {
    fn is_enrolled(&self, user_id: i64, course_id: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_enrolments WHERE user_id = ?1 AND course_id = ?2",
            params![user_id, course_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn has_any_enrolment(&self, user_id: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_enrolments WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn enrol(&self, course_id: i64, user_id: i64) -> Result<bool> {
        let known: bool = self
            .conn
            .query_row("SELECT 1 FROM courses WHERE id = ?1", params![course_id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !known {
            debug!("Refusing enrolment in unknown course {}", course_id);
            return Ok(false);
        }

        self.conn.execute(
            "INSERT OR IGNORE INTO user_enrolments (user_id, course_id, time_enrolled) VALUES (?1, ?2, ?3)",
            params![user_id, course_id, to_ts(Utc::now())],
        )?;
        debug!("Enrolled user {} in course {}", user_id, course_id);
        Ok(true)
    }
}

impl CompletionSource for SqliteHost {
    fn completions(&self, course_id: i64) -> Result<Vec<HostCompletion>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT user_id, course_id, time_completed, final_grade
            FROM course_completions
            WHERE course_id = ?1 AND time_completed IS NOT NULL
            ORDER BY time_completed ASC
            "#,
        )?;
        let rows = stmt.query_map(params![course_id], |row| {
            Ok(HostCompletion {
                user_id: row.get(0)?,
                course_id: row.get(1)?,
                completed_at: from_ts(row.get(2)?),
                grade: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }
}

impl Directory for SqliteHost {
    fn user(&self, user_id: i64) -> Result<Option<Learner>> {
        self.conn
            .query_row(
                "SELECT id, firstname, lastname, email FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(Learner {
                        id: row.get(0)?,
                        firstname: row.get(1)?,
                        lastname: row.get(2)?,
                        email: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    fn course(&self, course_id: i64) -> Result<Option<CourseInfo>> {
        self.conn
            .query_row(
                "SELECT id, fullname, shortname, summary FROM courses WHERE id = ?1",
                params![course_id],
                |row| {
                    Ok(CourseInfo {
                        id: row.get(0)?,
                        fullname: row.get(1)?,
                        shortname: row.get(2)?,
                        summary: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    fn cohort_members(&self, cohort_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM cohort_members WHERE cohort_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![cohort_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }
}
