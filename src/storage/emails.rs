//! Email template and send-log rows

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use super::{from_ts, to_ts};
use crate::error::{Result, TrackError};

/// A scheduled email in a program's cadence
#[derive(Debug, Clone, Serialize)]
pub struct EmailTemplate {
    pub id: i64,
    pub program_id: i64,
    /// Days after program start before this email is due
    pub day_offset: i64,
    pub subject: String,
    pub body: String,
    pub phishing_example: String,
    pub course_id: Option<i64>,
    pub topic_id: Option<i64>,
    pub active: bool,
    pub time_created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEmailTemplate {
    pub day_offset: i64,
    pub subject: String,
    pub body: String,
    pub phishing_example: String,
    pub course_id: Option<i64>,
    pub topic_id: Option<i64>,
}

/// Partial template update; `None` keeps the stored value
#[derive(Debug, Clone, Default)]
pub struct EmailTemplateUpdate {
    pub subject: Option<String>,
    pub body: Option<String>,
    pub phishing_example: Option<String>,
    pub course_id: Option<i64>,
    pub active: Option<bool>,
}

/// Delivery state of one template for one learner
#[derive(Debug, Clone, Serialize)]
pub struct EmailLogEntry {
    pub id: i64,
    pub email_id: i64,
    pub user_id: i64,
    pub program_id: i64,
    pub sent: bool,
    pub time_sent: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

const TEMPLATE_COLUMNS: &str = "id, program_id, day_offset, subject, body, phishing_example, \
     course_id, topic_id, active, time_created";

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<EmailTemplate> {
    Ok(EmailTemplate {
        id: row.get(0)?,
        program_id: row.get(1)?,
        day_offset: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        phishing_example: row.get(5)?,
        course_id: row.get(6)?,
        topic_id: row.get(7)?,
        active: row.get(8)?,
        time_created: from_ts(row.get(9)?),
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<EmailLogEntry> {
    Ok(EmailLogEntry {
        id: row.get(0)?,
        email_id: row.get(1)?,
        user_id: row.get(2)?,
        program_id: row.get(3)?,
        sent: row.get(4)?,
        time_sent: row.get::<_, Option<i64>>(5)?.map(from_ts),
        error: row.get(6)?,
    })
}

pub fn insert_template(
    conn: &Connection,
    program_id: i64,
    template: &NewEmailTemplate,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO emails
        (program_id, day_offset, subject, body, phishing_example, course_id, topic_id, active, time_created)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
        "#,
        params![
            program_id,
            template.day_offset,
            template.subject,
            template.body,
            template.phishing_example,
            template.course_id,
            template.topic_id,
            to_ts(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_template(conn: &Connection, email_id: i64) -> Result<EmailTemplate> {
    let sql = format!("SELECT {} FROM emails WHERE id = ?1", TEMPLATE_COLUMNS);
    conn.query_row(&sql, params![email_id], template_from_row)
        .optional()?
        .ok_or(TrackError::EmailNotFound(email_id))
}

/// All templates of a program by day offset
pub fn list_templates(conn: &Connection, program_id: i64, active_only: bool) -> Result<Vec<EmailTemplate>> {
    let sql = format!(
        "SELECT {} FROM emails WHERE program_id = ?1 AND (?2 = 0 OR active = 1) \
         ORDER BY day_offset ASC, id ASC",
        TEMPLATE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![program_id, active_only], template_from_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn update_template(
    conn: &Connection,
    email_id: i64,
    update: &EmailTemplateUpdate,
) -> Result<EmailTemplate> {
    let mut template = get_template(conn, email_id)?;

    if let Some(subject) = &update.subject {
        template.subject = subject.clone();
    }
    if let Some(body) = &update.body {
        template.body = body.clone();
    }
    if let Some(example) = &update.phishing_example {
        template.phishing_example = example.clone();
    }
    if update.course_id.is_some() {
        template.course_id = update.course_id;
    }
    if let Some(active) = update.active {
        template.active = active;
    }

    conn.execute(
        r#"
        UPDATE emails SET subject = ?1, body = ?2, phishing_example = ?3, course_id = ?4, active = ?5
        WHERE id = ?6
        "#,
        params![
            template.subject,
            template.body,
            template.phishing_example,
            template.course_id,
            template.active,
            email_id,
        ],
    )?;

    Ok(template)
}

pub fn delete_template(conn: &Connection, email_id: i64) -> Result<bool> {
    conn.execute("DELETE FROM email_log WHERE email_id = ?1", params![email_id])?;
    let deleted = conn.execute("DELETE FROM emails WHERE id = ?1", params![email_id])?;
    Ok(deleted > 0)
}

pub fn find_log(
    conn: &Connection,
    email_id: i64,
    user_id: i64,
    program_id: i64,
) -> Result<Option<EmailLogEntry>> {
    conn.query_row(
        r#"
        SELECT id, email_id, user_id, program_id, sent, time_sent, error
        FROM email_log WHERE email_id = ?1 AND user_id = ?2 AND program_id = ?3
        "#,
        params![email_id, user_id, program_id],
        log_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Record the outcome of a send attempt
///
/// A success clears any earlier error; a failure keeps `sent = 0` so the
/// next scheduled run tries again.
pub fn record_attempt(
    conn: &Connection,
    email_id: i64,
    user_id: i64,
    program_id: i64,
    outcome: std::result::Result<DateTime<Utc>, &str>,
) -> Result<()> {
    let (sent, time_sent, error) = match outcome {
        Ok(at) => (true, Some(to_ts(at)), None),
        Err(reason) => (false, None, Some(reason.to_string())),
    };

    conn.execute(
        r#"
        INSERT INTO email_log (email_id, user_id, program_id, sent, time_sent, error)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(email_id, user_id, program_id) DO UPDATE SET
            sent = excluded.sent,
            time_sent = excluded.time_sent,
            error = excluded.error
        "#,
        params![email_id, user_id, program_id, sent, time_sent, error],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_in_memory;
    use crate::storage::programs::{NewProgram, insert_program};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap()
    }

    fn template(day: i64) -> NewEmailTemplate {
        NewEmailTemplate {
            day_offset: day,
            subject: format!("Day {}", day),
            body: "Hello {firstname}".to_string(),
            phishing_example: String::new(),
            course_id: None,
            topic_id: None,
        }
    }

    #[test]
    fn test_templates_ordered_by_day() {
        let conn = open_in_memory().unwrap();
        let program = insert_program(&conn, &NewProgram::new("P", now()), now()).unwrap();
        insert_template(&conn, program, &template(7), now()).unwrap();
        insert_template(&conn, program, &template(1), now()).unwrap();

        let days: Vec<i64> = list_templates(&conn, program, false)
            .unwrap()
            .iter()
            .map(|t| t.day_offset)
            .collect();
        assert_eq!(days, vec![1, 7]);
    }

    #[test]
    fn test_update_and_deactivate() {
        let conn = open_in_memory().unwrap();
        let program = insert_program(&conn, &NewProgram::new("P", now()), now()).unwrap();
        let id = insert_template(&conn, program, &template(3), now()).unwrap();

        let update = EmailTemplateUpdate {
            subject: Some("New subject".to_string()),
            active: Some(false),
            ..Default::default()
        };
        let updated = update_template(&conn, id, &update).unwrap();
        assert_eq!(updated.subject, "New subject");
        assert_eq!(updated.body, "Hello {firstname}");

        assert!(list_templates(&conn, program, true).unwrap().is_empty());
        assert!(delete_template(&conn, id).unwrap());
        assert!(matches!(get_template(&conn, id), Err(TrackError::EmailNotFound(_))));
    }

    #[test]
    fn test_failed_then_successful_attempt() {
        let conn = open_in_memory().unwrap();
        record_attempt(&conn, 1, 2, 3, Err("Failed to send email")).unwrap();

        let log = find_log(&conn, 1, 2, 3).unwrap().unwrap();
        assert!(!log.sent);
        assert_eq!(log.error.as_deref(), Some("Failed to send email"));

        record_attempt(&conn, 1, 2, 3, Ok(now())).unwrap();
        let log = find_log(&conn, 1, 2, 3).unwrap().unwrap();
        assert!(log.sent);
        assert_eq!(log.time_sent, Some(now()));
        assert!(log.error.is_none());
    }
}
