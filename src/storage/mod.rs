//! Storage module for masterytrack
//!
//! Owns the SQLite schema (add-on tables plus the host-platform tables the
//! add-on reads from) and the row-level queries used by the services.
//! Query functions take `&Connection` so they run unchanged inside a
//! `Transaction`.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;

pub mod emails;
pub mod programs;
pub mod progress;
pub mod tags;

pub use emails::{
    EmailLogEntry, EmailTemplate, EmailTemplateUpdate, NewEmailTemplate, delete_template,
    find_log, get_template, insert_template, list_templates, record_attempt, update_template,
};
pub use programs::{
    CourseMapping, DEFAULT_MASTERY_GOAL, NewCourseMapping, NewProgram, Program, ProgramUpdate,
    delete_program_rows, find_course_mapping, find_program, get_program, insert_course_mapping,
    insert_program, list_course_mappings, list_programs, update_program,
};
pub use progress::{
    PointRecord, PointRecordWrite, Progress, find_point_record, find_progress, find_progress_by_id,
    insert_progress, list_point_records, list_progress_for_program, list_sweep_candidates,
    set_current_path, sum_completed_points, upsert_point_record, window_average_grade, write_total,
};
pub use tags::{CourseTags, approve_tags, find_tags_for_course, upsert_tags};

/// Open the database for read/write use by commands and sweeps
///
/// WAL mode plus a busy timeout lets a running scheduler and a one-off CLI
/// command share the file; writers queue on the lock instead of failing.
pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// In-memory database with the full schema, used by tests
#[cfg(test)]
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Create all tables and seed the topic/tactic catalogues
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS programs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            cohort_id INTEGER,
            start_date INTEGER NOT NULL,
            end_date INTEGER,
            mastery_goal INTEGER NOT NULL DEFAULT 27,
            active INTEGER NOT NULL DEFAULT 1,
            time_created INTEGER NOT NULL,
            time_modified INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS course_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            program_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            dok_level INTEGER NOT NULL DEFAULT 1,
            points INTEGER NOT NULL DEFAULT 1,
            path_type TEXT NOT NULL DEFAULT 'standard',
            topic_id INTEGER,
            tactic_id INTEGER,
            sequence_order INTEGER NOT NULL DEFAULT 0,
            prerequisite_score REAL,
            time_created INTEGER NOT NULL,
            UNIQUE(program_id, course_id, path_type),
            FOREIGN KEY (program_id) REFERENCES programs(id) ON DELETE CASCADE
        );

        -- One row per (program, learner); total_points is always recomputed
        -- from user_points, never incremented
        CREATE TABLE IF NOT EXISTS progress (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            program_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            total_points INTEGER NOT NULL DEFAULT 0,
            mastery_achieved INTEGER NOT NULL DEFAULT 0,
            mastery_date INTEGER,
            current_path TEXT NOT NULL DEFAULT 'standard',
            time_created INTEGER NOT NULL,
            time_modified INTEGER NOT NULL,
            UNIQUE(program_id, user_id),
            FOREIGN KEY (program_id) REFERENCES programs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS user_points (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            progress_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            topic_id INTEGER,
            tactic_id INTEGER,
            points_earned INTEGER NOT NULL DEFAULT 0,
            grade REAL NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            time_completed INTEGER,
            UNIQUE(progress_id, course_id),
            FOREIGN KEY (progress_id) REFERENCES progress(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            category TEXT NOT NULL DEFAULT 'core',
            description TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS tactics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            description TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            program_id INTEGER NOT NULL,
            day_offset INTEGER NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            phishing_example TEXT NOT NULL DEFAULT '',
            course_id INTEGER,
            topic_id INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            time_created INTEGER NOT NULL,
            FOREIGN KEY (program_id) REFERENCES programs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS email_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            program_id INTEGER NOT NULL,
            sent INTEGER NOT NULL DEFAULT 0,
            time_sent INTEGER,
            error TEXT,
            UNIQUE(email_id, user_id, program_id)
        );

        CREATE TABLE IF NOT EXISTS course_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            course_id INTEGER UNIQUE NOT NULL,
            dok_level INTEGER,
            suggested_points INTEGER,
            confidence REAL,
            metadata TEXT NOT NULL DEFAULT '{}',
            approved INTEGER NOT NULL DEFAULT 0,
            time_created INTEGER NOT NULL
        );

        -- Host platform tables. A real deployment shares these with the
        -- course-management system; standalone installs get empty copies.
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            firstname TEXT NOT NULL DEFAULT '',
            lastname TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS courses (
            id INTEGER PRIMARY KEY,
            fullname TEXT NOT NULL,
            shortname TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS cohort_members (
            cohort_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            PRIMARY KEY (cohort_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS user_enrolments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            time_enrolled INTEGER NOT NULL,
            UNIQUE(user_id, course_id)
        );

        CREATE TABLE IF NOT EXISTS course_completions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            time_completed INTEGER,
            final_grade REAL,
            UNIQUE(user_id, course_id)
        );

        CREATE INDEX IF NOT EXISTS idx_mappings_program_path ON course_mappings(program_id, path_type);
        CREATE INDEX IF NOT EXISTS idx_points_progress ON user_points(progress_id);
        CREATE INDEX IF NOT EXISTS idx_progress_program ON progress(program_id);
        CREATE INDEX IF NOT EXISTS idx_emails_program ON emails(program_id);
        CREATE INDEX IF NOT EXISTS idx_completions_course ON course_completions(course_id);
        "#,
    )?;

    let seeded = seed_catalogues(conn)?;
    if seeded > 0 {
        info!("Seeded {} topics and tactics", seeded);
    }

    Ok(())
}

const DEFAULT_TOPICS: &[(&str, &str, &str)] = &[
    ("Brand Impersonation", "core", "Recognizing fake brand communications"),
    ("Compliance", "core", "Regulatory and compliance-based phishing"),
    ("Emotions", "core", "Emotional manipulation techniques"),
    ("Financial Transactions", "core", "Payment and invoice scams"),
    ("General Phishing", "core", "Basic phishing awareness"),
    ("Generic Cloud", "core", "Cloud service impersonation"),
    ("Mobile", "core", "Mobile device threats"),
    ("News and Events", "core", "Current events exploitation"),
    ("Office Communications", "core", "Internal communication spoofing"),
    ("Passwords", "core", "Password security and credential theft"),
    ("Reporting", "core", "How to report phishing"),
    ("Safe Web Browsing", "core", "Web safety practices"),
    ("Shipment & Deliveries", "core", "Package delivery scams"),
    ("Small/Medium Businesses", "core", "SMB-targeted attacks"),
    ("Social Media", "core", "Social platform threats"),
    ("Spear Phishing", "core", "Targeted phishing attacks"),
    ("Data Breach", "advanced", "Data breach awareness"),
    ("Malware", "advanced", "Malicious software threats"),
    ("MFA", "advanced", "Multi-factor authentication"),
    ("Personal Security", "advanced", "Personal information protection"),
    ("Physical Security", "advanced", "Physical access threats"),
    ("Ransomware", "advanced", "Ransomware prevention"),
    ("SEG", "advanced", "Secure Email Gateway bypass"),
    ("Shared File", "advanced", "File sharing risks"),
];

const DEFAULT_TACTICS: &[(&str, &str)] = &[
    ("Attachment Phish", "Malicious attachments"),
    ("BEC/CEO Fraud", "Business email compromise"),
    ("Credential Phish", "Credential harvesting"),
    ("QR Codes", "QR code-based attacks"),
    ("URL Phish", "Malicious links"),
];

/// Insert the default topics and tactics; existing names are left alone
fn seed_catalogues(conn: &Connection) -> Result<usize> {
    let mut inserted = 0;

    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO topics (name, category, description) VALUES (?1, ?2, ?3)",
    )?;
    for (name, category, description) in DEFAULT_TOPICS {
        inserted += stmt.execute(params![name, category, description])?;
    }

    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO tactics (name, description) VALUES (?1, ?2)",
    )?;
    for (name, description) in DEFAULT_TACTICS {
        inserted += stmt.execute(params![name, description])?;
    }

    Ok(inserted)
}

/// A named catalogue entry (topic or tactic)
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CatalogueEntry {
    pub id: i64,
    pub name: String,
    pub description: String,
}

pub fn list_topics(conn: &Connection) -> Result<Vec<CatalogueEntry>> {
    let mut stmt = conn.prepare("SELECT id, name, description FROM topics ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(CatalogueEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn list_tactics(conn: &Connection) -> Result<Vec<CatalogueEntry>> {
    let mut stmt = conn.prepare("SELECT id, name, description FROM tactics ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(CatalogueEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Look up a topic id by exact name
pub fn topic_id_by_name(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM topics WHERE name = ?1")?;
    let mut rows = stmt.query(params![name])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Look up a tactic id by exact name
pub fn tactic_id_by_name(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM tactics WHERE name = ?1")?;
    let mut rows = stmt.query(params![name])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Row counts shown by `masterytrack status`
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct StoreCounts {
    pub programs: i64,
    pub active_programs: i64,
    pub learners: i64,
    pub mastered: i64,
    pub completions: i64,
    pub email_templates: i64,
    pub emails_sent: i64,
}

pub fn counts(conn: &Connection) -> Result<StoreCounts> {
    let count = |sql: &str| -> Result<i64> {
        conn.query_row(sql, [], |row| row.get(0)).map_err(Into::into)
    };

    let counts = StoreCounts {
        programs: count("SELECT COUNT(*) FROM programs")?,
        active_programs: count("SELECT COUNT(*) FROM programs WHERE active = 1")?,
        learners: count("SELECT COUNT(*) FROM progress")?,
        mastered: count("SELECT COUNT(*) FROM progress WHERE mastery_achieved = 1")?,
        completions: count("SELECT COUNT(*) FROM user_points WHERE completed = 1")?,
        email_templates: count("SELECT COUNT(*) FROM emails")?,
        emails_sent: count("SELECT COUNT(*) FROM email_log WHERE sent = 1")?,
    };
    debug!("Store counts: {:?}", counts);
    Ok(counts)
}

/// Unix seconds for storage
pub fn to_ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

/// Stored Unix seconds back to a timestamp; out-of-range values clamp to the epoch
pub fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}
