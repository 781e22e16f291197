//! LLM-suggested course tags awaiting approval

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use super::{from_ts, to_ts};
use crate::error::{Result, TrackError};

#[derive(Debug, Clone, Serialize)]
pub struct CourseTags {
    pub id: i64,
    pub course_id: i64,
    pub dok_level: Option<i64>,
    pub suggested_points: Option<i64>,
    pub confidence: Option<f64>,
    /// Raw JSON returned by the tagger
    pub metadata: String,
    pub approved: bool,
    pub time_created: DateTime<Utc>,
}

fn tags_from_row(row: &Row<'_>) -> rusqlite::Result<CourseTags> {
    Ok(CourseTags {
        id: row.get(0)?,
        course_id: row.get(1)?,
        dok_level: row.get(2)?,
        suggested_points: row.get(3)?,
        confidence: row.get(4)?,
        metadata: row.get(5)?,
        approved: row.get(6)?,
        time_created: from_ts(row.get(7)?),
    })
}

/// Store fresh tags for a course, resetting approval
pub fn upsert_tags(
    conn: &Connection,
    course_id: i64,
    dok_level: Option<i64>,
    suggested_points: Option<i64>,
    confidence: Option<f64>,
    metadata: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO course_tags
        (course_id, dok_level, suggested_points, confidence, metadata, approved, time_created)
        VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
        ON CONFLICT(course_id) DO UPDATE SET
            dok_level = excluded.dok_level,
            suggested_points = excluded.suggested_points,
            confidence = excluded.confidence,
            metadata = excluded.metadata,
            approved = 0,
            time_created = excluded.time_created
        "#,
        params![course_id, dok_level, suggested_points, confidence, metadata, to_ts(now)],
    )?;

    let id = conn.query_row(
        "SELECT id FROM course_tags WHERE course_id = ?1",
        params![course_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn find_tags_for_course(conn: &Connection, course_id: i64) -> Result<Option<CourseTags>> {
    conn.query_row(
        r#"
        SELECT id, course_id, dok_level, suggested_points, confidence, metadata, approved, time_created
        FROM course_tags WHERE course_id = ?1
        "#,
        params![course_id],
        tags_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn approve_tags(conn: &Connection, tag_id: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE course_tags SET approved = 1 WHERE id = ?1",
        params![tag_id],
    )?;
    if changed == 0 {
        return Err(TrackError::TagsNotFound(tag_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_in_memory;

    #[test]
    fn test_retagging_resets_approval() {
        let conn = open_in_memory().unwrap();
        let now = Utc::now();

        let id = upsert_tags(&conn, 4, Some(2), Some(2), Some(0.8), "{}", now).unwrap();
        approve_tags(&conn, id).unwrap();
        assert!(find_tags_for_course(&conn, 4).unwrap().unwrap().approved);

        let again = upsert_tags(&conn, 4, Some(3), Some(3), Some(0.9), "{}", now).unwrap();
        assert_eq!(id, again);
        let tags = find_tags_for_course(&conn, 4).unwrap().unwrap();
        assert!(!tags.approved);
        assert_eq!(tags.dok_level, Some(3));
    }

    #[test]
    fn test_approve_missing() {
        let conn = open_in_memory().unwrap();
        assert!(matches!(approve_tags(&conn, 42), Err(TrackError::TagsNotFound(42))));
    }
}
