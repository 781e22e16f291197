//! Prompts and reply parsing for tagging, path suggestion and email content

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{GenerateOptions, TextGenerator, strip_code_fence};
use crate::error::{Result, TrackError};
use crate::host::{CourseInfo, Directory};
use crate::storage::{self, CourseTags};

/// Tags proposed for a course
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourseTagSuggestion {
    pub topics: Vec<String>,
    pub tactics: Vec<String>,
    pub dok_level: Option<i64>,
    pub points: Option<i64>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}

/// Suggested course sequences, by course id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSuggestion {
    pub standard: Vec<i64>,
    pub remedial: Vec<i64>,
    pub challenge: Vec<i64>,
}

/// Generated content for one scheduled email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub phishing_example: String,
}

fn parse_json<T: for<'de> Deserialize<'de>>(reply: &str) -> Result<T> {
    serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| TrackError::Parse(format!("Failed to parse LLM response: {}", e)))
}

pub fn tagging_prompt(course: &CourseInfo, topics: &[String], tactics: &[String]) -> String {
    format!(
        r#"Analyze the following cybersecurity course and identify:
1. Primary topic(s) from this list: {}
2. Tactic(s) covered from this list: {}
3. Webb's DOK level (1-4) based on cognitive complexity
4. Suggested point value (1-4)

Course Name: {}
Summary: {}

Return response in JSON format:
{{
  "topics": ["topic1", "topic2"],
  "tactics": ["tactic1"],
  "dok_level": 2,
  "points": 2,
  "confidence": 0.85,
  "reasoning": "explanation"
}}"#,
        topics.join(", "),
        tactics.join(", "),
        course.fullname,
        course.summary
    )
}

/// Ask the generator to tag one course and store the result unapproved
///
/// Returns `None` for a course the directory does not know.
pub async fn tag_course(
    conn: &Connection,
    directory: &dyn Directory,
    generator: &dyn TextGenerator,
    course_id: i64,
    options: &GenerateOptions,
) -> Result<Option<CourseTags>> {
    let Some(course) = directory.course(course_id)? else {
        warn!("Course {} not found, not tagging", course_id);
        return Ok(None);
    };

    let topics: Vec<String> = storage::list_topics(conn)?.into_iter().map(|t| t.name).collect();
    let tactics: Vec<String> = storage::list_tactics(conn)?.into_iter().map(|t| t.name).collect();
    let prompt = tagging_prompt(&course, &topics, &tactics);

    let reply = generator.generate(&prompt, options).await?;
    let suggestion: CourseTagSuggestion = parse_json(&reply)?;

    storage::upsert_tags(
        conn,
        course_id,
        suggestion.dok_level,
        suggestion.points,
        suggestion.confidence,
        &serde_json::to_string(&suggestion)?,
        Utc::now(),
    )?;
    info!(
        "Tagged course {}: topics {:?}, tactics {:?}",
        course_id, suggestion.topics, suggestion.tactics
    );

    storage::find_tags_for_course(conn, course_id)
}

pub fn paths_prompt(courses: &[(storage::CourseMapping, Option<CourseTags>)]) -> String {
    let mut prompt = String::from(
        "Based on the following tagged cybersecurity courses, generate three learning paths:\n\
         1. STANDARD PATH: For average performers (70-94% scores)\n\
         2. REMEDIAL PATH: For low performers (<70% scores) - focus on fundamentals\n\
         3. CHALLENGE PATH: For high performers (95-100% scores) - advanced content\n\n\
         Courses:\n",
    );

    for (mapping, tags) in courses {
        prompt.push_str(&format!(
            "- Course ID: {}, DOK: {}, Points: {}\n",
            mapping.course_id, mapping.dok_level, mapping.points
        ));
        if let Some(tags) = tags {
            prompt.push_str(&format!("  Tags: {}\n", tags.metadata));
        }
    }

    prompt.push_str(
        "\nReturn a JSON structure with three arrays (standard, remedial, challenge) \
         containing course IDs in recommended sequence.",
    );
    prompt
}

/// Suggest path sequences for a program's mapped courses
pub async fn suggest_paths(
    conn: &Connection,
    generator: &dyn TextGenerator,
    program_id: i64,
    options: &GenerateOptions,
) -> Result<PathSuggestion> {
    storage::get_program(conn, program_id)?;

    let mut courses = Vec::new();
    for mapping in storage::list_course_mappings(conn, program_id, None)? {
        let tags = storage::find_tags_for_course(conn, mapping.course_id)?;
        courses.push((mapping, tags));
    }

    let reply = generator.generate(&paths_prompt(&courses), options).await?;
    parse_json(&reply)
}

pub fn email_prompt(day: i64, topic: &str) -> String {
    format!(
        r#"Generate an engaging cybersecurity awareness email for Day {} of a training program.
Topic: {}
Include:
1. Catchy subject line
2. Brief educational content (2-3 paragraphs)
3. A realistic phishing example with red flags highlighted
4. Call to action to complete courses
5. Motivational closing

Tone: Professional but friendly, educational without being preachy
Use placeholders: {{firstname}}, {{points}}, {{goal}}, {{courselinks}}

Return JSON:
{{
  "subject": "...",
  "body": "...",
  "phishing_example": "..."
}}"#,
        day, topic
    )
}

pub async fn generate_email_content(
    generator: &dyn TextGenerator,
    day: i64,
    topic: &str,
    options: &GenerateOptions,
) -> Result<EmailContent> {
    let reply = generator.generate(&email_prompt(day, topic), options).await?;
    parse_json(&reply)
}
