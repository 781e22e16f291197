//! Scheduled training emails
//!
//! Each program carries a cadence of templates keyed by day offset from the
//! program start. A template is sent once per learner when the program is at
//! least that many days old; failures are logged and retried on the next run.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::Result;
use crate::llm::{self, EmailContent, GenerateOptions, TextGenerator};
use crate::storage::{self, NewEmailTemplate};

mod render;
mod sender;

pub use render::{RenderedEmail, course_links, render_email};
pub use sender::{EmailStats, Mailer, OutboxMailer, OutgoingEmail, send_scheduled_emails};

/// Spaced-repetition cadence, in days after program start
pub const SCHEDULE_DAYS: [i64; 6] = [1, 3, 7, 14, 21, 28];

/// Topic used when no topics are given
pub const DEFAULT_TOPIC: &str = "General Phishing";

/// Built-in content used when generation is unavailable
pub fn fallback_content(day: i64, topic: &str) -> EmailContent {
    EmailContent {
        subject: format!("Day {} Cybersecurity Training: {}", day, topic),
        body: format!(
            "Welcome to Day {day} of your cybersecurity mastery journey!\n\n\
             Today we're focusing on: {topic}\n\n\
             Below you'll find a phishing example to help you recognize threats. \
             Can you spot the red flags?\n\n\
             Click here to access your courses: {{courselinks}}\n\n\
             Stay vigilant!\n\
             Your Security Team"
        ),
        phishing_example: format!(
            "Example phishing email for {topic}:\n\n\
             From: security@company-alert.com\n\
             Subject: Urgent: Verify Your Account\n\n\
             Dear User,\n\
             We've detected suspicious activity on your account...\n\
             [Red flags: urgent language, suspicious sender, generic greeting]"
        ),
    }
}

/// Create one template per schedule day, each on a randomly chosen topic
///
/// Content comes from the generator; any generation failure falls back to
/// the built-in template for that day. Returns the new template ids.
pub async fn generate_email_schedule(
    conn: &Connection,
    generator: &dyn TextGenerator,
    program_id: i64,
    topics: &[String],
    options: &GenerateOptions,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    storage::get_program(conn, program_id)?;

    let mut ids = Vec::with_capacity(SCHEDULE_DAYS.len());
    for day in SCHEDULE_DAYS {
        let topic = topics
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        let content = match llm::generate_email_content(generator, day, &topic, options).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Using built-in content for day {}: {}", day, e);
                fallback_content(day, &topic)
            }
        };

        let id = storage::insert_template(
            conn,
            program_id,
            &NewEmailTemplate {
                day_offset: day,
                subject: content.subject,
                body: content.body,
                phishing_example: content.phishing_example,
                course_id: None,
                topic_id: storage::topic_id_by_name(conn, &topic)?,
            },
            now,
        )?;
        ids.push(id);
    }

    info!(
        "Generated {} scheduled emails for program {}",
        ids.len(),
        program_id
    );
    Ok(ids)
}
