//! Mail transport and the scheduled send run

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::render::{course_links, render_email};
use crate::config::EmailConfig;
use crate::error::{Result, TrackError};
use crate::host::Directory;
use crate::storage::{self, EmailTemplate, Program, Progress};

/// A message ready for the transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub to_name: String,
    pub from: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Mail transport
pub trait Mailer {
    fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

/// Appends each message as one JSON line to an outbox file
pub struct OutboxMailer {
    path: PathBuf,
}

#[derive(Serialize)]
struct OutboxLine<'a> {
    queued_at: DateTime<Utc>,
    #[serde(flatten)]
    email: &'a OutgoingEmail,
}

impl OutboxMailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Mailer for OutboxMailer {
    fn send(&self, email: &OutgoingEmail) -> Result<()> {
        if email.to.trim().is_empty() {
            return Err(TrackError::Delivery(format!("no address for {}", email.to_name)));
        }

        let line = serde_json::to_string(&OutboxLine {
            queued_at: Utc::now(),
            email,
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TrackError::Delivery(format!("{}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", line).map_err(|e| TrackError::Delivery(e.to_string()))?;

        debug!("Queued '{}' for {}", email.subject, email.to);
        Ok(())
    }
}

/// Totals from one send run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmailStats {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Send every due template to every learner of the active programs
///
/// Templates already sent to a learner are skipped. A failed send is logged
/// with `sent = 0`, so the next run tries again. A learner or program that
/// cannot be processed is counted as failed and the run moves on.
pub fn send_scheduled_emails(
    conn: &Connection,
    directory: &dyn Directory,
    mailer: &dyn Mailer,
    config: &EmailConfig,
    program_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EmailStats> {
    let mut stats = EmailStats::default();

    for program in storage::list_programs(conn, true)? {
        if program_id.is_some_and(|id| id != program.id) {
            continue;
        }
        if let Err(e) = send_program_emails(conn, directory, mailer, config, &program, now, &mut stats) {
            warn!("Email run for program {} stopped early: {}", program.id, e);
            stats.failed += 1;
        }
    }

    info!(
        "Email run: sent {}, failed {}, skipped {}",
        stats.sent, stats.failed, stats.skipped
    );
    Ok(stats)
}

/// Whole days since program start, rounded down
fn days_elapsed(program: &Program, now: DateTime<Utc>) -> i64 {
    (now - program.start_date).num_seconds().div_euclid(86_400)
}

fn send_program_emails(
    conn: &Connection,
    directory: &dyn Directory,
    mailer: &dyn Mailer,
    config: &EmailConfig,
    program: &Program,
    now: DateTime<Utc>,
    stats: &mut EmailStats,
) -> Result<()> {
    let days = days_elapsed(program, now);
    let due: Vec<_> = storage::list_templates(conn, program.id, true)?
        .into_iter()
        .filter(|t| days >= t.day_offset)
        .collect();
    if due.is_empty() {
        return Ok(());
    }

    for progress in storage::list_progress_for_program(conn, program.id)? {
        let learner = LearnerRun {
            conn,
            directory,
            mailer,
            config,
            program,
            progress: &progress,
            now,
        };
        if let Err(e) = learner.send_due(&due, stats) {
            warn!(
                "Emails for user {} in program {} failed: {}",
                progress.user_id, program.id, e
            );
            stats.failed += 1;
        }
    }

    Ok(())
}

/// Everything needed to send one learner their due templates
struct LearnerRun<'a> {
    conn: &'a Connection,
    directory: &'a dyn Directory,
    mailer: &'a dyn Mailer,
    config: &'a EmailConfig,
    program: &'a Program,
    progress: &'a Progress,
    now: DateTime<Utc>,
}

impl LearnerRun<'_> {
    fn send_due(&self, due: &[EmailTemplate], stats: &mut EmailStats) -> Result<()> {
        let (conn, program, progress) = (self.conn, self.program, self.progress);
        let Some(learner) = self.directory.user(progress.user_id)? else {
            warn!("User {} not in directory, skipping emails", progress.user_id);
            stats.skipped += 1;
            return Ok(());
        };

        for template in due {
            let log = storage::find_log(conn, template.id, learner.id, program.id)?;
            if log.is_some_and(|l| l.sent) {
                stats.skipped += 1;
                continue;
            }

            let links = course_links(
                conn,
                self.directory,
                program.id,
                progress.current_path,
                &self.config.site_url,
            )?;
            let rendered = render_email(template, &learner, program, progress, &links);
            let email = OutgoingEmail {
                to: learner.email.clone(),
                to_name: format!("{} {}", learner.firstname, learner.lastname),
                from: self.config.from_address.clone(),
                subject: rendered.subject,
                text_body: rendered.text_body,
                html_body: rendered.html_body,
            };

            match self.mailer.send(&email) {
                Ok(()) => {
                    storage::record_attempt(conn, template.id, learner.id, program.id, Ok(self.now))?;
                    stats.sent += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to send email {} to user {}: {}",
                        template.id, learner.id, e
                    );
                    storage::record_attempt(
                        conn,
                        template.id,
                        learner.id,
                        program.id,
                        Err(e.to_string().as_str()),
                    )?;
                    stats.failed += 1;
                }
            }
        }

        Ok(())
    }
}
