//! Command handlers behind the CLI
//!
//! Each handler opens what it needs from the data directory, does one job
//! and prints the result to stdout (JSON for data, short lines for actions).

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{self, CONFIG_FILE, Config, DB_FILE, DEFAULT_CONFIG};
use crate::email::{self, OutboxMailer};
use crate::host::SqliteHost;
use crate::llm::{self, LlmClient};
use crate::programs::{self, CreatedProgram};
use crate::reports;
use crate::scheduler::{Scheduler, Task};
use crate::storage::{
    self, EmailTemplateUpdate, NewCourseMapping, NewEmailTemplate, NewProgram, ProgramUpdate,
};
use crate::tracking::{PathChange, PathSelector, PathType, ProgressTracker, SweepReport};

/// Resolved data directory plus loaded configuration
pub struct Context {
    pub data_dir: PathBuf,
    pub config: Config,
}

impl Context {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let data_dir = config::get_data_dir(explicit)?;
        let config = Config::load(&data_dir.join(CONFIG_FILE))?;
        debug!("Using data directory {}", data_dir.display());
        Ok(Self { data_dir, config })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    /// Open the database, failing when `init` has not run
    pub fn open(&self) -> Result<Connection> {
        let db_path = self.db_path();
        if !db_path.exists() {
            bail!(
                "No database at {}. Run 'masterytrack init' first",
                db_path.display()
            );
        }
        Ok(storage::open(&db_path)?)
    }

    /// Host collaborators over a second connection to the same database
    pub fn host(&self) -> Result<SqliteHost> {
        Ok(SqliteHost::open(&self.db_path())?)
    }

    pub fn mailer(&self) -> OutboxMailer {
        OutboxMailer::new(self.config.outbox_path(&self.data_dir))
    }

    pub fn llm(&self) -> LlmClient {
        LlmClient::new(self.config.llm.clone())
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Setup and status
// ---------------------------------------------------------------------------

pub fn init(ctx: &Context) -> Result<()> {
    std::fs::create_dir_all(&ctx.data_dir)
        .with_context(|| format!("Failed to create {}", ctx.data_dir.display()))?;

    let config_path = ctx.data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        std::fs::write(&config_path, DEFAULT_CONFIG)?;
        info!("Wrote default config to {}", config_path.display());
    }

    let conn = storage::open(&ctx.db_path())?;
    storage::init_schema(&conn)?;

    println!("✅ Initialized {}", ctx.data_dir.display());
    Ok(())
}

pub fn status(ctx: &Context) -> Result<()> {
    println!("masterytrack status");
    println!("===================");
    println!();

    if !ctx.db_path().exists() {
        println!("Status: NOT INITIALIZED");
        println!("Run 'masterytrack init' to initialize");
        return Ok(());
    }

    let conn = ctx.open()?;
    let counts = storage::counts(&conn)?;

    println!("Data directory: {}", ctx.data_dir.display());
    println!(
        "Scheduled sweeps: {}",
        if ctx.config.general.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "LLM: {} ({})",
        ctx.config.llm.provider,
        if ctx.config.llm.is_configured() { "configured" } else { "not configured" }
    );
    println!();
    println!("Programs: {} ({} active)", counts.programs, counts.active_programs);
    println!("Learners: {} ({} mastered)", counts.learners, counts.mastered);
    println!("Completions: {}", counts.completions);
    println!(
        "Email templates: {} ({} emails sent)",
        counts.email_templates, counts.emails_sent
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Programs and course mappings
// ---------------------------------------------------------------------------

pub fn create_program(ctx: &Context, program: &NewProgram) -> Result<()> {
    let mut conn = ctx.open()?;
    let host = ctx.host()?;
    let CreatedProgram { id, enrolled } =
        programs::create_program(&mut conn, &host, program, Utc::now())?;
    println!("✅ Created program {} with {} learners", id, enrolled);
    Ok(())
}

pub fn list_programs(ctx: &Context, active_only: bool) -> Result<()> {
    let conn = ctx.open()?;
    print_json(&storage::list_programs(&conn, active_only)?)
}

pub fn show_program(ctx: &Context, program_id: i64) -> Result<()> {
    let conn = ctx.open()?;
    let program = storage::get_program(&conn, program_id)?;
    let courses = programs::program_courses(&conn, program_id, None)?;
    let learners = storage::list_progress_for_program(&conn, program_id)?;
    print_json(&json!({
        "program": program,
        "courses": courses,
        "learners": learners.len(),
    }))
}

pub fn update_program(ctx: &Context, program_id: i64, update: &ProgramUpdate) -> Result<()> {
    let conn = ctx.open()?;
    let program = programs::update_program(&conn, program_id, update, Utc::now())?;
    print_json(&program)
}

pub fn delete_program(ctx: &Context, program_id: i64) -> Result<()> {
    let mut conn = ctx.open()?;
    if !programs::delete_program(&mut conn, program_id)? {
        bail!("Program {} not found", program_id);
    }
    println!("✅ Deleted program {}", program_id);
    Ok(())
}

pub fn enrol_cohort(ctx: &Context, program_id: i64, cohort_id: i64) -> Result<()> {
    let mut conn = ctx.open()?;
    let host = ctx.host()?;
    let added = programs::enroll_cohort_members(&mut conn, &host, program_id, cohort_id, Utc::now())?;
    println!("✅ Enrolled {} new learners in program {}", added, program_id);
    Ok(())
}

/// Topic and tactic names as given on the command line
pub struct CatalogueNames<'a> {
    pub topic: Option<&'a str>,
    pub tactic: Option<&'a str>,
}

pub fn add_course(
    ctx: &Context,
    program_id: i64,
    mut mapping: NewCourseMapping,
    names: CatalogueNames<'_>,
) -> Result<()> {
    let conn = ctx.open()?;
    if let Some(name) = names.topic {
        mapping.topic_id = Some(
            storage::topic_id_by_name(&conn, name)?
                .with_context(|| format!("Unknown topic '{}'", name))?,
        );
    }
    if let Some(name) = names.tactic {
        mapping.tactic_id = Some(
            storage::tactic_id_by_name(&conn, name)?
                .with_context(|| format!("Unknown tactic '{}'", name))?,
        );
    }

    let id = programs::add_course_to_program(&conn, program_id, &mapping, Utc::now())?;
    println!(
        "✅ Mapped course {} into program {} ({} path, {} points) as mapping {}",
        mapping.course_id, program_id, mapping.path_type, mapping.points, id
    );
    Ok(())
}

pub fn list_courses(ctx: &Context, program_id: i64, path: Option<PathType>) -> Result<()> {
    let conn = ctx.open()?;
    storage::get_program(&conn, program_id)?;
    print_json(&programs::program_courses(&conn, program_id, path)?)
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

pub fn complete(
    ctx: &Context,
    user_id: i64,
    program_id: i64,
    course_id: i64,
    grade: f64,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    let mut conn = ctx.open()?;
    let host = ctx.host()?;
    let mut tracker = ProgressTracker::new(&mut conn, &host, ctx.config.paths.enrolment_check);
    let outcome = match at {
        Some(at) => {
            tracker.record_completion_at(user_id, program_id, course_id, grade, at, Utc::now())?
        }
        None => tracker.record_completion(user_id, program_id, course_id, grade)?,
    };
    print_json(&outcome)
}

pub fn recompute(ctx: &Context, user_id: i64, program_id: i64) -> Result<()> {
    let mut conn = ctx.open()?;
    let host = ctx.host()?;
    let progress = storage::find_progress(&conn, program_id, user_id)?
        .with_context(|| format!("User {} has no progress in program {}", user_id, program_id))?;

    let mut tracker = ProgressTracker::new(&mut conn, &host, ctx.config.paths.enrolment_check);
    let result = tracker.recompute_total(progress.id, Utc::now())?;
    print_json(&json!({
        "progress_id": progress.id,
        "total_points": result.total_points,
        "mastery_achieved": result.mastery_achieved,
        "newly_mastered": result.newly_mastered,
    }))
}

/// Re-evaluate one learner's path, on a given grade or on the trailing window
pub fn evaluate(ctx: &Context, user_id: i64, program_id: i64, grade: Option<f64>) -> Result<()> {
    let mut conn = ctx.open()?;
    let host = ctx.host()?;
    let now = Utc::now();

    let change = match grade {
        Some(grade) => PathSelector::new(&mut conn, &host, ctx.config.paths.enrolment_check)
            .evaluate_and_apply(user_id, program_id, grade, now)?,
        None => match storage::find_progress(&conn, program_id, user_id)? {
            Some(progress) => PathSelector::new(&mut conn, &host, ctx.config.paths.enrolment_check)
                .evaluate_window(&progress, ctx.config.paths.window_days, now)?,
            None => PathChange::NotApplicable,
        },
    };
    if change.is_changed() {
        info!("Moved user {} to a new path in program {}", user_id, program_id);
    }
    print_json(&change)
}

// ---------------------------------------------------------------------------
// Sweeps and the scheduler
// ---------------------------------------------------------------------------

fn run_progress_sweep(ctx: &Context, now: DateTime<Utc>) -> crate::error::Result<SweepReport> {
    let mut conn = storage::open(&ctx.db_path())?;
    let host = SqliteHost::open(&ctx.db_path())?;
    crate::tracking::sweep_progress(&mut conn, &host, &host, &ctx.config.paths, now)
}

fn run_path_sweep(ctx: &Context, now: DateTime<Utc>) -> crate::error::Result<SweepReport> {
    let mut conn = storage::open(&ctx.db_path())?;
    let host = SqliteHost::open(&ctx.db_path())?;
    crate::tracking::sweep_paths(&mut conn, &host, &ctx.config.paths, now)
}

fn run_email_send(
    ctx: &Context,
    program_id: Option<i64>,
    now: DateTime<Utc>,
) -> crate::error::Result<email::EmailStats> {
    let conn = storage::open(&ctx.db_path())?;
    let host = SqliteHost::open(&ctx.db_path())?;
    email::send_scheduled_emails(&conn, &host, &ctx.mailer(), &ctx.config.email, program_id, now)
}

pub fn sweep_progress(ctx: &Context) -> Result<()> {
    ctx.open()?;
    print_json(&run_progress_sweep(ctx, Utc::now())?)
}

pub fn sweep_paths(ctx: &Context) -> Result<()> {
    ctx.open()?;
    print_json(&run_path_sweep(ctx, Utc::now())?)
}

pub fn send_emails(ctx: &Context, program_id: Option<i64>) -> Result<()> {
    ctx.open()?;
    print_json(&run_email_send(ctx, program_id, Utc::now())?)
}

/// One scheduled occurrence; a disabled config turns it into a no-op
fn run_task(ctx: &Context, task: Task, now: DateTime<Utc>) -> crate::error::Result<()> {
    if !ctx.config.general.enabled {
        debug!("Scheduled sweeps disabled, skipping {}", task);
        return Ok(());
    }

    match task {
        Task::SendEmails => {
            run_email_send(ctx, None, now)?;
        }
        Task::UpdateProgress => {
            run_progress_sweep(ctx, now)?;
        }
        Task::AssignPaths => {
            run_path_sweep(ctx, now)?;
        }
    }
    Ok(())
}

pub fn run(ctx: &Context) -> Result<()> {
    ctx.open()?;
    let scheduler = Scheduler::from_config(&ctx.config.schedule)?;
    if !ctx.config.general.enabled {
        info!("Scheduled sweeps are disabled in config; the loop will idle");
    }
    scheduler.run(|task, now| run_task(ctx, task, now))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

pub fn user_report(ctx: &Context, user_id: i64, program_id: i64) -> Result<()> {
    let conn = ctx.open()?;
    let host = ctx.host()?;
    let report = reports::individual_report(&conn, &host, user_id, program_id)?
        .with_context(|| format!("User {} has no progress in program {}", user_id, program_id))?;
    print_json(&report)
}

pub fn group_report(ctx: &Context, program_id: i64) -> Result<()> {
    let conn = ctx.open()?;
    print_json(&reports::group_statistics(&conn, program_id)?)
}

// ---------------------------------------------------------------------------
// Email templates
// ---------------------------------------------------------------------------

pub async fn generate_emails(ctx: &Context, program_id: i64, topics: &[String]) -> Result<()> {
    let conn = ctx.open()?;
    let client = ctx.llm();
    if !client.config().is_configured() {
        info!("LLM not configured, using built-in email content");
    }

    let ids = email::generate_email_schedule(
        &conn,
        &client,
        program_id,
        topics,
        &ctx.config.llm.options(),
        Utc::now(),
    )
    .await?;
    println!("✅ Created {} email templates for program {}", ids.len(), program_id);
    Ok(())
}

pub fn list_emails(ctx: &Context, program_id: i64, active_only: bool) -> Result<()> {
    let conn = ctx.open()?;
    print_json(&storage::list_templates(&conn, program_id, active_only)?)
}

pub fn add_email(
    ctx: &Context,
    program_id: i64,
    mut template: NewEmailTemplate,
    topic: Option<&str>,
) -> Result<()> {
    let conn = ctx.open()?;
    storage::get_program(&conn, program_id)?;
    if let Some(name) = topic {
        template.topic_id = Some(
            storage::topic_id_by_name(&conn, name)?
                .with_context(|| format!("Unknown topic '{}'", name))?,
        );
    }
    let id = storage::insert_template(&conn, program_id, &template, Utc::now())?;
    println!("✅ Added email {} (day {})", id, template.day_offset);
    Ok(())
}

pub fn update_email(ctx: &Context, email_id: i64, update: &EmailTemplateUpdate) -> Result<()> {
    let conn = ctx.open()?;
    print_json(&storage::update_template(&conn, email_id, update)?)
}

pub fn delete_email(ctx: &Context, email_id: i64) -> Result<()> {
    let conn = ctx.open()?;
    if !storage::delete_template(&conn, email_id)? {
        bail!("Email template {} not found", email_id);
    }
    println!("✅ Deleted email {}", email_id);
    Ok(())
}

// ---------------------------------------------------------------------------
// LLM assistance
// ---------------------------------------------------------------------------

pub async fn tag_course(ctx: &Context, course_id: i64) -> Result<()> {
    let conn = ctx.open()?;
    let host = ctx.host()?;
    let client = ctx.llm();
    let tags = llm::tag_course(&conn, &host, &client, course_id, &ctx.config.llm.options())
        .await?
        .with_context(|| format!("Course {} not found", course_id))?;
    print_json(&tags)
}

pub fn approve_tags(ctx: &Context, course_id: i64) -> Result<()> {
    let conn = ctx.open()?;
    let tags = storage::find_tags_for_course(&conn, course_id)?
        .with_context(|| format!("Course {} has no suggested tags", course_id))?;
    storage::approve_tags(&conn, tags.id)?;
    println!("✅ Approved tags for course {}", course_id);
    Ok(())
}

pub async fn suggest_paths(ctx: &Context, program_id: i64) -> Result<()> {
    let conn = ctx.open()?;
    let client = ctx.llm();
    let suggestion =
        llm::suggest_paths(&conn, &client, program_id, &ctx.config.llm.options()).await?;
    print_json(&suggestion)
}

// ---------------------------------------------------------------------------
// Host tables
// ---------------------------------------------------------------------------

pub fn host_add_user(ctx: &Context, id: i64, firstname: &str, lastname: &str, email: &str) -> Result<()> {
    ctx.open()?;
    ctx.host()?.add_user(id, firstname, lastname, email)?;
    println!("✅ Saved user {}", id);
    Ok(())
}

pub fn host_add_course(ctx: &Context, id: i64, fullname: &str, shortname: &str, summary: &str) -> Result<()> {
    ctx.open()?;
    ctx.host()?.add_course(id, fullname, shortname, summary)?;
    println!("✅ Saved course {}", id);
    Ok(())
}

pub fn host_add_cohort_member(ctx: &Context, cohort_id: i64, user_id: i64) -> Result<()> {
    ctx.open()?;
    ctx.host()?.add_cohort_member(cohort_id, user_id)?;
    println!("✅ Added user {} to cohort {}", user_id, cohort_id);
    Ok(())
}

pub fn host_complete_course(
    ctx: &Context,
    user_id: i64,
    course_id: i64,
    grade: Option<f64>,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    ctx.open()?;
    ctx.host()?
        .record_course_completion(user_id, course_id, at.unwrap_or_else(Utc::now), grade)?;
    println!("✅ Recorded completion of course {} by user {}", course_id, user_id);
    Ok(())
}

pub fn host_enrolments(ctx: &Context, user_id: i64) -> Result<()> {
    ctx.open()?;
    print_json(&ctx.host()?.enrolments(user_id)?)
}

// ---------------------------------------------------------------------------
// Demo
// ---------------------------------------------------------------------------

const DEMO_COHORT: i64 = 1;

const DEMO_USERS: [(i64, &str, &str); 5] = [
    (1001, "Alice", "Anders"),
    (1002, "Bilal", "Bakr"),
    (1003, "Chen", "Cho"),
    (1004, "Dana", "Diaz"),
    (1005, "Emeka", "Eze"),
];

/// (course id, name, points, path, topic, tactic)
const DEMO_COURSES: [(i64, &str, i64, PathType, &str, &str); 8] = [
    (101, "Phishing Fundamentals", 3, PathType::Standard, "General Phishing", "Credential Phish"),
    (102, "Spotting Malicious Links", 5, PathType::Standard, "Safe Web Browsing", "URL Phish"),
    (103, "Business Email Compromise", 7, PathType::Standard, "Financial Transactions", "BEC/CEO Fraud"),
    (104, "Ransomware Response", 12, PathType::Standard, "Ransomware", "Attachment Phish"),
    (201, "Security Basics Refresher", 3, PathType::Remedial, "General Phishing", "Credential Phish"),
    (202, "Reporting Suspicious Email", 5, PathType::Remedial, "Reporting", "URL Phish"),
    (301, "Advanced Social Engineering", 12, PathType::Challenge, "Emotions", "BEC/CEO Fraud"),
    (302, "Targeted Spear Phishing", 15, PathType::Challenge, "Spear Phishing", "QR Codes"),
];

/// Seed a cohort, users, courses and a program with an email cadence
pub async fn demo(ctx: &Context) -> Result<()> {
    init(ctx)?;
    let mut conn = ctx.open()?;
    let host = ctx.host()?;

    for (id, firstname, lastname) in DEMO_USERS {
        let email = format!("{}@example.com", firstname.to_lowercase());
        host.add_user(id, firstname, lastname, &email)?;
        host.add_cohort_member(DEMO_COHORT, id)?;
    }
    for (id, name, ..) in DEMO_COURSES {
        host.add_course(id, name, &format!("DEMO{}", id), &format!("Demo course: {}", name))?;
    }

    let now = Utc::now();
    let mut program = NewProgram::new("Phishing Awareness Mastery (demo)", now);
    program.description = "Sample program seeded by 'masterytrack demo'".to_string();
    program.cohort_id = Some(DEMO_COHORT);
    let CreatedProgram { id, enrolled } = programs::create_program(&mut conn, &host, &program, now)?;

    for (sequence, (course_id, _, points, path, topic, tactic)) in DEMO_COURSES.into_iter().enumerate() {
        let mut mapping = NewCourseMapping::new(course_id, points, path);
        mapping.sequence_order = sequence as i64 + 1;
        mapping.topic_id = storage::topic_id_by_name(&conn, topic)?;
        mapping.tactic_id = storage::tactic_id_by_name(&conn, tactic)?;
        programs::add_course_to_program(&conn, id, &mapping, now)?;
    }

    let client = ctx.llm();
    let emails = email::generate_email_schedule(
        &conn,
        &client,
        id,
        &[],
        &ctx.config.llm.options(),
        now,
    )
    .await?;

    println!("✅ Demo program {} created", id);
    println!("   Learners enrolled: {}", enrolled);
    println!("   Courses mapped: {}", DEMO_COURSES.len());
    println!("   Email templates: {}", emails.len());
    println!();
    println!("Try:");
    println!("   masterytrack complete --user 1001 --program {} --course 101 --grade 62", id);
    println!("   masterytrack report user --user 1001 --program {}", id);
    Ok(())
}
