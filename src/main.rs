use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod email;
mod error;
mod host;
mod llm;
mod programs;
mod reports;
mod scheduler;
mod storage;
mod tracking;

use commands::{CatalogueNames, Context};
use storage::{EmailTemplateUpdate, NewCourseMapping, NewEmailTemplate, NewProgram, ProgramUpdate};
use tracking::PathType;

/// masterytrack - adaptive mastery tracking for security-awareness programs
#[derive(Parser)]
#[command(name = "masterytrack")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mastery-track progress, adaptive learning paths and training email cadence", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (defaults to $MASTERYTRACK_DIR, ./.masterytrack or ~/.masterytrack)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, config file and database
    Init,

    /// Show current status and counts
    Status,

    /// Manage programs
    Program {
        #[command(subcommand)]
        action: ProgramAction,
    },

    /// Map courses into program paths
    Course {
        #[command(subcommand)]
        action: CourseAction,
    },

    /// Record a course completion and re-evaluate the learner's path
    Complete {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        program: i64,
        #[arg(long)]
        course: i64,
        /// Final grade, 0-100
        #[arg(long)]
        grade: f64,
        /// Completion time (YYYY-MM-DD or RFC 3339), defaults to now
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
    },

    /// Recompute a learner's total points from their point records
    Recompute {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        program: i64,
    },

    /// Re-evaluate a learner's path on one grade, or on the trailing window
    Evaluate {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        program: i64,
        /// Grade to classify; omit to use the rolling window average
        #[arg(long)]
        grade: Option<f64>,
    },

    /// Run one sweep now
    Sweep {
        #[command(subcommand)]
        task: SweepTask,
    },

    /// Progress reports
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Manage scheduled email templates
    Email {
        #[command(subcommand)]
        action: EmailAction,
    },

    /// LLM-assisted course tagging and path suggestions
    Llm {
        #[command(subcommand)]
        action: LlmAction,
    },

    /// Run the scheduler in the foreground until Ctrl-C
    Run,

    /// Seed a sample cohort, courses and program
    Demo,

    /// Edit the host-platform tables (users, courses, cohorts, completions)
    Host {
        #[command(subcommand)]
        action: HostAction,
    },
}

#[derive(Subcommand)]
enum ProgramAction {
    /// Create a program; cohort members start on the standard path
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        cohort: Option<i64>,
        /// Start date (YYYY-MM-DD or RFC 3339), defaults to now
        #[arg(long, value_parser = parse_time)]
        start: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_time)]
        end: Option<DateTime<Utc>>,
        /// Points needed for mastery
        #[arg(long, default_value_t = storage::DEFAULT_MASTERY_GOAL)]
        goal: i64,
        /// Create the program inactive
        #[arg(long)]
        inactive: bool,
    },

    /// List programs
    List {
        /// Only active programs
        #[arg(long)]
        active: bool,
    },

    /// Show a program with its courses
    Show {
        #[arg(long)]
        id: i64,
    },

    /// Update program fields
    Update {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        cohort: Option<i64>,
        #[arg(long, value_parser = parse_time)]
        start: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_time)]
        end: Option<DateTime<Utc>>,
        #[arg(long)]
        goal: Option<i64>,
        #[arg(long)]
        active: Option<bool>,
    },

    /// Delete a program and all its data
    Delete {
        #[arg(long)]
        id: i64,
    },

    /// Start every cohort member without progress yet
    EnrolCohort {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        cohort: i64,
    },
}

#[derive(Subcommand)]
enum CourseAction {
    /// Map a course into one path of a program
    Add {
        #[arg(long)]
        program: i64,
        #[arg(long)]
        course: i64,
        #[arg(long)]
        points: i64,
        /// standard, remedial or challenge
        #[arg(long, default_value = "standard")]
        path: PathType,
        /// Webb's depth-of-knowledge level, 1-4
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..=4))]
        dok: i64,
        #[arg(long, default_value_t = 0)]
        sequence: i64,
        /// Topic name from the catalogue
        #[arg(long)]
        topic: Option<String>,
        /// Tactic name from the catalogue
        #[arg(long)]
        tactic: Option<String>,
        #[arg(long)]
        prerequisite: Option<f64>,
    },

    /// List a program's courses in sequence order
    List {
        #[arg(long)]
        program: i64,
        #[arg(long)]
        path: Option<PathType>,
    },
}

#[derive(Subcommand)]
enum SweepTask {
    /// Record host completions not seen yet
    Progress,
    /// Re-evaluate every learner on their trailing window
    Paths,
    /// Send due emails
    Emails {
        /// Limit to one program
        #[arg(long)]
        program: Option<i64>,
    },
}

#[derive(Subcommand)]
enum ReportAction {
    /// Individual progress report
    User {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        program: i64,
    },
    /// Group statistics for a program
    Group {
        #[arg(long)]
        program: i64,
    },
}

#[derive(Subcommand)]
enum EmailAction {
    /// Create the default cadence of templates for a program
    Generate {
        #[arg(long)]
        program: i64,
        /// Topic to draw from (repeatable)
        #[arg(long = "topic")]
        topics: Vec<String>,
    },

    /// List a program's templates
    List {
        #[arg(long)]
        program: i64,
        /// Include inactive templates
        #[arg(long)]
        all: bool,
    },

    /// Add a template by hand
    Add {
        #[arg(long)]
        program: i64,
        /// Days after program start
        #[arg(long)]
        day: i64,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        #[arg(long, default_value = "")]
        phishing_example: String,
        #[arg(long)]
        course: Option<i64>,
        #[arg(long)]
        topic: Option<String>,
    },

    /// Update a template
    Update {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        phishing_example: Option<String>,
        #[arg(long)]
        course: Option<i64>,
        #[arg(long)]
        active: Option<bool>,
    },

    /// Delete a template and its send log
    Delete {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand)]
enum LlmAction {
    /// Suggest tags for a course (stored unapproved)
    Tag {
        #[arg(long)]
        course: i64,
    },
    /// Approve a course's suggested tags
    Approve {
        #[arg(long)]
        course: i64,
    },
    /// Suggest path sequences for a program
    Paths {
        #[arg(long)]
        program: i64,
    },
}

#[derive(Subcommand)]
enum HostAction {
    AddUser {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        firstname: String,
        #[arg(long)]
        lastname: String,
        #[arg(long)]
        email: String,
    },
    AddCourse {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        shortname: String,
        #[arg(long, default_value = "")]
        summary: String,
    },
    AddCohortMember {
        #[arg(long)]
        cohort: i64,
        #[arg(long)]
        user: i64,
    },
    /// Record a completion in the host feed (picked up by `sweep progress`)
    CompleteCourse {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        course: i64,
        #[arg(long)]
        grade: Option<f64>,
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
    },
    /// List a learner's course enrolments
    Enrolments {
        #[arg(long)]
        user: i64,
    },
}

/// Accept a bare date (midnight UTC) or a full RFC 3339 timestamp
fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("expected YYYY-MM-DD or RFC 3339, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // stdout carries command output
        .init();

    let ctx = Context::load(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Init => commands::init(&ctx)?,
        Commands::Status => commands::status(&ctx)?,
        Commands::Program { action } => match action {
            ProgramAction::Create { name, description, cohort, start, end, goal, inactive } => {
                let mut program = NewProgram::new(name, start.unwrap_or_else(Utc::now));
                program.description = description;
                program.cohort_id = cohort;
                program.end_date = end;
                program.mastery_goal = goal;
                program.active = !inactive;
                commands::create_program(&ctx, &program)?;
            }
            ProgramAction::List { active } => commands::list_programs(&ctx, active)?,
            ProgramAction::Show { id } => commands::show_program(&ctx, id)?,
            ProgramAction::Update { id, name, description, cohort, start, end, goal, active } => {
                let update = ProgramUpdate {
                    name,
                    description,
                    cohort_id: cohort,
                    start_date: start,
                    end_date: end,
                    mastery_goal: goal,
                    active,
                };
                commands::update_program(&ctx, id, &update)?;
            }
            ProgramAction::Delete { id } => commands::delete_program(&ctx, id)?,
            ProgramAction::EnrolCohort { id, cohort } => commands::enrol_cohort(&ctx, id, cohort)?,
        },
        Commands::Course { action } => match action {
            CourseAction::Add {
                program,
                course,
                points,
                path,
                dok,
                sequence,
                topic,
                tactic,
                prerequisite,
            } => {
                let mut mapping = NewCourseMapping::new(course, points, path);
                mapping.dok_level = dok;
                mapping.sequence_order = sequence;
                mapping.prerequisite_score = prerequisite;
                let names = CatalogueNames {
                    topic: topic.as_deref(),
                    tactic: tactic.as_deref(),
                };
                commands::add_course(&ctx, program, mapping, names)?;
            }
            CourseAction::List { program, path } => commands::list_courses(&ctx, program, path)?,
        },
        Commands::Complete { user, program, course, grade, at } => {
            commands::complete(&ctx, user, program, course, grade, at)?;
        }
        Commands::Recompute { user, program } => commands::recompute(&ctx, user, program)?,
        Commands::Evaluate { user, program, grade } => {
            commands::evaluate(&ctx, user, program, grade)?;
        }
        Commands::Sweep { task } => match task {
            SweepTask::Progress => commands::sweep_progress(&ctx)?,
            SweepTask::Paths => commands::sweep_paths(&ctx)?,
            SweepTask::Emails { program } => commands::send_emails(&ctx, program)?,
        },
        Commands::Report { action } => match action {
            ReportAction::User { user, program } => commands::user_report(&ctx, user, program)?,
            ReportAction::Group { program } => commands::group_report(&ctx, program)?,
        },
        Commands::Email { action } => match action {
            EmailAction::Generate { program, topics } => {
                commands::generate_emails(&ctx, program, &topics).await?;
            }
            EmailAction::List { program, all } => commands::list_emails(&ctx, program, !all)?,
            EmailAction::Add { program, day, subject, body, phishing_example, course, topic } => {
                let template = NewEmailTemplate {
                    day_offset: day,
                    subject,
                    body,
                    phishing_example,
                    course_id: course,
                    topic_id: None,
                };
                commands::add_email(&ctx, program, template, topic.as_deref())?;
            }
            EmailAction::Update { id, subject, body, phishing_example, course, active } => {
                let update = EmailTemplateUpdate {
                    subject,
                    body,
                    phishing_example,
                    course_id: course,
                    active,
                };
                commands::update_email(&ctx, id, &update)?;
            }
            EmailAction::Delete { id } => commands::delete_email(&ctx, id)?,
        },
        Commands::Llm { action } => match action {
            LlmAction::Tag { course } => commands::tag_course(&ctx, course).await?,
            LlmAction::Approve { course } => commands::approve_tags(&ctx, course)?,
            LlmAction::Paths { program } => commands::suggest_paths(&ctx, program).await?,
        },
        Commands::Run => commands::run(&ctx)?,
        Commands::Demo => commands::demo(&ctx).await?,
        Commands::Host { action } => match action {
            HostAction::AddUser { id, firstname, lastname, email } => {
                commands::host_add_user(&ctx, id, &firstname, &lastname, &email)?;
            }
            HostAction::AddCourse { id, name, shortname, summary } => {
                commands::host_add_course(&ctx, id, &name, &shortname, &summary)?;
            }
            HostAction::AddCohortMember { cohort, user } => {
                commands::host_add_cohort_member(&ctx, cohort, user)?;
            }
            HostAction::CompleteCourse { user, course, grade, at } => {
                commands::host_complete_course(&ctx, user, course, grade, at)?;
            }
            HostAction::Enrolments { user } => commands::host_enrolments(&ctx, user)?,
        },
    }

    Ok(())
}
