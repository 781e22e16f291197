//! Configuration for masterytrack
//!
//! Settings live in `config.toml` inside the data directory. Every section
//! has defaults, so a partial (or missing) file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::llm::LlmConfig;
use crate::scheduler::ScheduleConfig;

/// Environment variable that overrides the data directory
pub const DATA_DIR_ENV: &str = "MASTERYTRACK_DIR";

/// Environment variable that overrides `llm.api_key`
pub const API_KEY_ENV: &str = "MASTERYTRACK_LLM_API_KEY";

pub const DB_FILE: &str = "masterytrack.sqlite";
pub const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub llm: LlmConfig,
    pub paths: PathConfig,
    pub email: EmailConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// When false, scheduled sweeps do nothing
    pub enabled: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// How `enroll_in_path` decides a learner already has a course
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrolmentCheck {
    /// Skip a course only if the learner is enrolled in that course
    #[default]
    PerCourse,
    /// Skip every course once the learner holds any enrolment at all
    AnyCourse,
}

/// Adaptive path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub enrolment_check: EnrolmentCheck,
    /// Trailing window for the rolling-average sweep
    pub window_days: i64,
    /// Leave learners who reached mastery out of the path sweep
    pub skip_mastered: bool,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            enrolment_check: EnrolmentCheck::PerCourse,
            window_days: 7,
            skip_mastered: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// Base URL used to build course links
    pub site_url: String,
    pub from_address: String,
    /// Outbox file, relative to the data directory unless absolute
    pub outbox: PathBuf,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            site_url: "http://localhost".to_string(),
            from_address: "noreply@localhost".to_string(),
            outbox: PathBuf::from("outbox.jsonl"),
        }
    }
}

impl Config {
    /// Load configuration from file, applying env overrides
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content).map_err(|e| {
                crate::error::TrackError::Parse(format!("{}: {}", config_path.display(), e))
            })?
        } else {
            Config::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                config.llm.api_key = key;
            }
        }

        Ok(config)
    }

    /// Resolve the outbox path against the data directory
    pub fn outbox_path(&self, data_dir: &Path) -> PathBuf {
        if self.email.outbox.is_absolute() {
            self.email.outbox.clone()
        } else {
            data_dir.join(&self.email.outbox)
        }
    }
}

/// Commented default written by `masterytrack init`
pub const DEFAULT_CONFIG: &str = r#"# masterytrack configuration

[general]
# Set to false to pause all scheduled sweeps
enabled = true

[llm]
# openai, anthropic or custom
provider = "openai"
endpoint = ""
model = "gpt-4"
# Prefer the MASTERYTRACK_LLM_API_KEY environment variable
api_key = ""
max_tokens = 1000
temperature = 0.7

[paths]
# per_course: skip only courses the learner already has
# any_course: skip all courses once the learner has any enrolment
enrolment_check = "per_course"
window_days = 7
# Learners who reached mastery keep their path
skip_mastered = true

[email]
site_url = "http://localhost"
from_address = "noreply@localhost"
outbox = "outbox.jsonl"

[schedule]
# "minute hour", cron style
emails = "0 8"
progress = "*/30 *"
paths = "15 */4"
"#;

/// Resolve the data directory
///
/// Order: explicit flag, `MASTERYTRACK_DIR`, `./.masterytrack` if present,
/// then `~/.masterytrack`.
pub fn get_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }

    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    // Check for .masterytrack directory in current project first
    let cwd = std::env::current_dir()?;
    let project_dir = cwd.join(".masterytrack");
    if project_dir.exists() {
        return Ok(project_dir);
    }

    // Fall back to home directory
    let home = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".masterytrack"))
}
