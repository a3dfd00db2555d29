//! Configuration management with layered hierarchy

use serde::Deserialize;
use std::path::PathBuf;

use crate::core::store::STATE_FILE;
use crate::core::Project;

/// Default number of times a conflicting transition is re-issued
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}. Use text or json", s)),
        }
    }
}

/// TFLOW configuration with layered hierarchy
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default author for work orders, reports and sign-offs
    pub author: Option<String>,

    /// tracing filter directive (e.g. "tflow=debug")
    pub log_filter: Option<String>,

    /// Log output format
    pub log_format: Option<LogFormat>,

    /// State database path, relative to the project root
    pub database: Option<PathBuf>,

    /// Retries for transitions that hit a concurrent update
    pub conflict_retries: Option<u32>,

    /// Default output format
    pub default_format: Option<String>,
}

impl Config {
    /// Load configuration from all sources for the discovered project
    pub fn load() -> Self {
        let project = Project::discover().ok();
        Self::load_for(project.as_ref())
    }

    /// Load configuration from all sources, merging in priority order
    pub fn load_for(project: Option<&Project>) -> Self {
        let mut config = Config::default();

        // 1. Built-in defaults (already in Default impl)

        // 2. Global user config (~/.config/tflow/config.yaml)
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global) = Self::read_file(&global_path) {
                config.merge(global);
            }
        }

        // 3. Project config (.tflow/config.yaml)
        if let Some(project) = project {
            if let Some(project_config) = Self::read_file(&project.tflow_dir().join("config.yaml"))
            {
                config.merge(project_config);
            }
        }

        // 4. Environment variables
        if let Ok(author) = std::env::var("TFLOW_AUTHOR") {
            config.author = Some(author);
        }
        if let Ok(filter) = std::env::var("TFLOW_LOG") {
            config.log_filter = Some(filter);
        }
        if let Ok(database) = std::env::var("TFLOW_DATABASE") {
            config.database = Some(PathBuf::from(database));
        }

        config
    }

    fn read_file(path: &std::path::Path) -> Option<Config> {
        if !path.exists() {
            return None;
        }
        let contents = std::fs::read_to_string(path).ok()?;
        serde_yml::from_str::<Config>(&contents).ok()
    }

    /// Get the path to the global config file
    fn global_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tflow")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config) {
        if other.author.is_some() {
            self.author = other.author;
        }
        if other.log_filter.is_some() {
            self.log_filter = other.log_filter;
        }
        if other.log_format.is_some() {
            self.log_format = other.log_format;
        }
        if other.database.is_some() {
            self.database = other.database;
        }
        if other.conflict_retries.is_some() {
            self.conflict_retries = other.conflict_retries;
        }
        if other.default_format.is_some() {
            self.default_format = other.default_format;
        }
    }

    /// Get the author name, falling back to git config or username
    pub fn author(&self) -> String {
        if let Some(ref author) = self.author {
            return author.clone();
        }

        // Try git config
        if let Ok(output) = std::process::Command::new("git")
            .args(["config", "user.name"])
            .output()
        {
            if output.status.success() {
                let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !name.is_empty() {
                    return name;
                }
            }
        }

        // Fall back to username
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Resolved state database location for a project
    pub fn database_path(&self, project: &Project) -> PathBuf {
        match self.database {
            Some(ref path) if path.is_absolute() => path.clone(),
            Some(ref path) => project.root().join(path),
            None => project.root().join(STATE_FILE),
        }
    }

    pub fn conflict_retries(&self) -> u32 {
        self.conflict_retries.unwrap_or(DEFAULT_CONFLICT_RETRIES)
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_default()
    }
}
