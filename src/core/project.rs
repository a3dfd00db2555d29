//! Project discovery and structure

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::identity::EntityPrefix;

/// File suffix of definition files
pub const DEFINITION_SUFFIX: &str = ".tflow.yaml";

/// Represents a TFLOW project
#[derive(Debug)]
pub struct Project {
    /// Root directory of the project (parent of .tflow/)
    root: PathBuf,
}

impl Project {
    /// Find project root by walking up from the current directory
    pub fn discover() -> Result<Self, ProjectError> {
        let current = std::env::current_dir()
            .map_err(|e| ProjectError::IoError(e.to_string()))?;
        Self::discover_from(&current)
    }

    /// Find project root by walking up from the given directory
    pub fn discover_from(start: &Path) -> Result<Self, ProjectError> {
        let mut current = start
            .canonicalize()
            .map_err(|e| ProjectError::IoError(e.to_string()))?;

        loop {
            let tflow_dir = current.join(".tflow");
            if tflow_dir.is_dir() {
                return Ok(Self { root: current });
            }

            if !current.pop() {
                return Err(ProjectError::NotFound {
                    searched_from: start.to_path_buf(),
                });
            }
        }
    }

    /// Create a new project structure at the given path
    pub fn init(path: &Path) -> Result<Self, ProjectError> {
        let root = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());

        if root.join(".tflow").exists() {
            return Err(ProjectError::AlreadyExists(root.clone()));
        }

        Self::write_structure(root)
    }

    /// Force initialization even if .tflow/ exists
    ///
    /// Rewrites the default config; definitions and the state database are kept.
    pub fn init_force(path: &Path) -> Result<Self, ProjectError> {
        let root = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());

        Self::write_structure(root)
    }

    fn write_structure(root: PathBuf) -> Result<Self, ProjectError> {
        let tflow_dir = root.join(".tflow");
        std::fs::create_dir_all(&tflow_dir).map_err(|e| ProjectError::IoError(e.to_string()))?;

        std::fs::write(tflow_dir.join("config.yaml"), Self::default_config())
            .map_err(|e| ProjectError::IoError(e.to_string()))?;
        std::fs::write(tflow_dir.join(".gitignore"), "state.db*\n")
            .map_err(|e| ProjectError::IoError(e.to_string()))?;

        for prefix in EntityPrefix::definitions() {
            if let Some(dir) = Self::entity_directory(*prefix) {
                std::fs::create_dir_all(root.join(dir))
                    .map_err(|e| ProjectError::IoError(e.to_string()))?;
            }
        }

        Ok(Self { root })
    }

    fn default_config() -> &'static str {
        r#"# TFLOW Project Configuration

# Default author for work orders, reports and sign-offs
# author: ""

# Log filter (tracing EnvFilter syntax) and format (text, json)
# log_filter: "tflow=info"
# log_format: text

# State database, relative to the project root
# database: .tflow/state.db

# Retries for transitions that hit a concurrent update
# conflict_retries: 3

# Default output format (auto, yaml, json, tsv, md, id)
# default_format: auto
"#
    }

    /// Get the project root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the .tflow configuration directory
    pub fn tflow_dir(&self) -> PathBuf {
        self.root.join(".tflow")
    }

    /// Get the directory holding definitions of a given prefix
    ///
    /// Runtime records (work orders, parts, ...) live in the state database
    /// and have no directory.
    pub fn entity_directory(prefix: EntityPrefix) -> Option<&'static str> {
        match prefix {
            EntityPrefix::Proc => Some("processes"),
            EntityPrefix::Step => Some("steps"),
            EntityPrefix::Srs => Some("sampling"),
            _ => None,
        }
    }
}

/// Errors that can occur during project operations
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("not a TFLOW project (searched from {searched_from:?}). Run 'tflow init' to create one.")]
    NotFound { searched_from: PathBuf },

    #[error("TFLOW project already exists at {0:?}")]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    IoError(String),
}
