//! Definition loading utilities
//!
//! Reads `*.tflow.yaml` definition files and turns YAML problems into
//! diagnostics that point at the offending line.

use miette::Diagnostic;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::core::project::DEFINITION_SUFFIX;
use crate::yaml::YamlSyntaxError;

/// Errors raised while reading definition files
#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    #[diagnostic(code(tflow::load::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Yaml(#[from] YamlSyntaxError),
}

/// Load and deserialize one definition file
pub fn load_file<T: DeserializeOwned + 'static>(path: &Path) -> Result<T, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yml::from_str::<T>(&content).map_err(|e| {
        LoadError::Yaml(YamlSyntaxError::from_serde_error(
            &e,
            &content,
            &path.display().to_string(),
        ))
    })
}

/// Load all definitions of type T below a directory
///
/// Files are visited in file-name order. Unlike a best-effort scan, the first
/// unreadable or malformed file aborts the load.
pub fn load_all<T: DeserializeOwned + 'static>(dir: &Path) -> Result<Vec<T>, LoadError> {
    let mut entities = Vec::new();

    if !dir.exists() {
        return Ok(entities);
    }

    for entry in walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if !path.to_string_lossy().ends_with(DEFINITION_SUFFIX) {
            continue;
        }
        debug!(path = %path.display(), "loading definition");
        entities.push(load_file(path)?);
    }

    Ok(entities)
}
