//! Shared helper functions for CLI commands
//!
//! This module contains utility functions that are used across multiple
//! command modules to avoid code duplication.

use clap::ValueEnum;
use console::style;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use tabled::{builder::Builder, settings::Style};

use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::identity::{EntityId, EntityPrefix, IdParseError};
use crate::core::store::StoreError;
use crate::core::{Catalog, Config, Project, Store};
use crate::engine::{BatchAdvancer, TransitionOutcome, TransitionResult};
use crate::entities::work_order::WorkOrder;

/// Argument parser for part IDs
pub fn part_id(s: &str) -> Result<EntityId, IdParseError> {
    EntityId::parse_as(s, EntityPrefix::Part)
}

/// Argument parser for step IDs
pub fn step_id(s: &str) -> Result<EntityId, IdParseError> {
    EntityId::parse_as(s, EntityPrefix::Step)
}

pub fn process_id(s: &str) -> Result<EntityId, IdParseError> {
    EntityId::parse_as(s, EntityPrefix::Proc)
}

/// Format an EntityId for display, truncating if too long
///
/// IDs longer than 16 characters are truncated to 13 chars with "..." suffix.
/// This provides a consistent display format across all list/table outputs.
pub fn format_short_id(id: &EntityId) -> String {
    let s = id.to_string();
    if s.len() > 16 {
        format!("{}...", &s[..13])
    } else {
        s
    }
}

/// Truncate a string to max_len, adding "..." if truncated
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Locate the project from `--project` or the current directory
pub fn discover_project(global: &GlobalOpts) -> Result<Project> {
    match global.project {
        Some(ref path) => Project::discover_from(path),
        None => Project::discover(),
    }
    .map_err(|e| miette::miette!("{}", e))
}

/// Everything a runtime command needs: definitions plus the state store
pub struct FlowContext {
    pub project: Project,
    pub config: Config,
    pub catalog: Catalog,
    pub store: Store,
    pub format: OutputFormat,
}

impl FlowContext {
    pub fn open(global: &GlobalOpts) -> Result<Self> {
        let project = discover_project(global)?;
        let config = Config::load_for(Some(&project));
        let catalog = Catalog::load(&project)?;
        let store = Store::open(&config.database_path(&project))?;
        let format = output_format(global, &config);
        Ok(Self {
            project,
            config,
            catalog,
            store,
            format,
        })
    }

    /// Advancer over the catalog together with the store it writes to
    pub fn engine(&mut self) -> (BatchAdvancer<'_>, &mut Store) {
        let advancer =
            BatchAdvancer::new(&self.catalog).with_conflict_retries(self.config.conflict_retries());
        (advancer, &mut self.store)
    }

    /// Run a read-only query in its own transaction
    pub fn read<T>(
        &mut self,
        f: impl FnOnce(&crate::core::StoreTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T> {
        Ok(self.store.transaction(f)?)
    }

    /// Find a work order by ID or by its human-readable number
    pub fn work_order(&mut self, key: &str) -> Result<WorkOrder> {
        let wo = self.read(|tx| match key.parse::<EntityId>() {
            Ok(id) => tx.get_work_order(&id).map(Some),
            Err(_) => tx.find_work_order_by_number(key),
        })?;
        wo.ok_or_else(|| miette::miette!("No work order found matching '{}'", key))
    }
}

/// Effective output format: the flag wins over the configured default
pub fn output_format(global: &GlobalOpts, config: &Config) -> OutputFormat {
    if global.format != OutputFormat::Auto {
        return global.format;
    }
    config
        .default_format
        .as_deref()
        .and_then(|s| OutputFormat::from_str(s, true).ok())
        .unwrap_or(OutputFormat::Auto)
}

/// Print a value as JSON or YAML
pub fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value).into_diagnostic()?;
            println!("{}", json);
        }
        _ => {
            let yaml = serde_yml::to_string(value).into_diagnostic()?;
            print!("{}", yaml);
        }
    }
    Ok(())
}

/// Print rows as a table; `Id` prints the first column only
pub fn print_table<const N: usize>(headers: [&str; N], rows: Vec<[String; N]>, format: OutputFormat) {
    if format == OutputFormat::Id {
        for row in rows {
            if let Some(first) = row.first() {
                println!("{}", first);
            }
        }
        return;
    }

    let count = rows.len();
    let mut builder = Builder::default();
    builder.push_record(headers);
    for row in rows {
        builder.push_record(row);
    }
    let mut table = builder.build();
    match format {
        OutputFormat::Md => table.with(Style::markdown()),
        _ => table.with(Style::blank()),
    };
    println!("{}", table);
    if format != OutputFormat::Md {
        println!();
        println!("{} item(s)", style(count).cyan());
    }
}

/// Report the outcome of a part or cohort transition
pub fn print_transition(result: &TransitionResult, format: OutputFormat, quiet: bool) -> Result<()> {
    if format.is_structured() {
        return print_structured(result, format);
    }

    if let Some(ref part) = result.part {
        println!(
            "{} {} is {} at {}",
            style("✓").green(),
            style(format_short_id(&part.id)).cyan(),
            style(part.status).yellow(),
            format_short_id(&part.step)
        );
    }

    match result.outcome {
        TransitionOutcome::Waiting(ref reason) => {
            if !quiet {
                println!("  {} {}", style("…").dim(), reason);
            }
        }
        TransitionOutcome::Advanced | TransitionOutcome::Completed => {
            if !result.moved.is_empty() {
                println!(
                    "{} Cohort {}: {} part(s) moved",
                    style("✓").green(),
                    result.outcome,
                    style(result.moved.len()).cyan()
                );
            }
            if !quiet {
                for mv in &result.moved {
                    println!(
                        "  {} {} -> {} ({}, {})",
                        format_short_id(&mv.part),
                        format_short_id(&mv.from),
                        format_short_id(&mv.to),
                        mv.edge_type,
                        mv.status
                    );
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_short_id() {
        let id = EntityId::new(EntityPrefix::Part);
        let formatted = format_short_id(&id);
        assert!(formatted.len() <= 16);
        assert!(formatted.ends_with("..."));
    }

    #[test]
    fn test_id_parsers_check_prefix() {
        let part = EntityId::new(EntityPrefix::Part).to_string();
        assert!(part_id(&part).is_ok());
        assert!(matches!(
            step_id(&part),
            Err(IdParseError::WrongPrefix { .. })
        ));
        assert!(process_id("PROC-nope").is_err());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("hi", 2), "hi");
    }

    #[test]
    fn test_output_format_prefers_flag() {
        let global = GlobalOpts {
            format: OutputFormat::Json,
            quiet: false,
            verbose: false,
            project: None,
        };
        let config = Config {
            default_format: Some("yaml".to_string()),
            ..Default::default()
        };
        assert_eq!(output_format(&global, &config), OutputFormat::Json);

        let global = GlobalOpts {
            format: OutputFormat::Auto,
            ..global
        };
        assert_eq!(output_format(&global, &config), OutputFormat::Yaml);
    }
}
