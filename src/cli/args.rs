//! CLI argument definitions using clap derive

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::cli::commands::{
    completions::CompletionsArgs, init::InitArgs, part::PartCommands, proc::ProcCommands,
    qa::QaCommands, sampling::SamplingCommands, validate::ValidateArgs, wo::WoCommands,
};

#[derive(Parser)]
#[command(name = "tflow")]
#[command(author, version, about = "Tessera Flow - manufacturing workflow engine")]
#[command(long_about = "Routes work orders of parts through versioned process graphs, gates cohorts in batches and decides per part and step whether inspection is required.")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalOpts,
}

#[derive(clap::Args, Clone, Debug)]
pub struct GlobalOpts {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "auto")]
    pub format: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Enable verbose output (debug logging)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Project root (default: auto-detect by finding .tflow/)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new TFLOW project
    Init(InitArgs),

    /// Load all definitions and validate every released process graph
    Validate(ValidateArgs),

    /// Process definitions
    #[command(subcommand)]
    Proc(ProcCommands),

    /// Work orders (cohorts of parts)
    #[command(subcommand)]
    Wo(WoCommands),

    /// Parts and their lifecycle
    #[command(subcommand)]
    Part(PartCommands),

    /// Quality reports and QA sign-offs
    #[command(subcommand)]
    Qa(QaCommands),

    /// Inspection sampling decisions and fallback triggers
    #[command(subcommand)]
    Sampling(SamplingCommands),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Automatically detect based on context (table for lists, text for show)
    #[default]
    Auto,
    /// YAML format (full fidelity)
    Yaml,
    /// JSON format (for programming)
    Json,
    /// Whitespace-aligned table
    Tsv,
    /// Markdown tables
    Md,
    /// Just IDs, one per line
    Id,
}

impl OutputFormat {
    /// Whether the format is a full-fidelity serialization
    pub fn is_structured(&self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Yaml)
    }
}
