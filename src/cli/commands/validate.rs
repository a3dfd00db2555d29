//! `tflow validate` command - Load and validate all definitions

use console::style;
use miette::Result;

use crate::cli::helpers::discover_project;
use crate::cli::GlobalOpts;
use crate::core::catalog::{Catalog, CatalogError};

#[derive(clap::Args, Debug)]
pub struct ValidateArgs {
    /// Show summary only, don't show individual errors
    #[arg(long)]
    pub summary: bool,
}

pub fn run(args: ValidateArgs, global: &GlobalOpts) -> Result<()> {
    let project = discover_project(global)?;

    match Catalog::load(&project) {
        Ok(catalog) => {
            let processes = catalog.processes();
            let released = processes.iter().filter(|p| p.is_published()).count();
            println!(
                "{} {} process(es) ({} released), {} step(s), {} sampling rule set(s)",
                style("✓").green(),
                style(processes.len()).cyan(),
                released,
                catalog.steps().count(),
                catalog.rulesets().count()
            );
            if !global.quiet {
                for process in processes.iter().filter(|p| p.is_published()) {
                    println!(
                        "  {} {} v{} ({})",
                        style("✓").green(),
                        process.part_type,
                        process.version,
                        process.title
                    );
                }
            }
            Ok(())
        }
        Err(CatalogError::Configuration(err)) => {
            let errors = err.into_list();
            if !args.summary {
                for error in &errors {
                    println!("{} {}", style("✗").red(), error);
                }
                println!();
            }
            Err(miette::miette!(
                "Validation failed: {} configuration error(s)",
                errors.len()
            ))
        }
        Err(e) => Err(e.into()),
    }
}
