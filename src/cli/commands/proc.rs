//! `tflow proc` command - Process definitions and their graphs

use clap::Subcommand;
use console::style;
use miette::Result;

use crate::cli::helpers::{
    discover_project, format_short_id, print_structured, print_table, truncate_str,
};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::identity::EntityId;
use crate::core::{Catalog, Config};
use crate::entities::process::Process;

#[derive(Subcommand, Debug)]
pub enum ProcCommands {
    /// List process definitions
    List(ListArgs),

    /// Show a process graph in step order
    Show(ShowArgs),
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Only processes for this part type
    #[arg(long, short = 'p')]
    pub part_type: Option<String>,

    /// Only released processes
    #[arg(long)]
    pub released: bool,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Process ID, or a part type to show its latest released process
    pub id: String,
}

pub fn run(cmd: ProcCommands, global: &GlobalOpts) -> Result<()> {
    let project = discover_project(global)?;
    let config = Config::load_for(Some(&project));
    let format = crate::cli::helpers::output_format(global, &config);
    let catalog = Catalog::load(&project)?;

    match cmd {
        ProcCommands::List(args) => run_list(&catalog, args, format),
        ProcCommands::Show(args) => run_show(&catalog, args, format),
    }
}

fn run_list(catalog: &Catalog, args: ListArgs, format: OutputFormat) -> Result<()> {
    let processes: Vec<&Process> = catalog
        .processes()
        .into_iter()
        .filter(|p| args.part_type.as_deref().is_none_or(|t| p.part_type == t))
        .filter(|p| !args.released || p.is_published())
        .collect();

    if format.is_structured() {
        return print_structured(&processes, format);
    }

    let rows = processes
        .iter()
        .map(|p| {
            [
                p.id.to_string(),
                p.part_type.clone(),
                p.version.to_string(),
                p.status.to_string(),
                p.steps.len().to_string(),
                truncate_str(&p.title, 40),
            ]
        })
        .collect();
    print_table(
        ["ID", "PART TYPE", "VER", "STATUS", "STEPS", "TITLE"],
        rows,
        format,
    );
    Ok(())
}

fn find_process<'c>(catalog: &'c Catalog, key: &str) -> Result<&'c Process> {
    let found = match key.parse::<EntityId>() {
        Ok(id) => catalog.process(&id),
        Err(_) => catalog.latest_process(key),
    };
    found.ok_or_else(|| miette::miette!("No process found matching '{}'", key))
}

fn run_show(catalog: &Catalog, args: ShowArgs, format: OutputFormat) -> Result<()> {
    let process = find_process(catalog, &args.id)?;

    match format {
        OutputFormat::Json | OutputFormat::Yaml => return print_structured(process, format),
        OutputFormat::Id => {
            println!("{}", process.id);
            return Ok(());
        }
        _ => {}
    }

    println!("{}", style("─".repeat(60)).dim());
    println!("{}: {}", style("ID").bold(), style(&process.id).cyan());
    println!("{}: {}", style("Title").bold(), style(&process.title).yellow());
    println!("{}: {}", style("Part type").bold(), process.part_type);
    println!("{}: {}", style("Version").bold(), process.version);
    println!("{}: {}", style("Status").bold(), process.status);
    if let Some(ref previous) = process.previous_version {
        println!("{}: {}", style("Supersedes").bold(), previous);
    }
    println!("{}", style("─".repeat(60)).dim());

    let graph = match catalog.graph(&process.id) {
        Ok(graph) => graph,
        Err(e) => {
            println!("{} {}", style("!").yellow(), e);
            return Ok(());
        }
    };

    let rows = graph
        .steps()
        .map(|(order, step)| {
            let edges = graph
                .outgoing(&step.id)
                .iter()
                .map(|(edge_type, to)| format!("{}->{}", edge_type, format_short_id(to)))
                .collect::<Vec<_>>()
                .join(" ");
            let mut flags = Vec::new();
            if step.sampling_required {
                flags.push("sampling".to_string());
            }
            if step.requires_qa_signoff {
                flags.push("signoff".to_string());
            }
            if step.block_on_quarantine {
                flags.push("hold".to_string());
            }
            if step.pass_threshold > 0.0 {
                flags.push(format!("pass>={:.2}", step.pass_threshold));
            }
            [
                order.to_string(),
                format_short_id(&step.id),
                truncate_str(&step.title, 24),
                step.kind.to_string(),
                step.max_visits.map(|n| n.to_string()).unwrap_or_default(),
                flags.join(","),
                edges,
            ]
        })
        .collect();
    print_table(
        ["ORDER", "STEP", "TITLE", "KIND", "MAX", "GATES", "EDGES"],
        rows,
        OutputFormat::Tsv,
    );
    Ok(())
}
