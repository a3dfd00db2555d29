//! `tflow part` command - Part lifecycle and step transitions

use clap::Subcommand;
use console::style;
use miette::Result;
use serde::Serialize;

use crate::cli::helpers::{
    format_short_id, part_id, print_structured, print_transition, step_id, FlowContext,
};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::identity::EntityId;
use crate::engine::TransitionRequest;
use crate::entities::part::Part;
use crate::entities::quality::{DecisionResult, QualityReport, Verdict};

#[derive(Subcommand, Debug)]
pub enum PartCommands {
    /// Show a part with its visits and quality reports
    Show(PartArgs),

    /// Begin work on a pending part at its current step
    Start(PartArgs),

    /// Finish work at the current step and advance the cohort when possible
    Advance(AdvanceArgs),

    /// Hold a part at its current step
    Quarantine(PartArgs),

    /// Release a quarantined part back into its cohort
    Release(ReleaseArgs),

    /// Send a quarantined part to rework at its current step
    Rework(PartArgs),

    /// Scrap a part
    Scrap(PartArgs),

    /// Cancel a part
    Cancel(PartArgs),
}

#[derive(clap::Args, Debug)]
pub struct PartArgs {
    /// Part ID
    #[arg(value_parser = part_id)]
    pub part: EntityId,
}

#[derive(clap::Args, Debug)]
pub struct AdvanceArgs {
    /// Part ID
    #[arg(value_parser = part_id)]
    pub part: EntityId,

    /// Step the part is expected at; a part that already left it is not moved again.
    ///
    /// Without it the command always acts on the part's current step, so a
    /// repeated call finishes the next step as well. Pass it whenever the
    /// command may be retried.
    #[arg(long, value_parser = step_id)]
    pub from_step: Option<EntityId>,

    /// Decision for decision steps (pass or fail)
    #[arg(long, short = 'd')]
    pub decision: Option<DecisionResult>,
}

#[derive(clap::Args, Debug)]
pub struct ReleaseArgs {
    /// Part ID
    #[arg(value_parser = part_id)]
    pub part: EntityId,

    /// Decision when released at a decision step
    #[arg(long, short = 'd')]
    pub decision: Option<DecisionResult>,
}

pub fn run(cmd: PartCommands, global: &GlobalOpts) -> Result<()> {
    let mut ctx = FlowContext::open(global)?;
    let format = ctx.format;
    let quiet = global.quiet;

    match cmd {
        PartCommands::Show(args) => run_show(&mut ctx, &args.part),
        PartCommands::Start(args) => {
            let (engine, store) = ctx.engine();
            let part = engine.start(store, &args.part)?;
            print_part_status(&part, format)
        }
        PartCommands::Advance(args) => {
            let mut request = TransitionRequest::new(&args.part);
            if let Some(ref step) = args.from_step {
                request = request.from_step(step);
            }
            if let Some(decision) = args.decision {
                request = request.with_decision(decision);
            }
            let (engine, store) = ctx.engine();
            let result = engine.advance(store, &request)?;
            print_transition(&result, format, quiet)
        }
        PartCommands::Quarantine(args) => {
            let (engine, store) = ctx.engine();
            let result = engine.quarantine(store, &args.part)?;
            print_transition(&result, format, quiet)
        }
        PartCommands::Release(args) => {
            let (engine, store) = ctx.engine();
            let result = engine.release(store, &args.part, args.decision)?;
            print_transition(&result, format, quiet)
        }
        PartCommands::Rework(args) => {
            let (engine, store) = ctx.engine();
            let part = engine.rework(store, &args.part)?;
            print_part_status(&part, format)
        }
        PartCommands::Scrap(args) => {
            let (engine, store) = ctx.engine();
            let result = engine.scrap(store, &args.part)?;
            print_transition(&result, format, quiet)
        }
        PartCommands::Cancel(args) => {
            let (engine, store) = ctx.engine();
            let result = engine.cancel(store, &args.part)?;
            print_transition(&result, format, quiet)
        }
    }
}

fn print_part_status(part: &Part, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json | OutputFormat::Yaml => print_structured(part, format),
        OutputFormat::Id => {
            println!("{}", part.id);
            Ok(())
        }
        _ => {
            println!(
                "{} {} is {} at {}",
                style("✓").green(),
                style(format_short_id(&part.id)).cyan(),
                style(part.status).yellow(),
                format_short_id(&part.step)
            );
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct PartDetail {
    part: Part,
    reports: Vec<QualityReport>,
}

fn run_show(ctx: &mut FlowContext, id: &EntityId) -> Result<()> {
    let (part, reports) = ctx.read(|tx| Ok((tx.get_part(id)?, tx.reports_for_part(id)?)))?;

    match ctx.format {
        OutputFormat::Json | OutputFormat::Yaml => {
            return print_structured(&PartDetail { part, reports }, ctx.format);
        }
        OutputFormat::Id => {
            println!("{}", part.id);
            return Ok(());
        }
        _ => {}
    }

    let step_title = |step: &EntityId| {
        ctx.catalog
            .step(step)
            .map(|s| format!("{} ({})", s.title, format_short_id(step)))
            .unwrap_or_else(|| step.to_string())
    };

    println!("{}", style("─".repeat(60)).dim());
    println!("{}: {}", style("ID").bold(), style(&part.id).cyan());
    println!("{}: {}", style("Work order").bold(), part.work_order);
    println!("{}: {} #{}", style("Part type").bold(), part.part_type, part.ordinal);
    println!("{}: {}", style("Status").bold(), style(part.status).yellow());
    println!("{}: {}", style("Step").bold(), step_title(&part.step));
    if let Some(decision) = part.decision {
        println!("{}: {}", style("Decision").bold(), decision);
    }
    if let Some(terminal) = part.terminal_status {
        println!("{}: {}", style("Terminal").bold(), terminal);
    }
    if let Some(ref sampling) = part.sampling {
        let rule = sampling
            .rule
            .as_ref()
            .map(|r| format!(" by {} {}", r.rule_type, r.value))
            .unwrap_or_default();
        let mode = if sampling.fallback_active { " (fallback)" } else { "" };
        println!(
            "{}: {}{}{}",
            style("Inspection").bold(),
            if sampling.requires_sampling { "required" } else { "not required" },
            rule,
            mode
        );
    }
    println!("{}", style("─".repeat(60)).dim());

    if !part.visits.is_empty() {
        println!("{}", style("Visits").bold());
        for (step, count) in &part.visits {
            println!("  {} x{}", step_title(step), count);
        }
    }

    if !reports.is_empty() {
        println!();
        println!("{}", style("Quality reports").bold());
        for report in &reports {
            let verdict = match report.verdict {
                Verdict::Pass => style("PASS").green(),
                Verdict::Fail => style("FAIL").red(),
            };
            println!(
                "  {} {} at {} {}",
                report.created.format("%Y-%m-%d %H:%M"),
                verdict,
                step_title(&report.step),
                report.inspector.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}
