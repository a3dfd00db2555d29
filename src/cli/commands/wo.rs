//! `tflow wo` command - Work orders and their cohorts

use clap::Subcommand;
use console::style;
use miette::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cli::helpers::{
    format_short_id, print_structured, print_table, process_id, step_id, truncate_str, FlowContext,
};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::identity::EntityId;
use crate::core::store::StoredEvent;
use crate::entities::part::Part;
use crate::entities::quality::QaSignoff;
use crate::entities::trigger::SamplingTriggerState;
use crate::entities::work_order::WorkOrder;

#[derive(Subcommand, Debug)]
pub enum WoCommands {
    /// Create a work order and its parts at the process entry step
    New(NewArgs),

    /// List work orders
    List,

    /// Show a work order with its parts
    Show(ShowArgs),

    /// Show the audit trail of a work order
    Events(EventsArgs),

    /// Re-run cohort gating for a step without marking parts ready
    Reevaluate(ReevaluateArgs),
}

#[derive(clap::Args, Debug)]
pub struct NewArgs {
    /// Released process to route the parts through
    #[arg(
        long,
        value_parser = process_id,
        conflicts_with = "part_type",
        required_unless_present = "part_type"
    )]
    pub process: Option<EntityId>,

    /// Use the latest released process for this part type
    #[arg(long, short = 'p')]
    pub part_type: Option<String>,

    /// Number of parts in the work order
    #[arg(long, short = 'n')]
    pub quantity: u32,

    /// Work order number (default: WO-0001, WO-0002, ...)
    #[arg(long)]
    pub number: Option<String>,

    /// Author (default: from config)
    #[arg(long)]
    pub author: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Work order ID or number
    pub work_order: String,
}

#[derive(clap::Args, Debug)]
pub struct EventsArgs {
    /// Work order ID or number
    pub work_order: String,

    /// Only events of this kind (e.g. part_moved)
    #[arg(long, short = 'k')]
    pub kind: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct ReevaluateArgs {
    /// Work order ID or number
    pub work_order: String,

    /// Step whose cohort is evaluated
    #[arg(long, value_parser = step_id)]
    pub step: EntityId,
}

pub fn run(cmd: WoCommands, global: &GlobalOpts) -> Result<()> {
    let mut ctx = FlowContext::open(global)?;
    match cmd {
        WoCommands::New(args) => run_new(&mut ctx, args, global),
        WoCommands::List => run_list(&mut ctx),
        WoCommands::Show(args) => run_show(&mut ctx, args),
        WoCommands::Events(args) => run_events(&mut ctx, args),
        WoCommands::Reevaluate(args) => run_reevaluate(&mut ctx, args, global),
    }
}

fn run_new(ctx: &mut FlowContext, args: NewArgs, global: &GlobalOpts) -> Result<()> {
    let process = match (args.process, args.part_type) {
        (Some(id), _) => id,
        (None, Some(part_type)) => ctx
            .catalog
            .latest_process(&part_type)
            .map(|p| p.id.clone())
            .ok_or_else(|| {
                miette::miette!("No released process for part type '{}'", part_type)
            })?,
        (None, None) => return Err(miette::miette!("Either --process or --part-type is required")),
    };
    let author = args.author.unwrap_or_else(|| ctx.config.author());
    let format = ctx.format;

    let (engine, store) = ctx.engine();
    let (wo, parts) =
        engine.create_work_order(store, &process, args.quantity, args.number.as_deref(), &author)?;

    match format {
        OutputFormat::Json | OutputFormat::Yaml => print_structured(&wo, format)?,
        OutputFormat::Id => println!("{}", wo.id),
        _ => {
            println!(
                "{} Created work order {} ({})",
                style("✓").green(),
                style(&wo.number).cyan(),
                wo.id
            );
            if !global.quiet {
                let entry = parts.first().map(|p| format_short_id(&p.step)).unwrap_or_default();
                println!(
                    "  {} part(s) of {} at entry step {}",
                    style(parts.len()).cyan(),
                    wo.part_type,
                    entry
                );
            }
        }
    }
    Ok(())
}

fn run_list(ctx: &mut FlowContext) -> Result<()> {
    let work_orders = ctx.read(|tx| tx.list_work_orders())?;
    if ctx.format.is_structured() {
        return print_structured(&work_orders, ctx.format);
    }

    let rows = work_orders
        .iter()
        .map(|wo| {
            [
                wo.id.to_string(),
                wo.number.clone(),
                wo.part_type.clone(),
                wo.quantity.to_string(),
                format_short_id(&wo.process),
                wo.created.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(
        ["ID", "NUMBER", "PART TYPE", "QTY", "PROCESS", "CREATED"],
        rows,
        ctx.format,
    );
    Ok(())
}

#[derive(Serialize)]
struct WorkOrderDetail {
    work_order: WorkOrder,
    parts: Vec<Part>,
    signoffs: Vec<QaSignoff>,
    triggers: Vec<SamplingTriggerState>,
}

fn run_show(ctx: &mut FlowContext, args: ShowArgs) -> Result<()> {
    let wo = ctx.work_order(&args.work_order)?;
    let (parts, signoffs, triggers) = ctx.read(|tx| {
        Ok((
            tx.parts_of_work_order(&wo.id)?,
            tx.signoffs_for_work_order(&wo.id)?,
            tx.trigger_states_for_work_order(&wo.id)?,
        ))
    })?;

    match ctx.format {
        OutputFormat::Json | OutputFormat::Yaml => {
            let detail = WorkOrderDetail {
                work_order: wo,
                parts,
                signoffs,
                triggers,
            };
            return print_structured(&detail, ctx.format);
        }
        OutputFormat::Id => {
            for part in &parts {
                println!("{}", part.id);
            }
            return Ok(());
        }
        _ => {}
    }

    println!("{}", style("─".repeat(60)).dim());
    println!("{}: {}", style("ID").bold(), style(&wo.id).cyan());
    println!("{}: {}", style("Number").bold(), style(&wo.number).yellow());
    println!("{}: {}", style("Part type").bold(), wo.part_type);
    println!("{}: {}", style("Process").bold(), wo.process);
    println!("{}: {}", style("Quantity").bold(), wo.quantity);
    println!("{}: {}", style("Author").bold(), wo.author);
    println!("{}", style("─".repeat(60)).dim());

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for part in &parts {
        *by_status.entry(part.status.to_string()).or_default() += 1;
    }
    let summary = by_status
        .iter()
        .map(|(status, count)| format!("{} {}", count, status))
        .collect::<Vec<_>>()
        .join(", ");
    println!("{}: {}", style("Parts").bold(), summary);
    println!();

    let catalog = &ctx.catalog;
    let rows = parts
        .iter()
        .map(|part| {
            let step = catalog
                .step(&part.step)
                .map(|s| truncate_str(&s.title, 24))
                .unwrap_or_else(|| format_short_id(&part.step));
            [
                part.ordinal.to_string(),
                part.id.to_string(),
                part.status.to_string(),
                step,
                part.visits_at(&part.step).to_string(),
                if part.requires_sampling() { "yes" } else { "" }.to_string(),
                part.decision.map(|d| d.to_string()).unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        ["#", "PART", "STATUS", "STEP", "VISITS", "INSPECT", "DECISION"],
        rows,
        OutputFormat::Tsv,
    );

    if !signoffs.is_empty() {
        println!();
        println!("{}", style("QA sign-offs").bold());
        for signoff in &signoffs {
            println!(
                "  {} {} by {}",
                style("✓").green(),
                format_short_id(&signoff.step),
                signoff.approver
            );
        }
    }

    let active: Vec<&SamplingTriggerState> = triggers.iter().filter(|t| t.active).collect();
    if !active.is_empty() {
        println!();
        println!("{}", style("Sampling triggers").bold());
        for state in active {
            let mode = if state.is_fallback() { "fallback" } else { "primary" };
            println!(
                "  {} {} {} (fail {}, pass {})",
                format_short_id(&state.step),
                mode,
                format_short_id(&state.ruleset),
                state.fail_count,
                state.success_count
            );
        }
    }
    Ok(())
}

fn run_events(ctx: &mut FlowContext, args: EventsArgs) -> Result<()> {
    let wo = ctx.work_order(&args.work_order)?;
    let events: Vec<StoredEvent> = ctx
        .read(|tx| tx.events_for_work_order(&wo.id))?
        .into_iter()
        .filter(|e| args.kind.as_deref().is_none_or(|k| e.kind == k))
        .collect();

    if ctx.format.is_structured() {
        return print_structured(&events, ctx.format);
    }

    let rows = events
        .iter()
        .map(|e| {
            [
                e.seq.to_string(),
                e.created.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.kind.clone(),
                e.part.as_ref().map(format_short_id).unwrap_or_default(),
                truncate_str(&e.payload.to_string(), 60),
            ]
        })
        .collect();
    print_table(["SEQ", "TIME", "KIND", "PART", "PAYLOAD"], rows, ctx.format);
    Ok(())
}

fn run_reevaluate(ctx: &mut FlowContext, args: ReevaluateArgs, global: &GlobalOpts) -> Result<()> {
    let wo = ctx.work_order(&args.work_order)?;
    let format = ctx.format;
    let (engine, store) = ctx.engine();
    let result = engine.reevaluate(store, &wo.id, &args.step)?;
    if !format.is_structured() && result.outcome.is_waiting() {
        println!("{} Cohort at {} is {}", style("!").yellow(), args.step, result.outcome);
        return Ok(());
    }
    crate::cli::helpers::print_transition(&result, format, global.quiet)
}
