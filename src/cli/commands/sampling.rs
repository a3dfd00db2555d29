//! `tflow sampling` command - Inspection sampling decisions and trigger states

use clap::Subcommand;
use console::style;
use miette::Result;

use crate::cli::helpers::{
    format_short_id, part_id, print_structured, print_table, truncate_str, FlowContext,
};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::core::identity::EntityId;
use crate::entities::sampling::SamplingRuleSet;

#[derive(Subcommand, Debug)]
pub enum SamplingCommands {
    /// List sampling rule sets
    List(ListArgs),

    /// Decide whether a part must be inspected at its current step
    Resolve(ResolveArgs),

    /// Show fallback trigger states of a work order
    Triggers(TriggersArgs),
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Only active rule sets
    #[arg(long)]
    pub active: bool,
}

#[derive(clap::Args, Debug)]
pub struct ResolveArgs {
    /// Part ID
    #[arg(value_parser = part_id)]
    pub part: EntityId,
}

#[derive(clap::Args, Debug)]
pub struct TriggersArgs {
    /// Work order ID or number
    pub work_order: String,

    /// Include deactivated states
    #[arg(long)]
    pub all: bool,
}

pub fn run(cmd: SamplingCommands, global: &GlobalOpts) -> Result<()> {
    let mut ctx = FlowContext::open(global)?;
    match cmd {
        SamplingCommands::List(args) => run_list(&ctx, args),
        SamplingCommands::Resolve(args) => run_resolve(&mut ctx, args),
        SamplingCommands::Triggers(args) => run_triggers(&mut ctx, args),
    }
}

fn run_list(ctx: &FlowContext, args: ListArgs) -> Result<()> {
    let rulesets: Vec<&SamplingRuleSet> = ctx
        .catalog
        .rulesets()
        .filter(|s| !args.active || s.active)
        .collect();

    if ctx.format.is_structured() {
        return print_structured(&rulesets, ctx.format);
    }

    let rows = rulesets
        .iter()
        .map(|s| {
            let kind = if s.is_fallback {
                "fallback".to_string()
            } else if let Some(ref fallback) = s.fallback {
                format!("-> {}", format_short_id(fallback))
            } else {
                String::new()
            };
            let rules = s
                .ordered_rules()
                .iter()
                .map(|r| format!("{}:{}", r.rule_type, r.value))
                .collect::<Vec<_>>()
                .join(" ");
            [
                s.id.to_string(),
                s.part_type.clone(),
                format_short_id(&s.step),
                s.version.to_string(),
                if s.active { "yes" } else { "" }.to_string(),
                kind,
                truncate_str(&rules, 40),
            ]
        })
        .collect();
    print_table(
        ["ID", "PART TYPE", "STEP", "VER", "ACTIVE", "FALLBACK", "RULES"],
        rows,
        ctx.format,
    );
    Ok(())
}

fn run_resolve(ctx: &mut FlowContext, args: ResolveArgs) -> Result<()> {
    let format = ctx.format;
    let (engine, store) = ctx.engine();
    let decision = engine.resolve_sampling(store, &args.part)?;

    match format {
        OutputFormat::Json | OutputFormat::Yaml => print_structured(&decision, format),
        _ => {
            if decision.requires_sampling {
                let rule = decision
                    .rule
                    .as_ref()
                    .map(|r| format!(" ({} {})", r.rule_type, r.value))
                    .unwrap_or_default();
                println!(
                    "{} Inspect {} at {}{}",
                    style("!").yellow(),
                    format_short_id(&args.part),
                    format_short_id(&decision.step),
                    rule
                );
            } else {
                println!(
                    "{} No inspection for {} at {}",
                    style("✓").green(),
                    format_short_id(&args.part),
                    format_short_id(&decision.step)
                );
            }
            if let Some(ref ruleset) = decision.ruleset {
                let mode = if decision.fallback_active { "fallback" } else { "primary" };
                println!("  {} rule set {}", mode, ruleset);
            }
            Ok(())
        }
    }
}

fn run_triggers(ctx: &mut FlowContext, args: TriggersArgs) -> Result<()> {
    let wo = ctx.work_order(&args.work_order)?;
    let states: Vec<_> = ctx
        .read(|tx| tx.trigger_states_for_work_order(&wo.id))?
        .into_iter()
        .filter(|s| args.all || s.active)
        .collect();

    if ctx.format.is_structured() {
        return print_structured(&states, ctx.format);
    }

    let rows = states
        .iter()
        .map(|s| {
            [
                s.id.to_string(),
                format_short_id(&s.step),
                format_short_id(&s.ruleset),
                if s.is_fallback() { "fallback" } else { "primary" }.to_string(),
                if s.active { "yes" } else { "" }.to_string(),
                s.fail_count.to_string(),
                s.success_count.to_string(),
                s.triggered_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(
        ["ID", "STEP", "RULESET", "MODE", "ACTIVE", "FAILS", "PASSES", "SINCE"],
        rows,
        ctx.format,
    );
    Ok(())
}
