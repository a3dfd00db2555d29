//! `tflow qa` command - Quality reports and QA sign-offs

use clap::Subcommand;
use console::style;
use miette::Result;

use crate::cli::helpers::{
    format_short_id, part_id, print_structured, print_transition, step_id, FlowContext,
};
use crate::cli::GlobalOpts;
use crate::core::identity::EntityId;
use crate::engine::TriggerChange;
use crate::entities::quality::{Measurement, QaSignoff, QualityReport, Verdict};

#[derive(Subcommand, Debug)]
pub enum QaCommands {
    /// Record an inspection result for a part
    Report(ReportArgs),

    /// Sign off a step of a work order
    Signoff(SignoffArgs),
}

#[derive(clap::Args, Debug)]
pub struct ReportArgs {
    /// Inspected part
    #[arg(value_parser = part_id)]
    pub part: EntityId,

    /// Inspection verdict (pass or fail)
    #[arg(long)]
    pub verdict: Verdict,

    /// Step the inspection belongs to (default: the part's current step)
    #[arg(long, value_parser = step_id)]
    pub step: Option<EntityId>,

    /// Measurement as name=value or name=value:min:max (repeatable)
    #[arg(long = "measurement", short = 'm', value_parser = parse_measurement)]
    pub measurements: Vec<Measurement>,

    /// Inspector (default: from config)
    #[arg(long)]
    pub inspector: Option<String>,

    /// Free-form notes
    #[arg(long)]
    pub notes: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct SignoffArgs {
    /// Work order ID or number
    #[arg(long = "wo")]
    pub work_order: String,

    /// Step being signed off
    #[arg(long, value_parser = step_id)]
    pub step: EntityId,

    /// Approver (default: from config)
    #[arg(long)]
    pub approver: Option<String>,

    /// Comment
    #[arg(long)]
    pub comment: Option<String>,
}

pub fn run(cmd: QaCommands, global: &GlobalOpts) -> Result<()> {
    let mut ctx = FlowContext::open(global)?;
    match cmd {
        QaCommands::Report(args) => run_report(&mut ctx, args, global),
        QaCommands::Signoff(args) => run_signoff(&mut ctx, args, global),
    }
}

fn run_report(ctx: &mut FlowContext, args: ReportArgs, global: &GlobalOpts) -> Result<()> {
    let part = ctx.read(|tx| tx.get_part(&args.part))?;
    let step = args.step.unwrap_or_else(|| part.step.clone());

    let mut report = QualityReport::new(&part.id, &part.work_order, &step, args.verdict);
    report.measurements = args.measurements;
    report.inspector = Some(args.inspector.unwrap_or_else(|| ctx.config.author()));
    report.notes = args.notes;

    let format = ctx.format;
    let (engine, store) = ctx.engine();
    let result = engine.record_quality_report(store, &report)?;

    if format.is_structured() {
        return print_structured(&result, format);
    }

    println!(
        "{} Recorded {} report {} for {}",
        style("✓").green(),
        report.verdict,
        style(format_short_id(&result.report)).cyan(),
        format_short_id(&part.id)
    );
    match result.trigger {
        Some(TriggerChange::Activated { ref fallback, .. }) => println!(
            "{} Fallback sampling {} activated at {}",
            style("!").yellow(),
            format_short_id(fallback),
            format_short_id(&step)
        ),
        Some(TriggerChange::Reverted { ref primary, .. }) => println!(
            "{} Sampling reverted to {} at {}",
            style("✓").green(),
            format_short_id(primary),
            format_short_id(&step)
        ),
        None => {}
    }
    if result.decision_required {
        println!(
            "{} Part stays awaiting QA; re-issue with {}",
            style("!").yellow(),
            style("tflow part advance <PART> --decision pass|fail").yellow()
        );
    }
    if let Some(ref transition) = result.transition {
        print_transition(transition, format, global.quiet)?;
    }
    Ok(())
}

fn run_signoff(ctx: &mut FlowContext, args: SignoffArgs, global: &GlobalOpts) -> Result<()> {
    let wo = ctx.work_order(&args.work_order)?;
    let approver = args.approver.unwrap_or_else(|| ctx.config.author());
    let mut signoff = QaSignoff::new(&wo.id, &args.step, approver);
    signoff.comment = args.comment;

    let format = ctx.format;
    let (engine, store) = ctx.engine();
    let result = engine.record_signoff(store, &signoff)?;

    if !format.is_structured() {
        println!(
            "{} {} signed off {} of {}",
            style("✓").green(),
            signoff.approver,
            format_short_id(&signoff.step),
            style(&wo.number).cyan()
        );
    }
    print_transition(&result, format, global.quiet)
}

/// Parse `name=value` or `name=value:min:max`; empty bounds are open
pub fn parse_measurement(s: &str) -> Result<Measurement, String> {
    let (name, rest) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value[:min:max], got '{}'", s))?;
    if name.trim().is_empty() {
        return Err(format!("measurement '{}' has no name", s));
    }

    let number = |part: &str| -> Result<Option<f64>, String> {
        let part = part.trim();
        if part.is_empty() {
            return Ok(None);
        }
        part.parse::<f64>()
            .map(Some)
            .map_err(|_| format!("'{}' is not a number in measurement '{}'", part, s))
    };

    let mut fields = rest.split(':');
    let value = number(fields.next().unwrap_or_default())?
        .ok_or_else(|| format!("measurement '{}' has no value", s))?;
    let min = fields.next().map(&number).transpose()?.flatten();
    let max = fields.next().map(&number).transpose()?.flatten();
    if fields.next().is_some() {
        return Err(format!("too many fields in measurement '{}'", s));
    }

    Ok(Measurement {
        name: name.trim().to_string(),
        value,
        min,
        max,
        unit: None,
    })
}
