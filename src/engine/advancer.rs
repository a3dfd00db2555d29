//! Batch advancer - moves work order cohorts through a process graph
//!
//! A part finishing work at a step is marked ready, and the cohort (all
//! non-terminal parts of the same work order at that step) advances together
//! once every member has settled and the step's gates are open. Every entry
//! point runs as one store transaction; a retryable conflict re-issues the
//! whole request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::core::catalog::Catalog;
use crate::core::config::DEFAULT_CONFLICT_RETRIES;
use crate::core::identity::EntityId;
use crate::core::store::{Store, StoreTx};
use crate::engine::error::{ConfigurationError, EngineError, EngineResult};
use crate::engine::events::{emit, FlowEvent};
use crate::engine::fallback::{FallbackTriggerTracker, TriggerChange};
use crate::engine::graph::ProcessGraph;
use crate::engine::lifecycle::check_transition;
use crate::engine::sampling::SamplingEngine;
use crate::entities::part::{Part, PartStatus};
use crate::entities::process::EdgeType;
use crate::entities::quality::{DecisionResult, QaSignoff, QualityReport, Verdict};
use crate::entities::sampling::SamplingDecision;
use crate::entities::step::{DecisionType, Step, TerminalStatus};
use crate::entities::work_order::WorkOrder;

/// Request to finish work on a part at its current step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub part: EntityId,
    /// Step the caller believes the part is at; a part that already left it
    /// makes the request a no-op
    pub from_step: Option<EntityId>,
    /// Explicit decision for decision steps
    pub decision: Option<DecisionResult>,
}

impl TransitionRequest {
    pub fn new(part: &EntityId) -> Self {
        Self {
            part: part.clone(),
            from_step: None,
            decision: None,
        }
    }

    pub fn from_step(mut self, step: &EntityId) -> Self {
        self.from_step = Some(step.clone());
        self
    }

    pub fn with_decision(mut self, decision: DecisionResult) -> Self {
        self.decision = Some(decision);
        self
    }
}

/// Why a cohort could not leave its step although every member settled
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateBlock {
    Quarantine { count: usize },
    PassThreshold { ratio: f64, threshold: f64 },
    QaSignoff,
    NoReadyParts,
}

impl fmt::Display for GateBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateBlock::Quarantine { count } => write!(f, "{} quarantined part(s) block the cohort", count),
            GateBlock::PassThreshold { ratio, threshold } => write!(
                f,
                "ready ratio {:.2} is below the pass threshold {:.2}",
                ratio, threshold
            ),
            GateBlock::QaSignoff => write!(f, "QA sign-off required"),
            GateBlock::NoReadyParts => write!(f, "no ready parts"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    AwaitingInspection,
    Cohort { settled: usize, total: usize },
    Blocked(GateBlock),
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::AwaitingInspection => write!(f, "awaiting inspection"),
            WaitReason::Cohort { settled, total } => {
                write!(f, "waiting for cohort ({}/{} settled)", settled, total)
            }
            WaitReason::Blocked(block) => write!(f, "blocked: {}", block),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Completed,
    Waiting(WaitReason),
    Advanced,
}

impl TransitionOutcome {
    pub fn is_waiting(&self) -> bool {
        matches!(self, TransitionOutcome::Waiting(_))
    }
}

impl fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionOutcome::Completed => write!(f, "completed"),
            TransitionOutcome::Waiting(reason) => write!(f, "waiting ({})", reason),
            TransitionOutcome::Advanced => write!(f, "advanced"),
        }
    }
}

/// One part leaving a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartMove {
    pub part: EntityId,
    pub from: EntityId,
    pub to: EntityId,
    pub edge_type: EdgeType,
    pub status: PartStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionResult {
    pub outcome: TransitionOutcome,
    /// The part the request was about, as persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part: Option<Part>,
    /// Parts moved by this transition
    pub moved: Vec<PartMove>,
}

/// Result of ingesting a quality report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportResult {
    pub report: EntityId,
    /// Flip or revert of the fallback loop caused by the report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerChange>,
    /// Set when the report moved an inspected part on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<TransitionResult>,
    /// Part stays awaiting QA until a decision is supplied
    pub decision_required: bool,
}

/// Drives parts and cohorts through the graphs of a catalog
pub struct BatchAdvancer<'a> {
    catalog: &'a Catalog,
    conflict_retries: u32,
}

impl<'a> BatchAdvancer<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    // ===== Entry points =====

    /// Create a work order of `quantity` parts at the entry step of `process`
    pub fn create_work_order(
        &self,
        store: &mut Store,
        process: &EntityId,
        quantity: u32,
        number: Option<&str>,
        author: &str,
    ) -> EngineResult<(WorkOrder, Vec<Part>)> {
        if quantity == 0 {
            return Err(EngineError::InvalidRequest(
                "work order quantity must be at least 1".to_string(),
            ));
        }
        let graph = self.catalog.graph(process)?;

        self.run(store, "create_work_order", |tx, now| {
            let number = match number {
                Some(n) => n.to_string(),
                None => format!("WO-{:04}", tx.count_work_orders()? + 1),
            };
            if tx.find_work_order_by_number(&number)?.is_some() {
                return Err(EngineError::InvalidRequest(format!(
                    "work order number '{}' already exists",
                    number
                )));
            }

            let mut wo = WorkOrder::new(
                number,
                graph.part_type(),
                graph.process_id().clone(),
                quantity,
                author,
            );
            wo.created = now;
            tx.insert_work_order(&wo)?;

            let entry = graph.entry_step();
            self.arm_trigger(tx, &wo, &entry.id, now)?;

            let sampling = SamplingEngine::new(self.catalog);
            let mut parts = Vec::with_capacity(quantity as usize);
            for ordinal in 1..=quantity {
                let mut part = Part::new(&wo, ordinal, &entry.id);
                part.created = now;
                part.updated = now;
                part.step_entered = now;
                part.sampling = Some(sampling.resolve(tx, &part, entry, quantity)?);
                tx.insert_part(&part)?;
                parts.push(part);
            }

            emit(
                tx,
                &wo.id,
                None,
                &FlowEvent::WorkOrderCreated {
                    number: wo.number.clone(),
                    process: wo.process.clone(),
                    quantity,
                    entry_step: entry.id.clone(),
                },
                now,
            )?;
            info!(
                work_order = %wo.id,
                number = %wo.number,
                quantity,
                "work order created"
            );
            Ok((wo, parts))
        })
    }

    /// Begin work: PENDING -> IN_PROGRESS, REWORK_NEEDED -> REWORK_IN_PROGRESS
    pub fn start(&self, store: &mut Store, part: &EntityId) -> EngineResult<Part> {
        self.run(store, "start", |tx, now| {
            let mut part = tx.get_part(part)?;
            let to = match part.status {
                PartStatus::ReworkNeeded => PartStatus::ReworkInProgress,
                _ => PartStatus::InProgress,
            };
            check_transition(&part.id, part.status, to)?;
            if to == PartStatus::ReworkInProgress {
                // Reports from before the rework no longer describe the part
                part.step_entered = now;
                part.decision = None;
            }
            part.status = to;
            part.updated = now;
            tx.update_part(&mut part)?;
            emit(
                tx,
                &part.work_order,
                Some(&part.id),
                &FlowEvent::PartStarted {
                    step: part.step.clone(),
                    status: to,
                },
                now,
            )?;
            Ok(part)
        })
    }

    /// Finish work on a part at its current step and try to advance its cohort
    pub fn advance(
        &self,
        store: &mut Store,
        request: &TransitionRequest,
    ) -> EngineResult<TransitionResult> {
        self.run(store, "advance", |tx, now| self.advance_in(tx, request, now))
    }

    /// Re-run barrier, gates and advancement without marking anyone ready
    pub fn reevaluate(
        &self,
        store: &mut Store,
        work_order: &EntityId,
        step: &EntityId,
    ) -> EngineResult<TransitionResult> {
        self.run(store, "reevaluate", |tx, now| {
            let wo = tx.get_work_order(work_order)?;
            let (outcome, moved) = self.evaluate_cohort(tx, &wo, step, now)?;
            Ok(TransitionResult {
                outcome,
                part: None,
                moved,
            })
        })
    }

    /// Hold a part at its step
    pub fn quarantine(&self, store: &mut Store, part: &EntityId) -> EngineResult<TransitionResult> {
        self.run(store, "quarantine", |tx, now| {
            let part = tx.get_part(part)?;
            self.quarantine_in(tx, part, now)
        })
    }

    /// Release a quarantined part back into its cohort as ready
    pub fn release(
        &self,
        store: &mut Store,
        part: &EntityId,
        decision: Option<DecisionResult>,
    ) -> EngineResult<TransitionResult> {
        self.run(store, "release", |tx, now| {
            let part = tx.get_part(part)?;
            if part.status != PartStatus::Quarantined {
                return Err(EngineError::InvalidTransition {
                    part: part.id.clone(),
                    from: part.status,
                    to: PartStatus::ReadyForNextStep,
                });
            }
            let step = self.graph_of(&part)?.require_step(&part.step)?;
            let decision = self.resolve_decision(tx, &part, step, decision)?;
            self.mark_ready(tx, part, decision, now)
        })
    }

    /// Send a quarantined part to rework at its current step
    pub fn rework(&self, store: &mut Store, part: &EntityId) -> EngineResult<Part> {
        self.run(store, "rework", |tx, now| {
            let mut part = tx.get_part(part)?;
            if part.status != PartStatus::Quarantined {
                return Err(EngineError::InvalidTransition {
                    part: part.id.clone(),
                    from: part.status,
                    to: PartStatus::ReworkNeeded,
                });
            }
            self.set_status(tx, &mut part, PartStatus::ReworkNeeded, now)?;
            Ok(part)
        })
    }

    pub fn scrap(&self, store: &mut Store, part: &EntityId) -> EngineResult<TransitionResult> {
        self.run(store, "scrap", |tx, now| {
            self.finish_out_of_band(tx, part, TerminalStatus::Scrapped, now)
        })
    }

    pub fn cancel(&self, store: &mut Store, part: &EntityId) -> EngineResult<TransitionResult> {
        self.run(store, "cancel", |tx, now| {
            self.finish_out_of_band(tx, part, TerminalStatus::Cancelled, now)
        })
    }

    /// Persist a quality report and apply it
    ///
    /// Feeds the fallback loop, then applies the verdict to the part at the
    /// reported step. At qa_result and measurement decision steps the report
    /// decides the edge, also for a part already waiting at the barrier. A FAIL
    /// anywhere else quarantines an awaiting or ready part; a part still being
    /// worked is quarantined when it is advanced.
    pub fn record_quality_report(
        &self,
        store: &mut Store,
        report: &QualityReport,
    ) -> EngineResult<ReportResult> {
        self.run(store, "record_quality_report", |tx, now| {
            let part = tx.get_part(&report.part)?;
            if report.work_order != part.work_order {
                return Err(EngineError::InvalidRequest(format!(
                    "report {} names work order {} but part {} belongs to {}",
                    report.id, report.work_order, part.id, part.work_order
                )));
            }
            let graph = self.graph_of(&part)?;
            if !graph.contains(&report.step) {
                return Err(EngineError::InvalidRequest(format!(
                    "step {} is not part of process {}",
                    report.step, part.process
                )));
            }

            tx.insert_quality_report(report)?;
            emit(
                tx,
                &part.work_order,
                Some(&part.id),
                &FlowEvent::QualityReported {
                    report: report.id.clone(),
                    step: report.step.clone(),
                    verdict: report.verdict,
                },
                now,
            )?;

            let tracker = FallbackTriggerTracker::new(self.catalog);
            let trigger = tracker.record_report(tx, report, &part, now)?;
            if trigger.is_some() {
                self.refresh_sampling(tx, &part.work_order, &report.step, now)?;
            }

            let mut result = ReportResult {
                report: report.id.clone(),
                trigger,
                transition: None,
                decision_required: false,
            };
            if part.step != report.step {
                return Ok(result);
            }
            let step = graph.require_step(&part.step)?;
            if report.verdict == Verdict::Fail
                && !fail_routes(step)
                && matches!(
                    part.status,
                    PartStatus::AwaitingQa | PartStatus::ReadyForNextStep
                )
            {
                result.transition = Some(self.quarantine_in(tx, part, now)?);
                return Ok(result);
            }

            match part.status {
                PartStatus::AwaitingQa => match self.resolve_decision(tx, &part, step, None) {
                    Ok(decision) => {
                        result.transition = Some(self.mark_ready(tx, part, decision, now)?);
                    }
                    Err(EngineError::InvalidDecision { reason, .. }) => {
                        warn!(
                            part = %part.id,
                            step = %part.step,
                            reason = %reason,
                            "inspection recorded but the step needs an explicit decision"
                        );
                        result.decision_required = true;
                    }
                    Err(err) => return Err(err),
                },
                PartStatus::ReadyForNextStep if fail_routes(step) => {
                    self.redecide(tx, part, step, report, now)?;
                }
                _ => {}
            }
            Ok(result)
        })
    }

    /// Record a QA sign-off and re-evaluate the signed-off cohort
    pub fn record_signoff(
        &self,
        store: &mut Store,
        signoff: &QaSignoff,
    ) -> EngineResult<TransitionResult> {
        self.run(store, "record_signoff", |tx, now| {
            let wo = tx.get_work_order(&signoff.work_order)?;
            let graph = self.catalog.graph(&wo.process)?;
            if !graph.contains(&signoff.step) {
                return Err(EngineError::InvalidRequest(format!(
                    "step {} is not part of process {}",
                    signoff.step, wo.process
                )));
            }
            tx.insert_signoff(signoff)?;
            emit(
                tx,
                &wo.id,
                None,
                &FlowEvent::QaSignedOff {
                    step: signoff.step.clone(),
                    approver: signoff.approver.clone(),
                },
                now,
            )?;
            let (outcome, moved) = self.evaluate_cohort(tx, &wo, &signoff.step, now)?;
            Ok(TransitionResult {
                outcome,
                part: None,
                moved,
            })
        })
    }

    /// Sampling decision the part would get at its current step right now
    pub fn resolve_sampling(
        &self,
        store: &mut Store,
        part: &EntityId,
    ) -> EngineResult<SamplingDecision> {
        self.run(store, "resolve_sampling", |tx, _now| {
            let part = tx.get_part(part)?;
            let wo = tx.get_work_order(&part.work_order)?;
            let step = self.graph_of(&part)?.require_step(&part.step)?;
            SamplingEngine::new(self.catalog).resolve(tx, &part, step, wo.quantity)
        })
    }

    // ===== Transaction bodies =====

    /// Run `f` in a transaction, re-issuing it on retryable conflicts
    fn run<T, F>(&self, store: &mut Store, operation: &'static str, f: F) -> EngineResult<T>
    where
        F: Fn(&StoreTx<'_>, DateTime<Utc>) -> EngineResult<T>,
    {
        let mut attempt = 0;
        loop {
            match store.transaction(|tx| f(tx, Utc::now())) {
                Err(err) if err.is_retryable() && attempt < self.conflict_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %err, "store conflict, retrying");
                }
                result => return result,
            }
        }
    }

    fn advance_in(
        &self,
        tx: &StoreTx<'_>,
        request: &TransitionRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<TransitionResult> {
        let mut part = tx.get_part(&request.part)?;

        if let Some(from) = &request.from_step {
            if &part.step != from {
                debug!(part = %part.id, expected = %from, actual = %part.step, "part already left the step");
                return Ok(settled_result(part));
            }
        }
        if part.status.is_terminal() {
            return Ok(settled_result(part));
        }

        let graph = self.graph_of(&part)?;
        let step = graph.require_step(&part.step)?;

        match part.status {
            PartStatus::InProgress | PartStatus::ReworkInProgress | PartStatus::AwaitingQa => {}
            PartStatus::ReadyForNextStep => {
                let wo = tx.get_work_order(&part.work_order)?;
                let (outcome, moved) = self.evaluate_cohort(tx, &wo, &part.step, now)?;
                return self.finish_result(tx, &part.id, outcome, moved);
            }
            other => {
                return Err(EngineError::InvalidTransition {
                    part: part.id.clone(),
                    from: other,
                    to: PartStatus::ReadyForNextStep,
                })
            }
        }

        if let Some(terminal) = step.kind.terminal_status() {
            part.terminal_status = Some(terminal);
            self.set_status(tx, &mut part, terminal.part_status(), now)?;
            return Ok(settled_result(part));
        }

        if part.requires_sampling()
            && tx
                .latest_report(&part.id, &part.step, &part.step_entered)?
                .is_none()
        {
            if part.status != PartStatus::AwaitingQa {
                check_transition(&part.id, part.status, PartStatus::AwaitingQa)?;
                part.status = PartStatus::AwaitingQa;
                part.updated = now;
                tx.update_part(&mut part)?;
                let rule = part
                    .sampling
                    .as_ref()
                    .and_then(|s| s.rule.as_ref())
                    .map(|r| r.rule_type);
                emit(
                    tx,
                    &part.work_order,
                    Some(&part.id),
                    &FlowEvent::PartAwaitingQa {
                        step: part.step.clone(),
                        rule,
                    },
                    now,
                )?;
            }
            return Ok(TransitionResult {
                outcome: TransitionOutcome::Waiting(WaitReason::AwaitingInspection),
                part: Some(part),
                moved: Vec::new(),
            });
        }

        if !fail_routes(step) {
            let latest = tx.latest_report(&part.id, &part.step, &part.step_entered)?;
            if latest.is_some_and(|r| r.verdict == Verdict::Fail) {
                info!(
                    part = %part.id,
                    step = %part.step,
                    "failed inspection on record, holding part"
                );
                return self.quarantine_in(tx, part, now);
            }
        }

        let decision = self.resolve_decision(tx, &part, step, request.decision)?;
        self.mark_ready(tx, part, decision, now)
    }

    /// Re-derive the decision of a ready part from a report recorded after it was marked ready
    fn redecide(
        &self,
        tx: &StoreTx<'_>,
        mut part: Part,
        step: &Step,
        report: &QualityReport,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let decision = match step.kind.decision_type() {
            Some(DecisionType::Measurement) => report.measurement_decision(),
            _ => Some(DecisionResult::from(report.verdict)),
        };
        let Some(decision) = decision else {
            warn!(
                part = %part.id,
                step = %step.id,
                report = %report.id,
                "report without measurements leaves the recorded decision in place"
            );
            return Ok(());
        };
        if part.decision == Some(decision) {
            return Ok(());
        }

        debug!(
            part = %part.id,
            step = %step.id,
            from = ?part.decision,
            to = %decision,
            "decision updated by report"
        );
        part.decision = Some(decision);
        part.updated = now;
        tx.update_part(&mut part)?;
        emit(
            tx,
            &part.work_order,
            Some(&part.id),
            &FlowEvent::PartReady {
                step: part.step.clone(),
                decision: Some(decision),
            },
            now,
        )?;
        Ok(())
    }

    fn mark_ready(
        &self,
        tx: &StoreTx<'_>,
        mut part: Part,
        decision: Option<DecisionResult>,
        now: DateTime<Utc>,
    ) -> EngineResult<TransitionResult> {
        check_transition(&part.id, part.status, PartStatus::ReadyForNextStep)?;
        part.status = PartStatus::ReadyForNextStep;
        part.decision = decision;
        part.updated = now;
        tx.update_part(&mut part)?;
        emit(
            tx,
            &part.work_order,
            Some(&part.id),
            &FlowEvent::PartReady {
                step: part.step.clone(),
                decision,
            },
            now,
        )?;

        let wo = tx.get_work_order(&part.work_order)?;
        let (outcome, moved) = self.evaluate_cohort(tx, &wo, &part.step, now)?;
        self.finish_result(tx, &part.id, outcome, moved)
    }

    fn quarantine_in(
        &self,
        tx: &StoreTx<'_>,
        mut part: Part,
        now: DateTime<Utc>,
    ) -> EngineResult<TransitionResult> {
        self.set_status(tx, &mut part, PartStatus::Quarantined, now)?;
        let wo = tx.get_work_order(&part.work_order)?;
        let (outcome, moved) = self.evaluate_cohort(tx, &wo, &part.step, now)?;
        self.finish_result(tx, &part.id, outcome, moved)
    }

    /// Scrap or cancel a part outside of the graph; its cohort may be unblocked
    fn finish_out_of_band(
        &self,
        tx: &StoreTx<'_>,
        part: &EntityId,
        terminal: TerminalStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<TransitionResult> {
        let mut part = tx.get_part(part)?;
        part.terminal_status = Some(terminal);
        self.set_status(tx, &mut part, terminal.part_status(), now)?;
        let wo = tx.get_work_order(&part.work_order)?;
        let (_, moved) = self.evaluate_cohort(tx, &wo, &part.step, now)?;
        Ok(TransitionResult {
            outcome: TransitionOutcome::Completed,
            part: Some(part),
            moved,
        })
    }

    fn set_status(
        &self,
        tx: &StoreTx<'_>,
        part: &mut Part,
        to: PartStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let from = part.status;
        check_transition(&part.id, from, to)?;
        part.status = to;
        part.updated = now;
        tx.update_part(part)?;
        emit(
            tx,
            &part.work_order,
            Some(&part.id),
            &FlowEvent::PartStatusChanged {
                step: part.step.clone(),
                from,
                to,
            },
            now,
        )?;
        Ok(())
    }

    /// Barrier, gates and advancement for the cohort of a work order at a step
    fn evaluate_cohort(
        &self,
        tx: &StoreTx<'_>,
        wo: &WorkOrder,
        step_id: &EntityId,
        now: DateTime<Utc>,
    ) -> EngineResult<(TransitionOutcome, Vec<PartMove>)> {
        let graph = self.catalog.graph(&wo.process)?;
        let step = graph.require_step(step_id)?;

        let cohort: Vec<Part> = tx
            .parts_at_step(&wo.id, step_id)?
            .into_iter()
            .filter(|p| !p.status.is_terminal())
            .collect();
        if cohort.is_empty() {
            return Ok((TransitionOutcome::Advanced, Vec::new()));
        }

        let settled = cohort.iter().filter(|p| p.status.is_settled()).count();
        if settled < cohort.len() {
            debug!(
                work_order = %wo.id,
                step = %step_id,
                settled,
                total = cohort.len(),
                "cohort not settled"
            );
            return Ok((
                TransitionOutcome::Waiting(WaitReason::Cohort {
                    settled,
                    total: cohort.len(),
                }),
                Vec::new(),
            ));
        }

        if let Some(block) = self.gate(tx, wo, step, &cohort)? {
            info!(work_order = %wo.id, step = %step_id, reason = %block, "cohort blocked");
            emit(
                tx,
                &wo.id,
                None,
                &FlowEvent::CohortBlocked {
                    step: step_id.clone(),
                    reason: block.to_string(),
                },
                now,
            )?;
            return Ok((TransitionOutcome::Waiting(WaitReason::Blocked(block)), Vec::new()));
        }

        let mut moved = Vec::new();
        let mut armed = BTreeSet::new();
        for mut part in cohort
            .into_iter()
            .filter(|p| p.status == PartStatus::ReadyForNextStep)
        {
            moved.push(self.move_part(tx, graph, step, wo, &mut part, &mut armed, now)?);
        }

        info!(
            work_order = %wo.id,
            step = %step_id,
            moved = moved.len(),
            "cohort advanced"
        );
        emit(
            tx,
            &wo.id,
            None,
            &FlowEvent::CohortAdvanced {
                step: step_id.clone(),
                moved: moved.len(),
            },
            now,
        )?;
        Ok((TransitionOutcome::Advanced, moved))
    }

    fn gate(
        &self,
        tx: &StoreTx<'_>,
        wo: &WorkOrder,
        step: &Step,
        cohort: &[Part],
    ) -> EngineResult<Option<GateBlock>> {
        let quarantined = cohort
            .iter()
            .filter(|p| p.status == PartStatus::Quarantined)
            .count();
        if step.block_on_quarantine && quarantined > 0 {
            return Ok(Some(GateBlock::Quarantine { count: quarantined }));
        }

        let ready = cohort.len() - quarantined;
        if ready == 0 {
            return Ok(Some(GateBlock::NoReadyParts));
        }

        let ratio = ready as f64 / cohort.len() as f64;
        if ratio < step.pass_threshold {
            return Ok(Some(GateBlock::PassThreshold {
                ratio,
                threshold: step.pass_threshold,
            }));
        }

        if step.requires_qa_signoff && !tx.has_signoff(&wo.id, &step.id)? {
            return Ok(Some(GateBlock::QaSignoff));
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn move_part(
        &self,
        tx: &StoreTx<'_>,
        graph: &ProcessGraph,
        step: &Step,
        wo: &WorkOrder,
        part: &mut Part,
        armed: &mut BTreeSet<EntityId>,
        now: DateTime<Utc>,
    ) -> EngineResult<PartMove> {
        let edge_type = select_edge(graph, step, part)?;
        let target_id = graph
            .edge(&step.id, edge_type)
            .cloned()
            .ok_or_else(|| ConfigurationError::MissingEdge {
                process: graph.process_id().clone(),
                step: step.id.clone(),
                edge_type,
            })?;
        let target = graph.require_step(&target_id)?;

        let visits = part.record_visit(&step.id);
        let from = part.step.clone();

        match target.kind.terminal_status() {
            Some(terminal) => {
                part.enter_step(&target_id, terminal.part_status(), now);
                part.terminal_status = Some(terminal);
            }
            None => {
                part.enter_step(&target_id, PartStatus::InProgress, now);
                if armed.insert(target_id.clone()) {
                    self.arm_trigger(tx, wo, &target_id, now)?;
                }
                part.sampling =
                    Some(SamplingEngine::new(self.catalog).resolve(tx, part, target, wo.quantity)?);
            }
        }
        tx.update_part(part)?;

        emit(
            tx,
            &wo.id,
            Some(&part.id),
            &FlowEvent::PartMoved {
                from: from.clone(),
                to: target_id.clone(),
                edge_type,
                visits,
            },
            now,
        )?;
        if let Some(terminal) = part.terminal_status {
            emit(
                tx,
                &wo.id,
                Some(&part.id),
                &FlowEvent::PartCompleted {
                    step: target_id.clone(),
                    terminal_status: terminal,
                },
                now,
            )?;
        }

        Ok(PartMove {
            part: part.id.clone(),
            from,
            to: target_id,
            edge_type,
            status: part.status,
        })
    }

    /// Decision for the part at a step, in priority order: explicit, stored, derived
    fn resolve_decision(
        &self,
        tx: &StoreTx<'_>,
        part: &Part,
        step: &Step,
        explicit: Option<DecisionResult>,
    ) -> EngineResult<Option<DecisionResult>> {
        let Some(decision_type) = step.kind.decision_type() else {
            return Ok(None);
        };
        if let Some(decision) = explicit.or(part.decision) {
            return Ok(Some(decision));
        }

        let invalid = |reason: &str| EngineError::InvalidDecision {
            part: part.id.clone(),
            step: step.id.clone(),
            reason: reason.to_string(),
        };
        match decision_type {
            DecisionType::QaResult => tx
                .latest_report(&part.id, &step.id, &part.step_entered)?
                .map(|r| Some(DecisionResult::from(r.verdict)))
                .ok_or_else(|| invalid("no quality report since the part entered the step")),
            DecisionType::Measurement => {
                let report = tx
                    .latest_report(&part.id, &step.id, &part.step_entered)?
                    .ok_or_else(|| invalid("no quality report since the part entered the step"))?;
                report
                    .measurement_decision()
                    .map(Some)
                    .ok_or_else(|| invalid("latest quality report has no measurements"))
            }
            DecisionType::Manual => Err(invalid("manual decision steps need an explicit decision")),
        }
    }

    fn arm_trigger(
        &self,
        tx: &StoreTx<'_>,
        wo: &WorkOrder,
        step: &EntityId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if let Some(primary) = self.catalog.active_ruleset(&wo.part_type, &wo.process, step) {
            FallbackTriggerTracker::new(self.catalog).arm(tx, primary, &wo.id, step, now)?;
        }
        Ok(())
    }

    /// Re-resolve cached sampling of parts still working at a step
    fn refresh_sampling(
        &self,
        tx: &StoreTx<'_>,
        work_order: &EntityId,
        step_id: &EntityId,
        now: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let wo = tx.get_work_order(work_order)?;
        let step = self.catalog.graph(&wo.process)?.require_step(step_id)?;
        let sampling = SamplingEngine::new(self.catalog);

        let mut refreshed = 0;
        for mut part in tx.parts_at_step(work_order, step_id)? {
            if !matches!(
                part.status,
                PartStatus::Pending | PartStatus::InProgress | PartStatus::ReworkInProgress
            ) {
                continue;
            }
            let decision = sampling.resolve(tx, &part, step, wo.quantity)?;
            if part.sampling.as_ref() != Some(&decision) {
                part.sampling = Some(decision);
                part.updated = now;
                tx.update_part(&mut part)?;
                refreshed += 1;
            }
        }
        debug!(work_order = %work_order, step = %step_id, refreshed, "sampling refreshed");
        Ok(refreshed)
    }

    fn graph_of(&self, part: &Part) -> EngineResult<&'a ProcessGraph> {
        Ok(self.catalog.graph(&part.process)?)
    }

    fn finish_result(
        &self,
        tx: &StoreTx<'_>,
        part: &EntityId,
        outcome: TransitionOutcome,
        moved: Vec<PartMove>,
    ) -> EngineResult<TransitionResult> {
        let part = tx.get_part(part)?;
        let outcome = match outcome {
            TransitionOutcome::Advanced if part.status.is_terminal() => {
                TransitionOutcome::Completed
            }
            other => other,
        };
        Ok(TransitionResult {
            outcome,
            part: Some(part),
            moved,
        })
    }
}

/// Steps where a FAIL report selects an edge instead of holding the part
fn fail_routes(step: &Step) -> bool {
    matches!(
        step.kind.decision_type(),
        Some(DecisionType::QaResult | DecisionType::Measurement)
    )
}

/// Result for a request whose work was already done
fn settled_result(part: Part) -> TransitionResult {
    let outcome = if part.status.is_terminal() {
        TransitionOutcome::Completed
    } else {
        TransitionOutcome::Advanced
    };
    TransitionResult {
        outcome,
        part: Some(part),
        moved: Vec::new(),
    }
}

/// Edge a ready part takes out of `step`
///
/// The visit being completed counts: once it exceeds `max_visits` the
/// ESCALATION edge wins over any decision.
fn select_edge(graph: &ProcessGraph, step: &Step, part: &Part) -> EngineResult<EdgeType> {
    let visits = part.visits_at(&step.id) + 1;
    if let Some(max) = step.max_visits {
        if visits > max {
            if graph.edge(&step.id, EdgeType::Escalation).is_some() {
                return Ok(EdgeType::Escalation);
            }
            warn!(
                part = %part.id,
                step = %step.id,
                visits,
                max_visits = max,
                "max_visits exceeded but step has no ESCALATION edge"
            );
        }
    }

    if step.kind.decision_type().is_none() {
        return Ok(EdgeType::Default);
    }
    match part.decision {
        Some(DecisionResult::Pass) => Ok(EdgeType::Default),
        Some(DecisionResult::Fail) => Ok(EdgeType::Alternate),
        None => Err(EngineError::InvalidDecision {
            part: part.id.clone(),
            step: step.id.clone(),
            reason: "ready part has no recorded decision".to_string(),
        }),
    }
}
