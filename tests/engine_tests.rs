//! End-to-end tests of the workflow engine against an in-memory store

use tflow::core::entity::Status;
use tflow::core::identity::EntityId;
use tflow::core::{Catalog, Store, StoreError};
use tflow::engine::{
    BatchAdvancer, ConfigurationError, EngineError, GateBlock, TransitionOutcome,
    TransitionRequest, TransitionResult, TriggerChange, WaitReason,
};
use tflow::entities::{
    DecisionResult, DecisionType, EdgeType, Measurement, Part, PartStatus, Process, QaSignoff,
    QualityReport, RuleType, SamplingRuleSet, Step, StepKind, TerminalStatus, Verdict,
};

const PART_TYPE: &str = "PUMP-100";

fn step(title: &str, kind: StepKind) -> Step {
    Step::new(title, kind, "test")
}

fn ship() -> Step {
    step(
        "Ship",
        StepKind::Terminal {
            terminal_status: TerminalStatus::Shipped,
        },
    )
}

/// Released process over `steps` (first one is the entry) with edges by index
fn released(steps: &[&Step], edges: &[(usize, usize, EdgeType)]) -> Process {
    let mut process = Process::new("Line", PART_TYPE, "test");
    process.status = Status::Released;
    for (i, s) in steps.iter().enumerate() {
        process.add_step(&s.id, (i as u32 + 1) * 10, i == 0);
    }
    for (from, to, edge_type) in edges {
        process.add_edge(&steps[*from].id, &steps[*to].id, *edge_type);
    }
    process
}

/// Start -> work -> Ship, with `work` configured by the caller
fn linear(work: Step) -> (Process, Vec<Step>) {
    let start = step("Receive", StepKind::Start);
    let end = ship();
    let process = released(
        &[&start, &work, &end],
        &[(0, 1, EdgeType::Default), (1, 2, EdgeType::Default)],
    );
    (process, vec![start, work, end])
}

/// Fresh in-memory state with engine logs captured per test
fn store() -> Store {
    tflow::logging::init_test();
    Store::open_in_memory().unwrap()
}

fn get(store: &mut Store, id: &EntityId) -> Part {
    store.transaction(|tx| tx.get_part(id)).unwrap()
}

fn ids(parts: &[Part]) -> Vec<EntityId> {
    parts.iter().map(|p| p.id.clone()).collect()
}

fn start_all(engine: &BatchAdvancer<'_>, store: &mut Store, parts: &[EntityId]) {
    for id in parts {
        engine.start(store, id).unwrap();
    }
}

fn advance_all(
    engine: &BatchAdvancer<'_>,
    store: &mut Store,
    parts: &[EntityId],
) -> Vec<TransitionResult> {
    parts
        .iter()
        .map(|id| engine.advance(store, &TransitionRequest::new(id)).unwrap())
        .collect()
}

/// Start and advance every part off the entry step
fn leave_entry(engine: &BatchAdvancer<'_>, store: &mut Store, parts: &[EntityId]) {
    start_all(engine, store, parts);
    let results = advance_all(engine, store, parts);
    assert_eq!(results.last().unwrap().moved.len(), parts.len());
}

// ===== Barrier =====

#[test]
fn cohort_waits_for_every_part_then_moves_together() {
    let (process, steps) = linear(step("Machine", StepKind::Task));
    let machine = steps[1].id.clone();
    let catalog = Catalog::new(vec![process.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 3, None, "planner")
        .unwrap();
    assert_eq!(wo.number, "WO-0001");
    assert!(parts.iter().all(|p| p.status == PartStatus::Pending));
    let parts = ids(&parts);
    start_all(&engine, &mut store, &parts);

    let first = engine.advance(&mut store, &TransitionRequest::new(&parts[0])).unwrap();
    assert_eq!(
        first.outcome,
        TransitionOutcome::Waiting(WaitReason::Cohort {
            settled: 1,
            total: 3
        })
    );
    let second = engine.advance(&mut store, &TransitionRequest::new(&parts[1])).unwrap();
    assert!(second.outcome.is_waiting());
    assert!(second.moved.is_empty());
    assert_eq!(get(&mut store, &parts[0]).status, PartStatus::ReadyForNextStep);

    let last = engine.advance(&mut store, &TransitionRequest::new(&parts[2])).unwrap();
    assert_eq!(last.outcome, TransitionOutcome::Advanced);
    assert_eq!(last.moved.len(), 3);
    for id in &parts {
        let part = get(&mut store, id);
        assert_eq!(part.step, machine);
        assert_eq!(part.status, PartStatus::InProgress);
        assert_eq!(part.visits.values().sum::<u32>(), 1);
    }

    let events = store
        .transaction(|tx| tx.events_for_work_order(&wo.id))
        .unwrap();
    assert_eq!(events.first().unwrap().kind, "work_order_created");
    assert_eq!(
        events.iter().filter(|e| e.kind == "part_moved").count(),
        3
    );
    assert!(events.iter().any(|e| e.kind == "cohort_advanced"));
}

#[test]
fn cohort_reaching_terminal_step_completes() {
    let (process, steps) = linear(step("Machine", StepKind::Task));
    let catalog = Catalog::new(vec![process.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (_, parts) = engine
        .create_work_order(&mut store, &process.id, 2, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);

    let results = advance_all(&engine, &mut store, &parts);
    assert_eq!(results[1].outcome, TransitionOutcome::Completed);
    for id in &parts {
        let part = get(&mut store, id);
        assert_eq!(part.status, PartStatus::Completed);
        assert_eq!(part.terminal_status, Some(TerminalStatus::Shipped));
    }

    // Terminal parts are never moved again
    let again = engine.advance(&mut store, &TransitionRequest::new(&parts[0])).unwrap();
    assert_eq!(again.outcome, TransitionOutcome::Completed);
    assert!(again.moved.is_empty());
}

#[test]
fn repeated_request_for_departed_step_is_a_no_op() {
    let (process, steps) = linear(step("Machine", StepKind::Task));
    let entry = steps[0].id.clone();
    let machine = steps[1].id.clone();
    let catalog = Catalog::new(vec![process.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (_, parts) = engine
        .create_work_order(&mut store, &process.id, 1, None, "planner")
        .unwrap();
    let part = parts[0].id.clone();
    engine.start(&mut store, &part).unwrap();

    let request = TransitionRequest::new(&part).from_step(&entry);
    let first = engine.advance(&mut store, &request).unwrap();
    assert_eq!(first.moved.len(), 1);

    let replay = engine.advance(&mut store, &request).unwrap();
    assert_eq!(replay.outcome, TransitionOutcome::Advanced);
    assert!(replay.moved.is_empty());
    let after = get(&mut store, &part);
    assert_eq!(after.step, machine);
    assert_eq!(after.status, PartStatus::InProgress);
    assert_eq!(after.visits_at(&entry), 1);
}

#[test]
fn advancing_a_pending_part_is_rejected() {
    let (process, steps) = linear(step("Machine", StepKind::Task));
    let catalog = Catalog::new(vec![process.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (_, parts) = engine
        .create_work_order(&mut store, &process.id, 1, None, "planner")
        .unwrap();
    let err = engine
        .advance(&mut store, &TransitionRequest::new(&parts[0].id))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: PartStatus::Pending,
            ..
        }
    ));
}

// ===== Decisions and rework bound =====

#[test]
fn rework_loop_escalates_after_max_visits() {
    let start = step("Receive", StepKind::Start);
    let inspect = step(
        "Inspect",
        StepKind::Decision {
            decision_type: DecisionType::QaResult,
        },
    );
    let mut rework = step("Rework", StepKind::Rework);
    rework.max_visits = Some(3);
    let review = step(
        "Scrap review",
        StepKind::Decision {
            decision_type: DecisionType::Manual,
        },
    );
    let end = ship();
    let scrap = step(
        "Scrap",
        StepKind::Terminal {
            terminal_status: TerminalStatus::Scrapped,
        },
    );
    let process = released(
        &[&start, &inspect, &rework, &review, &end, &scrap],
        &[
            (0, 1, EdgeType::Default),
            (1, 4, EdgeType::Default),
            (1, 2, EdgeType::Alternate),
            (2, 1, EdgeType::Default),
            (2, 3, EdgeType::Escalation),
            (3, 4, EdgeType::Default),
            (3, 5, EdgeType::Alternate),
        ],
    );
    let (inspect_id, rework_id, review_id) =
        (inspect.id.clone(), rework.id.clone(), review.id.clone());
    let catalog = Catalog::new(
        vec![process.clone()],
        vec![start, inspect, rework, review, end, scrap],
        vec![],
    )
    .unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (_, parts) = engine
        .create_work_order(&mut store, &process.id, 1, None, "planner")
        .unwrap();
    let part = parts[0].id.clone();
    leave_entry(&engine, &mut store, &[part.clone()]);

    let fail = TransitionRequest::new(&part).with_decision(DecisionResult::Fail);
    for round in 1..=3 {
        let at_inspect = engine.advance(&mut store, &fail).unwrap();
        assert_eq!(at_inspect.moved[0].edge_type, EdgeType::Alternate);
        assert_eq!(at_inspect.moved[0].to, rework_id);

        let at_rework = engine.advance(&mut store, &TransitionRequest::new(&part)).unwrap();
        assert_eq!(at_rework.moved[0].edge_type, EdgeType::Default, "round {}", round);
        assert_eq!(at_rework.moved[0].to, inspect_id);
    }

    engine.advance(&mut store, &fail).unwrap();
    let fourth = engine.advance(&mut store, &TransitionRequest::new(&part)).unwrap();
    assert_eq!(fourth.moved[0].edge_type, EdgeType::Escalation);
    assert_eq!(fourth.moved[0].to, review_id);
    assert_eq!(get(&mut store, &part).visits_at(&rework_id), 4);

    // Manual decision steps never derive a decision
    let err = engine
        .advance(&mut store, &TransitionRequest::new(&part))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDecision { .. }));
    assert_eq!(get(&mut store, &part).status, PartStatus::InProgress);

    let scrapped = engine.advance(&mut store, &fail).unwrap();
    assert_eq!(scrapped.outcome, TransitionOutcome::Completed);
    let part = get(&mut store, &part);
    assert_eq!(part.status, PartStatus::Scrapped);
    assert_eq!(part.terminal_status, Some(TerminalStatus::Scrapped));
}

#[test]
fn qa_result_decision_follows_latest_report() {
    let start = step("Receive", StepKind::Start);
    let mut inspect = step(
        "Inspect",
        StepKind::Decision {
            decision_type: DecisionType::QaResult,
        },
    );
    inspect.sampling_required = true;
    let end = ship();
    let scrap = step(
        "Scrap",
        StepKind::Terminal {
            terminal_status: TerminalStatus::Scrapped,
        },
    );
    let process = released(
        &[&start, &inspect, &end, &scrap],
        &[
            (0, 1, EdgeType::Default),
            (1, 2, EdgeType::Default),
            (1, 3, EdgeType::Alternate),
        ],
    );
    let rules = SamplingRuleSet::new("All", PART_TYPE, &process.id, &inspect.id, "qa")
        .with_rule(RuleType::FirstNParts, 10.0, 0);
    let inspect_id = inspect.id.clone();
    let catalog = Catalog::new(
        vec![process.clone()],
        vec![start, inspect, end, scrap],
        vec![rules],
    )
    .unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 1, None, "planner")
        .unwrap();
    let part = parts[0].id.clone();
    leave_entry(&engine, &mut store, &[part.clone()]);
    assert!(get(&mut store, &part).requires_sampling());

    let waiting = engine.advance(&mut store, &TransitionRequest::new(&part)).unwrap();
    assert_eq!(
        waiting.outcome,
        TransitionOutcome::Waiting(WaitReason::AwaitingInspection)
    );
    assert_eq!(get(&mut store, &part).status, PartStatus::AwaitingQa);

    // FAIL at a qa_result step routes over ALTERNATE instead of quarantining
    let report = QualityReport::new(&part, &wo.id, &inspect_id, Verdict::Fail);
    let result = engine.record_quality_report(&mut store, &report).unwrap();
    assert!(!result.decision_required);
    let transition = result.transition.unwrap();
    assert_eq!(transition.moved[0].edge_type, EdgeType::Alternate);
    assert_eq!(get(&mut store, &part).status, PartStatus::Scrapped);
}

#[test]
fn report_after_ready_updates_decision_before_cohort_moves() {
    let start = step("Receive", StepKind::Start);
    let mut inspect = step(
        "Inspect",
        StepKind::Decision {
            decision_type: DecisionType::QaResult,
        },
    );
    inspect.sampling_required = true;
    let end = ship();
    let scrap = step(
        "Scrap",
        StepKind::Terminal {
            terminal_status: TerminalStatus::Scrapped,
        },
    );
    let process = released(
        &[&start, &inspect, &end, &scrap],
        &[
            (0, 1, EdgeType::Default),
            (1, 2, EdgeType::Default),
            (1, 3, EdgeType::Alternate),
        ],
    );
    let rules = SamplingRuleSet::new("All", PART_TYPE, &process.id, &inspect.id, "qa")
        .with_rule(RuleType::FirstNParts, 10.0, 0);
    let inspect_id = inspect.id.clone();
    let catalog = Catalog::new(
        vec![process.clone()],
        vec![start, inspect, end, scrap],
        vec![rules],
    )
    .unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 2, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);
    advance_all(&engine, &mut store, &parts);

    let pass = QualityReport::new(&parts[0], &wo.id, &inspect_id, Verdict::Pass);
    engine.record_quality_report(&mut store, &pass).unwrap();
    let ready = get(&mut store, &parts[0]);
    assert_eq!(ready.status, PartStatus::ReadyForNextStep);
    assert_eq!(ready.decision, Some(DecisionResult::Pass));

    // Re-inspection while the part waits at the barrier
    let fail = QualityReport::new(&parts[0], &wo.id, &inspect_id, Verdict::Fail);
    let result = engine.record_quality_report(&mut store, &fail).unwrap();
    assert!(result.transition.is_none());
    let waiting = get(&mut store, &parts[0]);
    assert_eq!(waiting.status, PartStatus::ReadyForNextStep);
    assert_eq!(waiting.decision, Some(DecisionResult::Fail));

    let pass = QualityReport::new(&parts[1], &wo.id, &inspect_id, Verdict::Pass);
    let moved = engine
        .record_quality_report(&mut store, &pass)
        .unwrap()
        .transition
        .unwrap()
        .moved;
    assert_eq!(moved.len(), 2);
    let edge_of = |part: &EntityId| moved.iter().find(|m| &m.part == part).unwrap().edge_type;
    assert_eq!(edge_of(&parts[0]), EdgeType::Alternate);
    assert_eq!(edge_of(&parts[1]), EdgeType::Default);
    assert_eq!(get(&mut store, &parts[0]).status, PartStatus::Scrapped);
    assert_eq!(get(&mut store, &parts[1]).status, PartStatus::Completed);
}

#[test]
fn measurement_decision_routes_on_limits() {
    let start = step("Receive", StepKind::Start);
    let measure = step(
        "Measure bore",
        StepKind::Decision {
            decision_type: DecisionType::Measurement,
        },
    );
    let end = ship();
    let regrind = step(
        "Regrind",
        StepKind::Terminal {
            terminal_status: TerminalStatus::Returned,
        },
    );
    let process = released(
        &[&start, &measure, &end, &regrind],
        &[
            (0, 1, EdgeType::Default),
            (1, 2, EdgeType::Default),
            (1, 3, EdgeType::Alternate),
        ],
    );
    let measure_id = measure.id.clone();
    let catalog = Catalog::new(
        vec![process.clone()],
        vec![start, measure, end, regrind],
        vec![],
    )
    .unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 3, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);

    let bore = |value: f64| Measurement {
        name: "bore".to_string(),
        value,
        min: Some(9.9),
        max: Some(10.1),
        unit: Some("mm".to_string()),
    };
    let mut oversize = QualityReport::new(&parts[0], &wo.id, &measure_id, Verdict::Fail);
    oversize.measurements = vec![bore(10.25)];
    let mut nominal = QualityReport::new(&parts[1], &wo.id, &measure_id, Verdict::Pass);
    nominal.measurements = vec![bore(10.02)];
    let unmeasured = QualityReport::new(&parts[2], &wo.id, &measure_id, Verdict::Pass);
    for report in [&oversize, &nominal, &unmeasured] {
        engine.record_quality_report(&mut store, report).unwrap();
    }

    advance_all(&engine, &mut store, &parts[..2]);
    assert_eq!(get(&mut store, &parts[0]).decision, Some(DecisionResult::Fail));
    assert_eq!(get(&mut store, &parts[1]).decision, Some(DecisionResult::Pass));

    let err = engine
        .advance(&mut store, &TransitionRequest::new(&parts[2]))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDecision { .. }));
    assert_eq!(get(&mut store, &parts[2]).status, PartStatus::InProgress);

    let result = engine
        .advance(
            &mut store,
            &TransitionRequest::new(&parts[2]).with_decision(DecisionResult::Pass),
        )
        .unwrap();
    assert_eq!(result.moved.len(), 3);
    let edge_of = |part: &EntityId| {
        result
            .moved
            .iter()
            .find(|m| &m.part == part)
            .unwrap()
            .edge_type
    };
    assert_eq!(edge_of(&parts[0]), EdgeType::Alternate);
    assert_eq!(edge_of(&parts[1]), EdgeType::Default);
    assert_eq!(edge_of(&parts[2]), EdgeType::Default);
}

// ===== Inspection and gates =====

#[test]
fn failed_inspection_quarantines_and_blocks_cohort() {
    let mut machine = step("Machine", StepKind::Task);
    machine.sampling_required = true;
    machine.block_on_quarantine = true;
    let (process, steps) = linear(machine);
    let machine_id = steps[1].id.clone();
    let rules = SamplingRuleSet::new("First", PART_TYPE, &process.id, &machine_id, "qa")
        .with_rule(RuleType::FirstNParts, 1.0, 0);
    let catalog = Catalog::new(vec![process.clone()], steps, vec![rules]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 2, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);

    let results = advance_all(&engine, &mut store, &parts);
    assert_eq!(
        results[0].outcome,
        TransitionOutcome::Waiting(WaitReason::AwaitingInspection)
    );
    assert_eq!(
        results[1].outcome,
        TransitionOutcome::Waiting(WaitReason::Cohort {
            settled: 1,
            total: 2
        })
    );

    let report = QualityReport::new(&parts[0], &wo.id, &machine_id, Verdict::Fail);
    let result = engine.record_quality_report(&mut store, &report).unwrap();
    let transition = result.transition.unwrap();
    assert_eq!(
        transition.outcome,
        TransitionOutcome::Waiting(WaitReason::Blocked(GateBlock::Quarantine { count: 1 }))
    );
    assert_eq!(get(&mut store, &parts[0]).status, PartStatus::Quarantined);

    // Releasing the held part opens the gate for both
    let released = engine.release(&mut store, &parts[0], None).unwrap();
    assert_eq!(released.outcome, TransitionOutcome::Completed);
    assert_eq!(released.moved.len(), 2);
}

#[test]
fn failed_report_holds_part_whenever_it_arrives() {
    let mut machine = step("Machine", StepKind::Task);
    machine.sampling_required = true;
    machine.block_on_quarantine = true;
    let (process, steps) = linear(machine);
    let machine_id = steps[1].id.clone();
    let rules = SamplingRuleSet::new("First", PART_TYPE, &process.id, &machine_id, "qa")
        .with_rule(RuleType::FirstNParts, 1.0, 0);
    let catalog = Catalog::new(vec![process.clone()], steps, vec![rules]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 2, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);

    let second = engine.advance(&mut store, &TransitionRequest::new(&parts[1])).unwrap();
    assert!(second.outcome.is_waiting());

    // Inspected before the operator finished the step
    let early = QualityReport::new(&parts[0], &wo.id, &machine_id, Verdict::Fail);
    let recorded = engine.record_quality_report(&mut store, &early).unwrap();
    assert!(recorded.transition.is_none());
    assert_eq!(get(&mut store, &parts[0]).status, PartStatus::InProgress);

    let held = engine.advance(&mut store, &TransitionRequest::new(&parts[0])).unwrap();
    assert_eq!(
        held.outcome,
        TransitionOutcome::Waiting(WaitReason::Blocked(GateBlock::Quarantine { count: 1 }))
    );
    assert!(held.moved.is_empty());
    assert_eq!(get(&mut store, &parts[0]).status, PartStatus::Quarantined);

    // A FAIL for a part already waiting at the barrier holds it as well
    let late = QualityReport::new(&parts[1], &wo.id, &machine_id, Verdict::Fail);
    let transition = engine
        .record_quality_report(&mut store, &late)
        .unwrap()
        .transition
        .unwrap();
    assert_eq!(
        transition.outcome,
        TransitionOutcome::Waiting(WaitReason::Blocked(GateBlock::Quarantine { count: 2 }))
    );
    let part = get(&mut store, &parts[1]);
    assert_eq!(part.status, PartStatus::Quarantined);
    assert_eq!(part.step, machine_id);
}

#[test]
fn pass_threshold_moves_ready_parts_and_leaves_quarantined() {
    let mut machine = step("Machine", StepKind::Task);
    machine.pass_threshold = 0.5;
    let (process, steps) = linear(machine);
    let machine_id = steps[1].id.clone();
    let catalog = Catalog::new(vec![process.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (_, parts) = engine
        .create_work_order(&mut store, &process.id, 3, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);

    engine.quarantine(&mut store, &parts[0]).unwrap();
    engine.quarantine(&mut store, &parts[1]).unwrap();
    let blocked = engine.advance(&mut store, &TransitionRequest::new(&parts[2])).unwrap();
    assert!(matches!(
        blocked.outcome,
        TransitionOutcome::Waiting(WaitReason::Blocked(GateBlock::PassThreshold { .. }))
    ));

    let released = engine.release(&mut store, &parts[1], None).unwrap();
    assert_eq!(released.moved.len(), 2);
    let held = get(&mut store, &parts[0]);
    assert_eq!(held.status, PartStatus::Quarantined);
    assert_eq!(held.step, machine_id);

    // The remaining part goes to rework and back through the step alone
    engine.rework(&mut store, &parts[0]).unwrap();
    let restarted = engine.start(&mut store, &parts[0]).unwrap();
    assert_eq!(restarted.status, PartStatus::ReworkInProgress);
    let done = engine.advance(&mut store, &TransitionRequest::new(&parts[0])).unwrap();
    assert_eq!(done.outcome, TransitionOutcome::Completed);
}

#[test]
fn qa_signoff_gate_holds_until_signed() {
    let mut machine = step("Machine", StepKind::Task);
    machine.requires_qa_signoff = true;
    let (process, steps) = linear(machine);
    let machine_id = steps[1].id.clone();
    let catalog = Catalog::new(vec![process.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 2, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);

    let results = advance_all(&engine, &mut store, &parts);
    assert_eq!(
        results[1].outcome,
        TransitionOutcome::Waiting(WaitReason::Blocked(GateBlock::QaSignoff))
    );

    let signoff = QaSignoff::new(&wo.id, &machine_id, "qa-lead");
    let result = engine.record_signoff(&mut store, &signoff).unwrap();
    assert_eq!(result.outcome, TransitionOutcome::Advanced);
    assert_eq!(result.moved.len(), 2);
    assert!(parts
        .iter()
        .all(|id| get(&mut store, id).status == PartStatus::Completed));
}

#[test]
fn scrapping_the_last_unsettled_part_releases_cohort() {
    let (process, steps) = linear(step("Machine", StepKind::Task));
    let catalog = Catalog::new(vec![process.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (_, parts) = engine
        .create_work_order(&mut store, &process.id, 2, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    start_all(&engine, &mut store, &parts);
    engine.advance(&mut store, &TransitionRequest::new(&parts[0])).unwrap();

    let scrapped = engine.scrap(&mut store, &parts[1]).unwrap();
    assert_eq!(scrapped.moved.len(), 1);
    assert_eq!(scrapped.moved[0].part, parts[0]);
    assert_eq!(get(&mut store, &parts[1]).status, PartStatus::Scrapped);

    let err = engine.start(&mut store, &parts[1]).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

// ===== Sampling and fallback loop =====

#[test]
fn sampling_decision_is_stable_per_part() {
    let mut machine = step("Machine", StepKind::Task);
    machine.sampling_required = true;
    let (process, steps) = linear(machine);
    let rules = SamplingRuleSet::new("Half", PART_TYPE, &process.id, &steps[1].id, "qa")
        .with_rule(RuleType::Percentage, 50.0, 0);
    let catalog = Catalog::new(vec![process.clone()], steps, vec![rules]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (_, parts) = engine
        .create_work_order(&mut store, &process.id, 6, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);

    for id in &parts {
        let first = engine.resolve_sampling(&mut store, id).unwrap();
        let second = engine.resolve_sampling(&mut store, id).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            get(&mut store, id).requires_sampling(),
            first.requires_sampling
        );
    }
}

#[test]
fn consecutive_failures_switch_to_fallback_and_passes_revert() {
    let mut machine = step("Machine", StepKind::Task);
    machine.sampling_required = true;
    let (process, steps) = linear(machine);
    let machine_id = steps[1].id.clone();

    let mut fallback = SamplingRuleSet::new("Tightened", PART_TYPE, &process.id, &machine_id, "qa")
        .with_rule(RuleType::Percentage, 100.0, 0);
    fallback.is_fallback = true;
    let mut primary = SamplingRuleSet::new("Normal", PART_TYPE, &process.id, &machine_id, "qa")
        .with_rule(RuleType::EveryNthPart, 100.0, 0);
    primary.fallback = Some(fallback.id.clone());
    primary.fallback_threshold = Some(3);
    primary.fallback_duration = Some(2);
    let (primary_id, fallback_id) = (primary.id.clone(), fallback.id.clone());

    let catalog = Catalog::new(vec![process.clone()], steps, vec![primary, fallback]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let (wo, parts) = engine
        .create_work_order(&mut store, &process.id, 8, None, "planner")
        .unwrap();
    let parts = ids(&parts);
    leave_entry(&engine, &mut store, &parts);
    assert!(parts.iter().all(|id| !get(&mut store, id).requires_sampling()));

    let report = |store: &mut Store, part: &EntityId, verdict: Verdict| {
        let qr = QualityReport::new(part, &wo.id, &machine_id, verdict);
        engine.record_quality_report(store, &qr).unwrap().trigger
    };

    // Repeat reports for one part count once
    assert_eq!(report(&mut store, &parts[0], Verdict::Fail), None);
    assert_eq!(report(&mut store, &parts[0], Verdict::Fail), None);
    assert_eq!(report(&mut store, &parts[1], Verdict::Fail), None);
    assert_eq!(
        report(&mut store, &parts[2], Verdict::Fail),
        Some(TriggerChange::Activated {
            primary: primary_id.clone(),
            fallback: fallback_id.clone(),
        })
    );

    let tightened = engine.resolve_sampling(&mut store, &parts[5]).unwrap();
    assert!(tightened.requires_sampling);
    assert!(tightened.fallback_active);
    assert_eq!(tightened.ruleset, Some(fallback_id.clone()));
    assert_eq!(tightened.primary_ruleset, Some(primary_id.clone()));
    assert!(get(&mut store, &parts[5]).requires_sampling());

    // Failures while on the fallback never flip again
    assert_eq!(report(&mut store, &parts[3], Verdict::Fail), None);
    assert_eq!(report(&mut store, &parts[4], Verdict::Pass), None);
    assert_eq!(
        report(&mut store, &parts[5], Verdict::Pass),
        Some(TriggerChange::Reverted {
            primary: primary_id.clone(),
            fallback: fallback_id,
        })
    );

    let normal = engine.resolve_sampling(&mut store, &parts[6]).unwrap();
    assert!(!normal.requires_sampling);
    assert!(!normal.fallback_active);

    let states = store
        .transaction(|tx| tx.trigger_states_for_work_order(&wo.id))
        .unwrap();
    assert_eq!(states.iter().filter(|s| s.active).count(), 1);
    assert_eq!(states.len(), 3);
}

// ===== Requests and configuration =====

#[test]
fn work_order_requests_are_validated() {
    let (process, steps) = linear(step("Machine", StepKind::Task));
    let mut draft = process.new_revision("test");
    draft.status = Status::Draft;
    let catalog = Catalog::new(vec![process.clone(), draft.clone()], steps, vec![]).unwrap();
    let engine = BatchAdvancer::new(&catalog);
    let mut store = store();

    let err = engine
        .create_work_order(&mut store, &process.id, 0, None, "planner")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    engine
        .create_work_order(&mut store, &process.id, 1, Some("WO-7"), "planner")
        .unwrap();
    let err = engine
        .create_work_order(&mut store, &process.id, 1, Some("WO-7"), "planner")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let err = engine
        .create_work_order(&mut store, &draft.id, 1, None, "planner")
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigurationError::UnpublishedProcess(_))
    ));

    let found = store
        .transaction(|tx| tx.find_work_order_by_number("WO-7"))
        .unwrap();
    assert!(found.is_some());
    let count = store
        .transaction(|tx| Ok::<_, StoreError>(tx.list_work_orders()?.len()))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn malformed_graphs_are_reported_together() {
    let start = step("Receive", StepKind::Start);
    let gate = step(
        "Gate",
        StepKind::Decision {
            decision_type: DecisionType::Manual,
        },
    );
    let orphan = step("Orphan", StepKind::Task);
    let end = ship();
    let process = released(
        &[&start, &gate, &orphan, &end],
        &[
            (0, 1, EdgeType::Default),
            (1, 3, EdgeType::Default),
            (2, 3, EdgeType::Default),
        ],
    );

    let err = Catalog::new(vec![process], vec![start, gate, orphan, end], vec![]).unwrap_err();
    let problems = err.into_list();
    assert_eq!(problems.len(), 2);
    assert!(problems
        .iter()
        .any(|e| matches!(e, ConfigurationError::MissingAlternateEdge { .. })));
    assert!(problems
        .iter()
        .any(|e| matches!(e, ConfigurationError::UnreachableStep { .. })));
}
