//! Reads and writes on an open store transaction

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{format_ts, parse_enum, parse_id, parse_ts, StoreError, StoreResult, StoreTx};
use crate::core::identity::EntityId;
use crate::entities::part::{Part, PartStatus};
use crate::entities::quality::{DecisionResult, Measurement, QaSignoff, QualityReport, Verdict};
use crate::entities::sampling::SamplingDecision;
use crate::entities::step::TerminalStatus;
use crate::entities::trigger::SamplingTriggerState;
use crate::entities::work_order::WorkOrder;

/// One row of the audit log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub seq: i64,
    pub work_order: Option<EntityId>,
    pub part: Option<EntityId>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created: DateTime<Utc>,
}

const WORK_ORDER_COLUMNS: &str =
    "id, number, part_type, process, quantity, notes, created, author";

const PART_COLUMNS: &str = "id, work_order, part_type, process, step, ordinal, status, visits, \
     decision, terminal_status, sampling, step_entered, revision, created, updated";

const REPORT_COLUMNS: &str =
    "id, part, work_order, step, verdict, measurements, inspector, notes, created";

const SIGNOFF_COLUMNS: &str = "id, work_order, step, approver, comment, created";

const TRIGGER_COLUMNS: &str = "id, ruleset, primary_ruleset, work_order, step, active, \
     success_count, fail_count, inspected_parts, triggered_at, triggered_by, deactivated_at";

impl StoreTx<'_> {
    // ===== Work orders =====

    pub fn insert_work_order(&self, wo: &WorkOrder) -> StoreResult<()> {
        self.tx.execute(
            &format!(
                "INSERT INTO work_orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                WORK_ORDER_COLUMNS
            ),
            params![
                wo.id.to_string(),
                wo.number,
                wo.part_type,
                wo.process.to_string(),
                wo.quantity,
                wo.notes,
                format_ts(&wo.created),
                wo.author,
            ],
        )?;
        Ok(())
    }

    pub fn get_work_order(&self, id: &EntityId) -> StoreResult<WorkOrder> {
        let raw = self
            .tx
            .query_row(
                &format!("SELECT {} FROM work_orders WHERE id = ?1", WORK_ORDER_COLUMNS),
                params![id.to_string()],
                WorkOrderRow::from_row,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.into_work_order(),
            None => Err(StoreError::NotFound {
                entity: "work order",
                id: id.to_string(),
            }),
        }
    }

    /// Look up a work order by its user-facing number
    pub fn find_work_order_by_number(&self, number: &str) -> StoreResult<Option<WorkOrder>> {
        let raw = self
            .tx
            .query_row(
                &format!(
                    "SELECT {} FROM work_orders WHERE number = ?1",
                    WORK_ORDER_COLUMNS
                ),
                params![number],
                WorkOrderRow::from_row,
            )
            .optional()?;
        raw.map(WorkOrderRow::into_work_order).transpose()
    }

    pub fn list_work_orders(&self) -> StoreResult<Vec<WorkOrder>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM work_orders ORDER BY created, id",
            WORK_ORDER_COLUMNS
        ))?;
        let raw = stmt
            .query_map([], WorkOrderRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(WorkOrderRow::into_work_order).collect()
    }

    pub fn count_work_orders(&self) -> StoreResult<i64> {
        Ok(self
            .tx
            .query_row("SELECT COUNT(*) FROM work_orders", [], |row| row.get(0))?)
    }

    // ===== Parts =====

    pub fn insert_part(&self, part: &Part) -> StoreResult<()> {
        self.tx.execute(
            &format!(
                "INSERT INTO parts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                PART_COLUMNS
            ),
            params![
                part.id.to_string(),
                part.work_order.to_string(),
                part.part_type,
                part.process.to_string(),
                part.step.to_string(),
                part.ordinal,
                part.status.as_str(),
                serde_json::to_string(&part.visits)?,
                part.decision.map(|d| d.to_string()),
                part.terminal_status.map(|t| t.to_string()),
                part.sampling.as_ref().map(serde_json::to_string).transpose()?,
                format_ts(&part.step_entered),
                part.revision,
                format_ts(&part.created),
                format_ts(&part.updated),
            ],
        )?;
        Ok(())
    }

    pub fn get_part(&self, id: &EntityId) -> StoreResult<Part> {
        let raw = self
            .tx
            .query_row(
                &format!("SELECT {} FROM parts WHERE id = ?1", PART_COLUMNS),
                params![id.to_string()],
                PartRow::from_row,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.into_part(),
            None => Err(StoreError::NotFound {
                entity: "part",
                id: id.to_string(),
            }),
        }
    }

    /// All parts of a work order in creation order
    pub fn parts_of_work_order(&self, work_order: &EntityId) -> StoreResult<Vec<Part>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM parts WHERE work_order = ?1 ORDER BY ordinal",
            PART_COLUMNS
        ))?;
        let raw = stmt
            .query_map(params![work_order.to_string()], PartRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(PartRow::into_part).collect()
    }

    /// Parts of a work order currently at a step, in creation order
    pub fn parts_at_step(&self, work_order: &EntityId, step: &EntityId) -> StoreResult<Vec<Part>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM parts WHERE work_order = ?1 AND step = ?2 ORDER BY ordinal",
            PART_COLUMNS
        ))?;
        let raw = stmt
            .query_map(
                params![work_order.to_string(), step.to_string()],
                PartRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(PartRow::into_part).collect()
    }

    /// Write back a part, failing with a conflict when its revision moved
    ///
    /// On success the in-memory revision is bumped to match the row.
    pub fn update_part(&self, part: &mut Part) -> StoreResult<()> {
        let changed = self.tx.execute(
            "UPDATE parts SET step = ?2, status = ?3, visits = ?4, decision = ?5, \
             terminal_status = ?6, sampling = ?7, step_entered = ?8, updated = ?9, \
             revision = revision + 1 \
             WHERE id = ?1 AND revision = ?10",
            params![
                part.id.to_string(),
                part.step.to_string(),
                part.status.as_str(),
                serde_json::to_string(&part.visits)?,
                part.decision.map(|d| d.to_string()),
                part.terminal_status.map(|t| t.to_string()),
                part.sampling.as_ref().map(serde_json::to_string).transpose()?,
                format_ts(&part.step_entered),
                format_ts(&part.updated),
                part.revision,
            ],
        )?;

        if changed == 0 {
            let exists: bool = self
                .tx
                .query_row(
                    "SELECT 1 FROM parts WHERE id = ?1",
                    params![part.id.to_string()],
                    |_row| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            return Err(if exists {
                StoreError::Conflict {
                    entity: "part",
                    id: part.id.to_string(),
                    expected: part.revision,
                }
            } else {
                StoreError::NotFound {
                    entity: "part",
                    id: part.id.to_string(),
                }
            });
        }

        part.revision += 1;
        Ok(())
    }

    // ===== Quality reports =====

    pub fn insert_quality_report(&self, report: &QualityReport) -> StoreResult<()> {
        self.tx.execute(
            &format!(
                "INSERT INTO quality_reports ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                REPORT_COLUMNS
            ),
            params![
                report.id.to_string(),
                report.part.to_string(),
                report.work_order.to_string(),
                report.step.to_string(),
                report.verdict.to_string(),
                serde_json::to_string(&report.measurements)?,
                report.inspector,
                report.notes,
                format_ts(&report.created),
            ],
        )?;
        Ok(())
    }

    /// Most recent report for (part, step) created at or after `since`
    pub fn latest_report(
        &self,
        part: &EntityId,
        step: &EntityId,
        since: &DateTime<Utc>,
    ) -> StoreResult<Option<QualityReport>> {
        let raw = self
            .tx
            .query_row(
                &format!(
                    "SELECT {} FROM quality_reports \
                     WHERE part = ?1 AND step = ?2 AND created >= ?3 \
                     ORDER BY created DESC, id DESC LIMIT 1",
                    REPORT_COLUMNS
                ),
                params![part.to_string(), step.to_string(), format_ts(since)],
                ReportRow::from_row,
            )
            .optional()?;
        raw.map(ReportRow::into_report).transpose()
    }

    pub fn reports_for_part(&self, part: &EntityId) -> StoreResult<Vec<QualityReport>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM quality_reports WHERE part = ?1 ORDER BY created, id",
            REPORT_COLUMNS
        ))?;
        let raw = stmt
            .query_map(params![part.to_string()], ReportRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(ReportRow::into_report).collect()
    }

    // ===== QA sign-offs =====

    pub fn insert_signoff(&self, signoff: &QaSignoff) -> StoreResult<()> {
        self.tx.execute(
            &format!(
                "INSERT INTO qa_signoffs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                SIGNOFF_COLUMNS
            ),
            params![
                signoff.id.to_string(),
                signoff.work_order.to_string(),
                signoff.step.to_string(),
                signoff.approver,
                signoff.comment,
                format_ts(&signoff.created),
            ],
        )?;
        Ok(())
    }

    pub fn has_signoff(&self, work_order: &EntityId, step: &EntityId) -> StoreResult<bool> {
        Ok(self
            .tx
            .query_row(
                "SELECT 1 FROM qa_signoffs WHERE work_order = ?1 AND step = ?2 LIMIT 1",
                params![work_order.to_string(), step.to_string()],
                |_row| Ok(true),
            )
            .optional()?
            .unwrap_or(false))
    }

    pub fn signoffs_for_work_order(&self, work_order: &EntityId) -> StoreResult<Vec<QaSignoff>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM qa_signoffs WHERE work_order = ?1 ORDER BY created, id",
            SIGNOFF_COLUMNS
        ))?;
        let raw = stmt
            .query_map(params![work_order.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(id, wo, step, approver, comment, created)| {
                Ok(QaSignoff {
                    id: parse_id("id", &id)?,
                    work_order: parse_id("work_order", &wo)?,
                    step: parse_id("step", &step)?,
                    approver,
                    comment,
                    created: parse_ts("created", &created)?,
                })
            })
            .collect()
    }

    // ===== Sampling trigger states =====

    pub fn insert_trigger_state(&self, state: &SamplingTriggerState) -> StoreResult<()> {
        self.tx.execute(
            &format!(
                "INSERT INTO trigger_states ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                TRIGGER_COLUMNS
            ),
            params![
                state.id.to_string(),
                state.ruleset.to_string(),
                state.primary.to_string(),
                state.work_order.to_string(),
                state.step.to_string(),
                state.active,
                state.success_count,
                state.fail_count,
                serde_json::to_string(&state.inspected_parts)?,
                format_ts(&state.triggered_at),
                state.triggered_by.as_ref().map(|id| id.to_string()),
                state.deactivated_at.as_ref().map(format_ts),
            ],
        )?;
        Ok(())
    }

    pub fn update_trigger_state(&self, state: &SamplingTriggerState) -> StoreResult<()> {
        let changed = self.tx.execute(
            "UPDATE trigger_states SET active = ?2, success_count = ?3, fail_count = ?4, \
             inspected_parts = ?5, triggered_by = ?6, deactivated_at = ?7 WHERE id = ?1",
            params![
                state.id.to_string(),
                state.active,
                state.success_count,
                state.fail_count,
                serde_json::to_string(&state.inspected_parts)?,
                state.triggered_by.as_ref().map(|id| id.to_string()),
                state.deactivated_at.as_ref().map(format_ts),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "trigger state",
                id: state.id.to_string(),
            });
        }
        Ok(())
    }

    /// Active states of one rule set family, most recently triggered first
    pub fn active_trigger_states(
        &self,
        primary: &EntityId,
        work_order: &EntityId,
        step: &EntityId,
    ) -> StoreResult<Vec<SamplingTriggerState>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM trigger_states \
             WHERE primary_ruleset = ?1 AND work_order = ?2 AND step = ?3 AND active = 1 \
             ORDER BY triggered_at DESC, id DESC",
            TRIGGER_COLUMNS
        ))?;
        let raw = stmt
            .query_map(
                params![primary.to_string(), work_order.to_string(), step.to_string()],
                TriggerRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(TriggerRow::into_state).collect()
    }

    /// Active states of a work order at a step, across rule set families
    pub fn active_trigger_states_at(
        &self,
        work_order: &EntityId,
        step: &EntityId,
    ) -> StoreResult<Vec<SamplingTriggerState>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM trigger_states \
             WHERE work_order = ?1 AND step = ?2 AND active = 1 \
             ORDER BY triggered_at DESC, id DESC",
            TRIGGER_COLUMNS
        ))?;
        let raw = stmt
            .query_map(
                params![work_order.to_string(), step.to_string()],
                TriggerRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(TriggerRow::into_state).collect()
    }

    /// Full trigger history of a work order
    pub fn trigger_states_for_work_order(
        &self,
        work_order: &EntityId,
    ) -> StoreResult<Vec<SamplingTriggerState>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {} FROM trigger_states WHERE work_order = ?1 ORDER BY triggered_at, id",
            TRIGGER_COLUMNS
        ))?;
        let raw = stmt
            .query_map(params![work_order.to_string()], TriggerRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(TriggerRow::into_state).collect()
    }

    // ===== Audit events =====

    pub fn append_event(
        &self,
        work_order: Option<&EntityId>,
        part: Option<&EntityId>,
        kind: &str,
        payload: &serde_json::Value,
        at: &DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.tx.execute(
            "INSERT INTO events (work_order, part, kind, payload, created) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                work_order.map(|id| id.to_string()),
                part.map(|id| id.to_string()),
                kind,
                serde_json::to_string(payload)?,
                format_ts(at),
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn events_for_work_order(&self, work_order: &EntityId) -> StoreResult<Vec<StoredEvent>> {
        let mut stmt = self.tx.prepare(
            "SELECT seq, work_order, part, kind, payload, created FROM events \
             WHERE work_order = ?1 ORDER BY seq",
        )?;
        let raw = stmt
            .query_map(params![work_order.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(seq, wo, part, kind, payload, created)| {
                Ok(StoredEvent {
                    seq,
                    work_order: wo.map(|s| parse_id("work_order", &s)).transpose()?,
                    part: part.map(|s| parse_id("part", &s)).transpose()?,
                    kind,
                    payload: serde_json::from_str(&payload)?,
                    created: parse_ts("created", &created)?,
                })
            })
            .collect()
    }
}

// ===== Raw rows =====

struct WorkOrderRow {
    id: String,
    number: String,
    part_type: String,
    process: String,
    quantity: u32,
    notes: Option<String>,
    created: String,
    author: String,
}

impl WorkOrderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            number: row.get(1)?,
            part_type: row.get(2)?,
            process: row.get(3)?,
            quantity: row.get(4)?,
            notes: row.get(5)?,
            created: row.get(6)?,
            author: row.get(7)?,
        })
    }

    fn into_work_order(self) -> StoreResult<WorkOrder> {
        Ok(WorkOrder {
            id: parse_id("id", &self.id)?,
            number: self.number,
            part_type: self.part_type,
            process: parse_id("process", &self.process)?,
            quantity: self.quantity,
            notes: self.notes,
            created: parse_ts("created", &self.created)?,
            author: self.author,
        })
    }
}

struct PartRow {
    id: String,
    work_order: String,
    part_type: String,
    process: String,
    step: String,
    ordinal: u32,
    status: String,
    visits: String,
    decision: Option<String>,
    terminal_status: Option<String>,
    sampling: Option<String>,
    step_entered: String,
    revision: u32,
    created: String,
    updated: String,
}

impl PartRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            work_order: row.get(1)?,
            part_type: row.get(2)?,
            process: row.get(3)?,
            step: row.get(4)?,
            ordinal: row.get(5)?,
            status: row.get(6)?,
            visits: row.get(7)?,
            decision: row.get(8)?,
            terminal_status: row.get(9)?,
            sampling: row.get(10)?,
            step_entered: row.get(11)?,
            revision: row.get(12)?,
            created: row.get(13)?,
            updated: row.get(14)?,
        })
    }

    fn into_part(self) -> StoreResult<Part> {
        let visits: BTreeMap<EntityId, u32> = serde_json::from_str(&self.visits)?;
        let sampling: Option<SamplingDecision> = self
            .sampling
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Part {
            id: parse_id("id", &self.id)?,
            work_order: parse_id("work_order", &self.work_order)?,
            part_type: self.part_type,
            process: parse_id("process", &self.process)?,
            step: parse_id("step", &self.step)?,
            ordinal: self.ordinal,
            status: parse_enum::<PartStatus>("status", &self.status)?,
            visits,
            decision: self
                .decision
                .as_deref()
                .map(|s| parse_enum::<DecisionResult>("decision", s))
                .transpose()?,
            terminal_status: self
                .terminal_status
                .as_deref()
                .map(|s| parse_enum::<TerminalStatus>("terminal_status", s))
                .transpose()?,
            sampling,
            step_entered: parse_ts("step_entered", &self.step_entered)?,
            revision: self.revision,
            created: parse_ts("created", &self.created)?,
            updated: parse_ts("updated", &self.updated)?,
        })
    }
}

struct ReportRow {
    id: String,
    part: String,
    work_order: String,
    step: String,
    verdict: String,
    measurements: String,
    inspector: Option<String>,
    notes: Option<String>,
    created: String,
}

impl ReportRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            part: row.get(1)?,
            work_order: row.get(2)?,
            step: row.get(3)?,
            verdict: row.get(4)?,
            measurements: row.get(5)?,
            inspector: row.get(6)?,
            notes: row.get(7)?,
            created: row.get(8)?,
        })
    }

    fn into_report(self) -> StoreResult<QualityReport> {
        let measurements: Vec<Measurement> = serde_json::from_str(&self.measurements)?;
        Ok(QualityReport {
            id: parse_id("id", &self.id)?,
            part: parse_id("part", &self.part)?,
            work_order: parse_id("work_order", &self.work_order)?,
            step: parse_id("step", &self.step)?,
            verdict: parse_enum::<Verdict>("verdict", &self.verdict)?,
            measurements,
            inspector: self.inspector,
            notes: self.notes,
            created: parse_ts("created", &self.created)?,
        })
    }
}

struct TriggerRow {
    id: String,
    ruleset: String,
    primary: String,
    work_order: String,
    step: String,
    active: bool,
    success_count: u32,
    fail_count: u32,
    inspected_parts: String,
    triggered_at: String,
    triggered_by: Option<String>,
    deactivated_at: Option<String>,
}

impl TriggerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ruleset: row.get(1)?,
            primary: row.get(2)?,
            work_order: row.get(3)?,
            step: row.get(4)?,
            active: row.get(5)?,
            success_count: row.get(6)?,
            fail_count: row.get(7)?,
            inspected_parts: row.get(8)?,
            triggered_at: row.get(9)?,
            triggered_by: row.get(10)?,
            deactivated_at: row.get(11)?,
        })
    }

    fn into_state(self) -> StoreResult<SamplingTriggerState> {
        let inspected_parts: BTreeSet<EntityId> = serde_json::from_str(&self.inspected_parts)?;
        Ok(SamplingTriggerState {
            id: parse_id("id", &self.id)?,
            ruleset: parse_id("ruleset", &self.ruleset)?,
            primary: parse_id("primary_ruleset", &self.primary)?,
            work_order: parse_id("work_order", &self.work_order)?,
            step: parse_id("step", &self.step)?,
            active: self.active,
            success_count: self.success_count,
            fail_count: self.fail_count,
            inspected_parts,
            triggered_at: parse_ts("triggered_at", &self.triggered_at)?,
            triggered_by: self
                .triggered_by
                .as_deref()
                .map(|s| parse_id("triggered_by", s))
                .transpose()?,
            deactivated_at: self
                .deactivated_at
                .as_deref()
                .map(|s| parse_ts("deactivated_at", s))
                .transpose()?,
        })
    }
}
