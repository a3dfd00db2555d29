//! Database schema initialization

use rusqlite::{params, OptionalExtension};

use super::{Store, StoreResult, SCHEMA_VERSION};

impl Store {
    /// Read the schema version (None when the database is empty)
    pub(super) fn schema_version(&self) -> StoreResult<Option<i64>> {
        let has_table: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
                [],
                |_row| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        if !has_table {
            return Ok(None);
        }

        let version: Option<i64> =
            self.conn
                .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                    row.get(0)
                })?;
        Ok(version)
    }

    /// Initialize database schema
    pub(super) fn init_schema(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            -- Work orders (cohorts)
            CREATE TABLE IF NOT EXISTS work_orders (
                id TEXT PRIMARY KEY,
                number TEXT NOT NULL UNIQUE,
                part_type TEXT NOT NULL,
                process TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                notes TEXT,
                created TEXT NOT NULL,
                author TEXT NOT NULL
            );

            -- Parts traveling through a process graph
            CREATE TABLE IF NOT EXISTS parts (
                id TEXT PRIMARY KEY,
                work_order TEXT NOT NULL REFERENCES work_orders(id),
                part_type TEXT NOT NULL,
                process TEXT NOT NULL,
                step TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                status TEXT NOT NULL,
                visits TEXT NOT NULL DEFAULT '{}',
                decision TEXT,
                terminal_status TEXT,
                sampling TEXT,
                step_entered TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                created TEXT NOT NULL,
                updated TEXT NOT NULL,
                UNIQUE (work_order, ordinal)
            );
            CREATE INDEX IF NOT EXISTS idx_parts_cohort ON parts(work_order, step);
            CREATE INDEX IF NOT EXISTS idx_parts_status ON parts(status);

            -- Inspection outcomes
            CREATE TABLE IF NOT EXISTS quality_reports (
                id TEXT PRIMARY KEY,
                part TEXT NOT NULL REFERENCES parts(id),
                work_order TEXT NOT NULL REFERENCES work_orders(id),
                step TEXT NOT NULL,
                verdict TEXT NOT NULL,
                measurements TEXT NOT NULL DEFAULT '[]',
                inspector TEXT,
                notes TEXT,
                created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reports_part_step ON quality_reports(part, step, created);

            -- QA sign-offs per (work order, step)
            CREATE TABLE IF NOT EXISTS qa_signoffs (
                id TEXT PRIMARY KEY,
                work_order TEXT NOT NULL REFERENCES work_orders(id),
                step TEXT NOT NULL,
                approver TEXT NOT NULL,
                comment TEXT,
                created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signoffs_wo_step ON qa_signoffs(work_order, step);

            -- Fallback feedback loop state
            CREATE TABLE IF NOT EXISTS trigger_states (
                id TEXT PRIMARY KEY,
                ruleset TEXT NOT NULL,
                primary_ruleset TEXT NOT NULL,
                work_order TEXT NOT NULL REFERENCES work_orders(id),
                step TEXT NOT NULL,
                active INTEGER NOT NULL,
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                inspected_parts TEXT NOT NULL DEFAULT '[]',
                triggered_at TEXT NOT NULL,
                triggered_by TEXT,
                deactivated_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_trigger_active
                ON trigger_states(ruleset, work_order, step) WHERE active = 1;
            CREATE INDEX IF NOT EXISTS idx_trigger_family
                ON trigger_states(primary_ruleset, work_order, step);

            -- Audit log
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                work_order TEXT,
                part TEXT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_wo ON events(work_order, seq);
            "#,
        )?;

        self.conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;

        Ok(())
    }
}
