use std::path::Path;

use pricelens_core::{
    decode_json, encode_json, Decision, DecisionId, DecisionStatus,
    EngineError, EpisodeStatus, Kpi, MetricKind, Outcome, OutcomeId, OutcomeStatus, Scenario,
    ScenarioDelta, ScenarioSet, ScenarioSetId, StatusChange, StatusEvent, StatusEventId,
    VersionEntry, VersionedField,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS decisions (
  decision_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  company_name TEXT NOT NULL,
  website_url TEXT NOT NULL,
  context_json TEXT,
  context_version INTEGER NOT NULL DEFAULT 0 CHECK (context_version >= 0),
  verdict_json TEXT,
  verdict_version INTEGER NOT NULL DEFAULT 0 CHECK (verdict_version >= 0),
  verdict_model_meta_json TEXT,
  status TEXT NOT NULL CHECK (status IN ('proposed','in_review','approved','rejected','implemented','rolled_back')),
  rejection_reason TEXT,
  implemented_at TEXT,
  rollback_at TEXT,
  rollback_reason TEXT,
  episode_status TEXT NOT NULL CHECK (episode_status IN ('exploring','path_chosen')),
  scenario_set_id TEXT,
  chosen_scenario_id TEXT,
  chosen_scenario_at TEXT,
  is_deleted INTEGER NOT NULL DEFAULT 0,
  deleted_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decision_versions (
  decision_id TEXT NOT NULL,
  field TEXT NOT NULL CHECK (field IN ('context','verdict')),
  version INTEGER NOT NULL CHECK (version >= 1),
  value_json TEXT NOT NULL,
  model_meta_json TEXT,
  created_at TEXT NOT NULL,
  created_by TEXT NOT NULL,
  PRIMARY KEY (decision_id, field, version),
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE TABLE IF NOT EXISTS status_events (
  event_id TEXT PRIMARY KEY,
  decision_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('proposed','in_review','approved','rejected','implemented','rolled_back')),
  reason TEXT,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE TABLE IF NOT EXISTS outcomes (
  outcome_id TEXT PRIMARY KEY,
  decision_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  chosen_scenario_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('pending','in_progress','achieved','missed')),
  metric TEXT NOT NULL CHECK (metric IN ('revenue','churn','activation','retention','pricing','other')),
  timeframe_days INTEGER NOT NULL CHECK (timeframe_days > 0),
  is_correction INTEGER NOT NULL DEFAULT 0,
  corrects_outcome_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE TABLE IF NOT EXISTS outcome_kpis (
  outcome_id TEXT NOT NULL,
  kpi_key TEXT NOT NULL,
  baseline REAL NOT NULL,
  target REAL NOT NULL,
  actual REAL,
  delta_pct REAL,
  PRIMARY KEY (outcome_id, kpi_key),
  FOREIGN KEY (outcome_id) REFERENCES outcomes(outcome_id)
);

CREATE TABLE IF NOT EXISTS scenario_sets (
  scenario_set_id TEXT PRIMARY KEY,
  decision_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  scenarios_json TEXT NOT NULL,
  model_meta_json TEXT,
  is_deleted INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  UNIQUE (decision_id, user_id, version),
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE TABLE IF NOT EXISTS scenario_deltas (
  decision_id TEXT NOT NULL,
  verdict_version INTEGER NOT NULL,
  baseline_scenario_id TEXT NOT NULL,
  candidate_scenario_id TEXT NOT NULL,
  deltas_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (decision_id, verdict_version, baseline_scenario_id, candidate_scenario_id),
  FOREIGN KEY (decision_id) REFERENCES decisions(decision_id)
);

CREATE INDEX IF NOT EXISTS idx_decisions_user ON decisions(user_id, is_deleted);
CREATE INDEX IF NOT EXISTS idx_status_events_decision ON status_events(decision_id, created_at);
CREATE INDEX IF NOT EXISTS idx_outcomes_decision ON outcomes(decision_id, user_id);
CREATE INDEX IF NOT EXISTS idx_scenario_sets_lookup ON scenario_sets(decision_id, user_id, version DESC);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

trait SqlCtx<T> {
    fn ctx(self, what: &str) -> Result<T, EngineError>;
}

impl<T> SqlCtx<T> for Result<T, rusqlite::Error> {
    fn ctx(self, what: &str) -> Result<T, EngineError> {
        self.map_err(|err| match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EngineError::Conflict(format!("{what}: {err}"))
            }
            _ => EngineError::Storage(format!("{what}: {err}")),
        })
    }
}

fn rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .format(&Rfc3339)
        .map_err(|err| EngineError::Storage(format!("failed to format timestamp: {err}")))
}

fn opt_rfc3339(value: Option<OffsetDateTime>) -> Result<Option<String>, EngineError> {
    value.map(rfc3339).transpose()
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, EngineError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| EngineError::Storage(format!("failed to parse stored timestamp: {err}")))
}

fn opt_parse_rfc3339(raw: Option<String>) -> Result<Option<OffsetDateTime>, EngineError> {
    raw.as_deref().map(parse_rfc3339).transpose()
}

fn parse_ulid(raw: &str, what: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(raw)
        .map_err(|err| EngineError::Storage(format!("stored {what} id is not a ULID: {err}")))
}

fn decision_not_found(decision_id: DecisionId) -> EngineError {
    // Missing, soft-deleted, and wrong-owner rows all read the same.
    EngineError::NotFound(format!("decision not found: {decision_id}"))
}

fn outcome_not_found(outcome_id: OutcomeId) -> EngineError {
    EngineError::NotFound(format!("outcome not found: {outcome_id}"))
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`EngineError::Storage`] when the database cannot be opened or
    /// pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(|err| {
            EngineError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;
        Self::configure(conn)
    }

    /// Open an in-memory store, used by tests.
    ///
    /// # Errors
    /// Returns [`EngineError::Storage`] when the connection cannot be created.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().ctx("open in-memory sqlite database")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self, EngineError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .ctx("configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns [`EngineError::Storage`] when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, EngineError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).ctx("apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns [`EngineError::Storage`] when a migration step fails.
    pub fn migrate(&mut self) -> Result<(), EngineError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).ctx("apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self.conn.transaction().ctx("start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).ctx("apply migration v1")?;
            let now = rfc3339(OffsetDateTime::now_utc())?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now],
            )
            .ctx("record migration version 1")?;
            tx.commit().ctx("commit migration v1")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(EngineError::Storage(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }
        Ok(())
    }

    /// Persist one freshly created decision aggregate.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the aggregate is invalid, or
    /// a storage/conflict error when the insert fails.
    pub fn insert_decision(&mut self, decision: &Decision) -> Result<(), EngineError> {
        decision.validate()?;

        let tx = self.conn.transaction().ctx("start insert-decision transaction")?;
        tx.execute(
            "INSERT INTO decisions(
                decision_id, user_id, company_name, website_url,
                context_json, context_version, verdict_json, verdict_version,
                verdict_model_meta_json, status, rejection_reason, implemented_at,
                rollback_at, rollback_reason, episode_status, scenario_set_id,
                chosen_scenario_id, chosen_scenario_at, is_deleted, deleted_at,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )",
            params![
                decision.decision_id.to_string(),
                decision.user_id,
                decision.company_name,
                decision.website_url,
                decision
                    .context
                    .current
                    .as_ref()
                    .map(|value| encode_json(value, "context"))
                    .transpose()?,
                i64::from(decision.context.version),
                decision
                    .verdict
                    .current
                    .as_ref()
                    .map(|value| encode_json(value, "verdict"))
                    .transpose()?,
                i64::from(decision.verdict.version),
                decision
                    .verdict_model_meta
                    .as_ref()
                    .map(|value| encode_json(value, "model meta"))
                    .transpose()?,
                decision.status.as_str(),
                decision.rejection_reason,
                opt_rfc3339(decision.implemented_at)?,
                opt_rfc3339(decision.rollback_at)?,
                decision.rollback_reason,
                decision.episode_status.as_str(),
                decision.scenario_set_id.map(|id| id.to_string()),
                decision.chosen_scenario_id,
                opt_rfc3339(decision.chosen_scenario_at)?,
                i64::from(decision.is_deleted),
                opt_rfc3339(decision.deleted_at)?,
                rfc3339(decision.created_at)?,
                rfc3339(decision.updated_at)?,
            ],
        )
        .ctx("insert decision")?;

        insert_version_rows(&tx, decision.decision_id, "context", &decision.context.history, None)?;
        insert_version_rows(
            &tx,
            decision.decision_id,
            "verdict",
            &decision.verdict.history,
            decision.verdict_model_meta.as_ref(),
        )?;
        for event in &decision.status_events {
            insert_status_event(&tx, decision.decision_id, event)?;
        }

        tx.commit().ctx("commit insert-decision transaction")?;
        Ok(())
    }

    /// Load one owner-scoped decision with full version and status history.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the decision is absent,
    /// soft-deleted (unless `include_deleted`), or owned by another user.
    pub fn get_decision(
        &self,
        decision_id: DecisionId,
        user_id: &str,
        include_deleted: bool,
    ) -> Result<Decision, EngineError> {
        let deleted_clause = if include_deleted { "" } else { " AND is_deleted = 0" };
        let sql = format!(
            "SELECT
                decision_id, user_id, company_name, website_url,
                context_json, context_version, verdict_json, verdict_version,
                verdict_model_meta_json, status, rejection_reason, implemented_at,
                rollback_at, rollback_reason, episode_status, scenario_set_id,
                chosen_scenario_id, chosen_scenario_at, is_deleted, deleted_at,
                created_at, updated_at
             FROM decisions
             WHERE decision_id = ?1 AND user_id = ?2{deleted_clause}"
        );

        let raw = self
            .conn
            .query_row(&sql, params![decision_id.to_string(), user_id], DecisionRow::from_row)
            .optional()
            .ctx("load decision")?
            .ok_or_else(|| decision_not_found(decision_id))?;

        self.assemble_decision(raw)
    }

    /// List decisions for one user, newest first. Soft-deleted rows are
    /// excluded unless the administrative `include_deleted` flag is set.
    ///
    /// # Errors
    /// Returns a storage error when rows cannot be read or decoded.
    pub fn list_decisions(
        &self,
        user_id: &str,
        status: Option<DecisionStatus>,
        include_deleted: bool,
    ) -> Result<Vec<Decision>, EngineError> {
        let mut sql = String::from(
            "SELECT
                decision_id, user_id, company_name, website_url,
                context_json, context_version, verdict_json, verdict_version,
                verdict_model_meta_json, status, rejection_reason, implemented_at,
                rollback_at, rollback_reason, episode_status, scenario_set_id,
                chosen_scenario_id, chosen_scenario_at, is_deleted, deleted_at,
                created_at, updated_at
             FROM decisions
             WHERE user_id = ?1",
        );
        if !include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(" ORDER BY created_at DESC, decision_id ASC");

        let mut stmt = self.conn.prepare(&sql).ctx("prepare decision list")?;
        let rows = match status {
            Some(status) => stmt
                .query_map(params![user_id, status.as_str()], DecisionRow::from_row)
                .ctx("list decisions")?
                .collect::<Result<Vec<_>, _>>()
                .ctx("read decision rows")?,
            None => stmt
                .query_map(params![user_id], DecisionRow::from_row)
                .ctx("list decisions")?
                .collect::<Result<Vec<_>, _>>()
                .ctx("read decision rows")?,
        };

        rows.into_iter().map(|raw| self.assemble_decision(raw)).collect()
    }

    /// Append one context version: bump the counter and insert the history
    /// row in a single transaction so a concurrent append cannot orphan or
    /// overwrite an entry. Returns the new version number.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unowned/deleted decision and
    /// [`EngineError::Validation`] for a blank actor.
    pub fn append_context_version(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
        value: &Value,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<u32, EngineError> {
        self.append_field_version(decision_id, user_id, "context", value, None, actor, now)
    }

    /// Append one verdict version, recording the provenance of whoever or
    /// whatever produced it. Returns the new version number.
    ///
    /// # Errors
    /// Same contract as [`SqliteStore::append_context_version`].
    pub fn append_verdict_version(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
        value: &Value,
        model_meta: Option<&Value>,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<u32, EngineError> {
        self.append_field_version(decision_id, user_id, "verdict", value, model_meta, actor, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn append_field_version(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
        field: &str,
        value: &Value,
        model_meta: Option<&Value>,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<u32, EngineError> {
        if actor.trim().is_empty() {
            return Err(EngineError::Validation(
                "version append requires a non-empty actor".to_string(),
            ));
        }

        let value_json = encode_json(value, field)?;
        let meta_json = model_meta.map(|meta| encode_json(meta, "model meta")).transpose()?;
        let now_raw = rfc3339(now)?;

        let tx = self.conn.transaction().ctx("start version-append transaction")?;

        let updated = if field == "verdict" {
            tx.execute(
                "UPDATE decisions
                 SET verdict_json = ?1, verdict_version = verdict_version + 1,
                     verdict_model_meta_json = COALESCE(?2, verdict_model_meta_json),
                     updated_at = ?3
                 WHERE decision_id = ?4 AND user_id = ?5 AND is_deleted = 0",
                params![value_json, meta_json, now_raw, decision_id.to_string(), user_id],
            )
        } else {
            tx.execute(
                "UPDATE decisions
                 SET context_json = ?1, context_version = context_version + 1, updated_at = ?2
                 WHERE decision_id = ?3 AND user_id = ?4 AND is_deleted = 0",
                params![value_json, now_raw, decision_id.to_string(), user_id],
            )
        }
        .ctx("bump version counter")?;
        if updated == 0 {
            return Err(decision_not_found(decision_id));
        }

        let column = if field == "verdict" { "verdict_version" } else { "context_version" };
        let new_version: i64 = tx
            .query_row(
                &format!("SELECT {column} FROM decisions WHERE decision_id = ?1"),
                params![decision_id.to_string()],
                |row| row.get(0),
            )
            .ctx("read back version counter")?;

        tx.execute(
            "INSERT INTO decision_versions(
                decision_id, field, version, value_json, model_meta_json, created_at, created_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                decision_id.to_string(),
                field,
                new_version,
                value_json,
                meta_json,
                now_raw,
                actor
            ],
        )
        .ctx("insert version history row")?;

        tx.commit().ctx("commit version-append transaction")?;
        u32::try_from(new_version)
            .map_err(|_| EngineError::Storage(format!("version counter out of range: {new_version}")))
    }

    /// Validate and record one status transition: scalar status, its side
    /// effects, and exactly one appended audit event, atomically.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the reason rule fails and
    /// [`EngineError::NotFound`] for an unowned or soft-deleted decision.
    pub fn record_status_change(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
        change: &StatusChange,
        actor: &str,
        now: OffsetDateTime,
    ) -> Result<StatusEvent, EngineError> {
        change.validate()?;
        if actor.trim().is_empty() {
            return Err(EngineError::Validation(
                "status change requires a non-empty actor".to_string(),
            ));
        }

        let now_raw = rfc3339(now)?;
        let tx = self.conn.transaction().ctx("start status-change transaction")?;

        let updated = match change.new_status {
            DecisionStatus::Implemented => {
                let implemented_at = rfc3339(change.implemented_at.unwrap_or(now))?;
                tx.execute(
                    "UPDATE decisions SET status = ?1, implemented_at = ?2, updated_at = ?3
                     WHERE decision_id = ?4 AND user_id = ?5 AND is_deleted = 0",
                    params![
                        change.new_status.as_str(),
                        implemented_at,
                        now_raw,
                        decision_id.to_string(),
                        user_id
                    ],
                )
            }
            DecisionStatus::Rejected => tx.execute(
                "UPDATE decisions SET status = ?1, rejection_reason = ?2, updated_at = ?3
                 WHERE decision_id = ?4 AND user_id = ?5 AND is_deleted = 0",
                params![
                    change.new_status.as_str(),
                    change.reason,
                    now_raw,
                    decision_id.to_string(),
                    user_id
                ],
            ),
            DecisionStatus::RolledBack => {
                let rollback_at = rfc3339(change.rollback_at.unwrap_or(now))?;
                tx.execute(
                    "UPDATE decisions
                     SET status = ?1, rollback_at = ?2, rollback_reason = ?3, updated_at = ?4
                     WHERE decision_id = ?5 AND user_id = ?6 AND is_deleted = 0",
                    params![
                        change.new_status.as_str(),
                        rollback_at,
                        change.reason,
                        now_raw,
                        decision_id.to_string(),
                        user_id
                    ],
                )
            }
            DecisionStatus::Proposed | DecisionStatus::InReview | DecisionStatus::Approved => tx
                .execute(
                    "UPDATE decisions SET status = ?1, updated_at = ?2
                     WHERE decision_id = ?3 AND user_id = ?4 AND is_deleted = 0",
                    params![change.new_status.as_str(), now_raw, decision_id.to_string(), user_id],
                ),
        }
        .ctx("update decision status")?;
        if updated == 0 {
            return Err(decision_not_found(decision_id));
        }

        let event = StatusEvent {
            event_id: StatusEventId::new(),
            status: change.new_status,
            reason: change.reason.clone(),
            created_by: actor.to_string(),
            created_at: now,
        };
        insert_status_event(&tx, decision_id, &event)?;

        tx.commit().ctx("commit status-change transaction")?;
        Ok(event)
    }

    /// Soft-delete an owner-scoped decision; the row and its history remain
    /// for audit but disappear from every default read path.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unowned or already deleted
    /// decision.
    pub fn soft_delete_decision(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
        now: OffsetDateTime,
    ) -> Result<(), EngineError> {
        let now_raw = rfc3339(now)?;
        let updated = self
            .conn
            .execute(
                "UPDATE decisions SET is_deleted = 1, deleted_at = ?1, updated_at = ?1
                 WHERE decision_id = ?2 AND user_id = ?3 AND is_deleted = 0",
                params![now_raw, decision_id.to_string(), user_id],
            )
            .ctx("soft-delete decision")?;
        if updated == 0 {
            return Err(decision_not_found(decision_id));
        }
        Ok(())
    }

    /// Administrative hard delete: removes the decision and cascades to its
    /// versions, status events, outcomes, scenario sets, and delta cache.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the decision is not owned by
    /// `user_id`.
    pub fn hard_delete_decision(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<(), EngineError> {
        let tx = self.conn.transaction().ctx("start hard-delete transaction")?;
        let id_raw = decision_id.to_string();

        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM decisions WHERE decision_id = ?1 AND user_id = ?2",
                params![id_raw, user_id],
                |row| row.get(0),
            )
            .optional()
            .ctx("check decision ownership")?;
        if owned.is_none() {
            return Err(decision_not_found(decision_id));
        }

        tx.execute("DELETE FROM scenario_deltas WHERE decision_id = ?1", params![id_raw])
            .ctx("delete cached deltas")?;
        tx.execute(
            "DELETE FROM outcome_kpis WHERE outcome_id IN
             (SELECT outcome_id FROM outcomes WHERE decision_id = ?1)",
            params![id_raw],
        )
        .ctx("delete outcome kpis")?;
        tx.execute("DELETE FROM outcomes WHERE decision_id = ?1", params![id_raw])
            .ctx("delete outcomes")?;
        tx.execute("DELETE FROM scenario_sets WHERE decision_id = ?1", params![id_raw])
            .ctx("delete scenario sets")?;
        tx.execute("DELETE FROM status_events WHERE decision_id = ?1", params![id_raw])
            .ctx("delete status events")?;
        tx.execute("DELETE FROM decision_versions WHERE decision_id = ?1", params![id_raw])
            .ctx("delete version history")?;
        tx.execute("DELETE FROM decisions WHERE decision_id = ?1", params![id_raw])
            .ctx("delete decision")?;

        tx.commit().ctx("commit hard-delete transaction")?;
        Ok(())
    }

    /// Persist one outcome row plus its KPI child rows. Corrections must
    /// reference an existing outcome of the same decision and owner.
    ///
    /// # Errors
    /// Returns validation errors from [`Outcome::validate`], or NotFound when
    /// the decision or the corrected outcome is not visible to the owner.
    pub fn insert_outcome(&mut self, outcome: &Outcome) -> Result<(), EngineError> {
        outcome.validate()?;

        let tx = self.conn.transaction().ctx("start insert-outcome transaction")?;

        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM decisions
                 WHERE decision_id = ?1 AND user_id = ?2 AND is_deleted = 0",
                params![outcome.decision_id.to_string(), outcome.user_id],
                |row| row.get(0),
            )
            .optional()
            .ctx("check decision ownership")?;
        if owned.is_none() {
            return Err(decision_not_found(outcome.decision_id));
        }

        if let Some(corrected_id) = outcome.corrects_outcome_id {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM outcomes
                     WHERE outcome_id = ?1 AND decision_id = ?2 AND user_id = ?3",
                    params![
                        corrected_id.to_string(),
                        outcome.decision_id.to_string(),
                        outcome.user_id
                    ],
                    |row| row.get(0),
                )
                .optional()
                .ctx("check corrected outcome")?;
            if exists.is_none() {
                return Err(outcome_not_found(corrected_id));
            }
        }

        tx.execute(
            "INSERT INTO outcomes(
                outcome_id, decision_id, user_id, chosen_scenario_id, status, metric,
                timeframe_days, is_correction, corrects_outcome_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                outcome.outcome_id.to_string(),
                outcome.decision_id.to_string(),
                outcome.user_id,
                outcome.chosen_scenario_id,
                outcome.status.as_str(),
                outcome.metric.as_str(),
                outcome.timeframe_days,
                i64::from(outcome.is_correction),
                outcome.corrects_outcome_id.map(|id| id.to_string()),
                rfc3339(outcome.created_at)?,
                rfc3339(outcome.updated_at)?,
            ],
        )
        .ctx("insert outcome")?;

        for kpi in &outcome.kpis {
            tx.execute(
                "INSERT INTO outcome_kpis(outcome_id, kpi_key, baseline, target, actual, delta_pct)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    outcome.outcome_id.to_string(),
                    kpi.key,
                    kpi.baseline,
                    kpi.target,
                    kpi.actual,
                    kpi.delta_pct
                ],
            )
            .ctx("insert outcome kpi")?;
        }

        tx.commit().ctx("commit insert-outcome transaction")?;
        Ok(())
    }

    /// Load one owner-scoped outcome with its KPIs.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when absent or owned by another user.
    pub fn get_outcome(&self, outcome_id: OutcomeId, user_id: &str) -> Result<Outcome, EngineError> {
        let raw = self
            .conn
            .query_row(
                "SELECT outcome_id, decision_id, user_id, chosen_scenario_id, status, metric,
                        timeframe_days, is_correction, corrects_outcome_id, created_at, updated_at
                 FROM outcomes WHERE outcome_id = ?1 AND user_id = ?2",
                params![outcome_id.to_string(), user_id],
                OutcomeRow::from_row,
            )
            .optional()
            .ctx("load outcome")?
            .ok_or_else(|| outcome_not_found(outcome_id))?;

        self.assemble_outcome(raw)
    }

    /// List all outcomes recorded against one owner-scoped decision in
    /// creation order, corrections included.
    ///
    /// # Errors
    /// Returns a storage error when rows cannot be read or decoded.
    pub fn list_outcomes(
        &self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<Vec<Outcome>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT outcome_id, decision_id, user_id, chosen_scenario_id, status, metric,
                        timeframe_days, is_correction, corrects_outcome_id, created_at, updated_at
                 FROM outcomes WHERE decision_id = ?1 AND user_id = ?2
                 ORDER BY created_at ASC, outcome_id ASC",
            )
            .ctx("prepare outcome list")?;
        let rows = stmt
            .query_map(params![decision_id.to_string(), user_id], OutcomeRow::from_row)
            .ctx("list outcomes")?
            .collect::<Result<Vec<_>, _>>()
            .ctx("read outcome rows")?;

        rows.into_iter().map(|raw| self.assemble_outcome(raw)).collect()
    }

    /// Direct status update on one outcome; always bumps `updated_at`.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when absent or owned by another user.
    pub fn update_outcome_status(
        &mut self,
        outcome_id: OutcomeId,
        user_id: &str,
        status: OutcomeStatus,
        now: OffsetDateTime,
    ) -> Result<Outcome, EngineError> {
        let updated = self
            .conn
            .execute(
                "UPDATE outcomes SET status = ?1, updated_at = ?2
                 WHERE outcome_id = ?3 AND user_id = ?4",
                params![status.as_str(), rfc3339(now)?, outcome_id.to_string(), user_id],
            )
            .ctx("update outcome status")?;
        if updated == 0 {
            return Err(outcome_not_found(outcome_id));
        }
        self.get_outcome(outcome_id, user_id)
    }

    /// Set the measured value of one KPI and recompute its zero-guarded delta;
    /// other KPIs of the outcome are untouched.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the outcome or the KPI key is
    /// not visible to the owner.
    pub fn update_kpi_actual(
        &mut self,
        outcome_id: OutcomeId,
        user_id: &str,
        kpi_key: &str,
        actual: f64,
        now: OffsetDateTime,
    ) -> Result<Outcome, EngineError> {
        let tx = self.conn.transaction().ctx("start kpi-update transaction")?;

        let baseline: Option<f64> = tx
            .query_row(
                "SELECT k.baseline FROM outcome_kpis k
                 JOIN outcomes o ON o.outcome_id = k.outcome_id
                 WHERE k.outcome_id = ?1 AND k.kpi_key = ?2 AND o.user_id = ?3",
                params![outcome_id.to_string(), kpi_key, user_id],
                |row| row.get(0),
            )
            .optional()
            .ctx("load kpi baseline")?;
        let Some(baseline) = baseline else {
            return Err(EngineError::NotFound(format!(
                "kpi not found: {kpi_key} on outcome {outcome_id}"
            )));
        };

        let delta_pct = pricelens_core::compute_delta_percent(baseline, actual);
        tx.execute(
            "UPDATE outcome_kpis SET actual = ?1, delta_pct = ?2
             WHERE outcome_id = ?3 AND kpi_key = ?4",
            params![actual, delta_pct, outcome_id.to_string(), kpi_key],
        )
        .ctx("update kpi actual")?;
        tx.execute(
            "UPDATE outcomes SET updated_at = ?1 WHERE outcome_id = ?2",
            params![rfc3339(now)?, outcome_id.to_string()],
        )
        .ctx("bump outcome updated_at")?;

        tx.commit().ctx("commit kpi-update transaction")?;
        self.get_outcome(outcome_id, user_id)
    }

    /// Owner-scoped hard delete of one outcome and its KPI rows. Outcome
    /// history is not globally append-only the way status history is.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when absent or owned by another user.
    pub fn delete_outcome(&mut self, outcome_id: OutcomeId, user_id: &str) -> Result<(), EngineError> {
        let tx = self.conn.transaction().ctx("start delete-outcome transaction")?;
        tx.execute(
            "DELETE FROM outcome_kpis WHERE outcome_id IN
             (SELECT outcome_id FROM outcomes WHERE outcome_id = ?1 AND user_id = ?2)",
            params![outcome_id.to_string(), user_id],
        )
        .ctx("delete outcome kpis")?;
        let deleted = tx
            .execute(
                "DELETE FROM outcomes WHERE outcome_id = ?1 AND user_id = ?2",
                params![outcome_id.to_string(), user_id],
            )
            .ctx("delete outcome")?;
        if deleted == 0 {
            return Err(outcome_not_found(outcome_id));
        }
        tx.commit().ctx("commit delete-outcome transaction")?;
        Ok(())
    }

    /// Create the next scenario set version for a decision. The version is
    /// `max(existing) + 1` computed inside the same transaction, existing
    /// versions are never overwritten or resequenced, and the decision's
    /// delta cache is invalidated atomically with the insert.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unowned/deleted decision and
    /// validation errors for a malformed scenario list.
    pub fn insert_scenario_set(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
        scenarios: Vec<Scenario>,
        model_meta: Option<Value>,
        now: OffsetDateTime,
    ) -> Result<ScenarioSet, EngineError> {
        let tx = self.conn.transaction().ctx("start scenario-set transaction")?;
        let id_raw = decision_id.to_string();

        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM decisions
                 WHERE decision_id = ?1 AND user_id = ?2 AND is_deleted = 0",
                params![id_raw, user_id],
                |row| row.get(0),
            )
            .optional()
            .ctx("check decision ownership")?;
        if owned.is_none() {
            return Err(decision_not_found(decision_id));
        }

        let max_version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM scenario_sets
                 WHERE decision_id = ?1 AND user_id = ?2",
                params![id_raw, user_id],
                |row| row.get(0),
            )
            .ctx("read max scenario set version")?;
        let version = u32::try_from(max_version + 1).map_err(|_| {
            EngineError::Storage(format!("scenario set version out of range: {max_version}"))
        })?;

        let set = ScenarioSet {
            scenario_set_id: ScenarioSetId::new(),
            decision_id,
            user_id: user_id.to_string(),
            version,
            scenarios,
            model_meta,
            is_deleted: false,
            created_at: now,
        };
        set.validate()?;

        tx.execute(
            "INSERT INTO scenario_sets(
                scenario_set_id, decision_id, user_id, version, scenarios_json,
                model_meta_json, is_deleted, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                set.scenario_set_id.to_string(),
                id_raw,
                set.user_id,
                i64::from(set.version),
                encode_json(&set.scenarios, "scenarios")?,
                set.model_meta.as_ref().map(|meta| encode_json(meta, "model meta")).transpose()?,
                rfc3339(set.created_at)?,
            ],
        )
        .ctx("insert scenario set")?;

        tx.execute(
            "UPDATE decisions SET scenario_set_id = ?1, updated_at = ?2 WHERE decision_id = ?3",
            params![set.scenario_set_id.to_string(), rfc3339(now)?, id_raw],
        )
        .ctx("point decision at new scenario set")?;

        // Stale deltas computed against the previous set must never leak
        // into comparisons of the new one.
        tx.execute("DELETE FROM scenario_deltas WHERE decision_id = ?1", params![id_raw])
            .ctx("invalidate delta cache")?;

        tx.commit().ctx("commit scenario-set transaction")?;
        Ok(set)
    }

    /// Current scenario set for a decision: highest non-deleted version.
    ///
    /// # Errors
    /// Returns a storage error when the row cannot be read or decoded.
    pub fn current_scenario_set(
        &self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<Option<ScenarioSet>, EngineError> {
        let raw = self
            .conn
            .query_row(
                "SELECT scenario_set_id, decision_id, user_id, version, scenarios_json,
                        model_meta_json, is_deleted, created_at
                 FROM scenario_sets
                 WHERE decision_id = ?1 AND user_id = ?2 AND is_deleted = 0
                 ORDER BY version DESC LIMIT 1",
                params![decision_id.to_string(), user_id],
                ScenarioSetRow::from_row,
            )
            .optional()
            .ctx("load current scenario set")?;

        raw.map(assemble_scenario_set).transpose()
    }

    /// Soft-delete one scenario set version; other versions keep their
    /// numbering.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the set is not visible to the
    /// owner.
    pub fn soft_delete_scenario_set(
        &mut self,
        scenario_set_id: ScenarioSetId,
        user_id: &str,
    ) -> Result<(), EngineError> {
        let updated = self
            .conn
            .execute(
                "UPDATE scenario_sets SET is_deleted = 1
                 WHERE scenario_set_id = ?1 AND user_id = ?2 AND is_deleted = 0",
                params![scenario_set_id.to_string(), user_id],
            )
            .ctx("soft-delete scenario set")?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!(
                "scenario set not found: {scenario_set_id}"
            )));
        }
        Ok(())
    }

    /// Record the user's chosen path on the decision and flip its episode
    /// status. Re-choosing the same scenario is a no-op that still refreshes
    /// the timestamp.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the decision is not visible or
    /// the scenario id is absent from the current set.
    pub fn set_chosen_scenario(
        &mut self,
        decision_id: DecisionId,
        user_id: &str,
        scenario_id: &str,
        now: OffsetDateTime,
    ) -> Result<(), EngineError> {
        let current = self
            .current_scenario_set(decision_id, user_id)?
            .ok_or_else(|| decision_not_found(decision_id))?;
        if current.find_scenario(scenario_id).is_none() {
            return Err(EngineError::NotFound(format!("scenario not found: {scenario_id}")));
        }

        let updated = self
            .conn
            .execute(
                "UPDATE decisions
                 SET chosen_scenario_id = ?1, chosen_scenario_at = ?2,
                     episode_status = 'path_chosen', updated_at = ?2
                 WHERE decision_id = ?3 AND user_id = ?4 AND is_deleted = 0",
                params![scenario_id, rfc3339(now)?, decision_id.to_string(), user_id],
            )
            .ctx("set chosen scenario")?;
        if updated == 0 {
            return Err(decision_not_found(decision_id));
        }
        Ok(())
    }

    /// Cache lookup by the composite delta key. A hit is returned unchanged;
    /// the cache is only ever cleared by explicit invalidation.
    ///
    /// # Errors
    /// Returns a storage error when the row cannot be read or decoded.
    pub fn get_cached_delta(
        &self,
        decision_id: DecisionId,
        verdict_version: u32,
        baseline_scenario_id: &str,
        candidate_scenario_id: &str,
    ) -> Result<Option<ScenarioDelta>, EngineError> {
        let raw: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT deltas_json, created_at FROM scenario_deltas
                 WHERE decision_id = ?1 AND verdict_version = ?2
                   AND baseline_scenario_id = ?3 AND candidate_scenario_id = ?4",
                params![
                    decision_id.to_string(),
                    i64::from(verdict_version),
                    baseline_scenario_id,
                    candidate_scenario_id
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .ctx("load cached delta")?;

        let Some((deltas_json, created_at_raw)) = raw else {
            return Ok(None);
        };
        Ok(Some(ScenarioDelta {
            decision_id,
            verdict_version,
            baseline_scenario_id: baseline_scenario_id.to_string(),
            candidate_scenario_id: candidate_scenario_id.to_string(),
            deltas: decode_json(&deltas_json, "delta metrics")?,
            created_at: parse_rfc3339(&created_at_raw)?,
        }))
    }

    /// Upsert one computed delta row. The unique key makes a rapid
    /// double-submit converge instead of duplicating rows.
    ///
    /// # Errors
    /// Returns a storage error when the write fails.
    pub fn upsert_delta(&mut self, delta: &ScenarioDelta) -> Result<(), EngineError> {
        self.conn
            .execute(
                "INSERT INTO scenario_deltas(
                    decision_id, verdict_version, baseline_scenario_id, candidate_scenario_id,
                    deltas_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(decision_id, verdict_version, baseline_scenario_id, candidate_scenario_id)
                 DO UPDATE SET deltas_json = excluded.deltas_json, created_at = excluded.created_at",
                params![
                    delta.decision_id.to_string(),
                    i64::from(delta.verdict_version),
                    delta.baseline_scenario_id,
                    delta.candidate_scenario_id,
                    encode_json(&delta.deltas, "delta metrics")?,
                    rfc3339(delta.created_at)?,
                ],
            )
            .ctx("upsert cached delta")?;
        Ok(())
    }

    /// Drop every cached delta for one decision. Returns the number of rows
    /// removed.
    ///
    /// # Errors
    /// Returns a storage error when the delete fails.
    pub fn invalidate_deltas_for_decision(
        &mut self,
        decision_id: DecisionId,
    ) -> Result<usize, EngineError> {
        self.conn
            .execute(
                "DELETE FROM scenario_deltas WHERE decision_id = ?1",
                params![decision_id.to_string()],
            )
            .ctx("invalidate delta cache")
    }

    fn assemble_decision(&self, raw: DecisionRow) -> Result<Decision, EngineError> {
        let decision_id = DecisionId(parse_ulid(&raw.decision_id, "decision")?);
        let context = self.load_versioned_field(decision_id, "context", raw.context_json)?;
        let verdict = self.load_versioned_field(decision_id, "verdict", raw.verdict_json)?;
        let status_events = self.load_status_events(decision_id)?;

        let status = DecisionStatus::parse(&raw.status)
            .ok_or_else(|| EngineError::Storage(format!("unknown status: {}", raw.status)))?;
        let episode_status = EpisodeStatus::parse(&raw.episode_status).ok_or_else(|| {
            EngineError::Storage(format!("unknown episode status: {}", raw.episode_status))
        })?;

        let decision = Decision {
            decision_id,
            user_id: raw.user_id,
            company_name: raw.company_name,
            website_url: raw.website_url,
            context: VersionedField {
                version: raw.context_version,
                ..context
            },
            verdict: VersionedField {
                version: raw.verdict_version,
                ..verdict
            },
            verdict_model_meta: raw
                .verdict_model_meta_json
                .as_deref()
                .map(|json| decode_json(json, "model meta"))
                .transpose()?,
            status,
            status_events,
            rejection_reason: raw.rejection_reason,
            implemented_at: opt_parse_rfc3339(raw.implemented_at)?,
            rollback_at: opt_parse_rfc3339(raw.rollback_at)?,
            rollback_reason: raw.rollback_reason,
            episode_status,
            scenario_set_id: raw
                .scenario_set_id
                .as_deref()
                .map(|id| parse_ulid(id, "scenario set").map(ScenarioSetId))
                .transpose()?,
            chosen_scenario_id: raw.chosen_scenario_id,
            chosen_scenario_at: opt_parse_rfc3339(raw.chosen_scenario_at)?,
            is_deleted: raw.is_deleted != 0,
            deleted_at: opt_parse_rfc3339(raw.deleted_at)?,
            created_at: parse_rfc3339(&raw.created_at)?,
            updated_at: parse_rfc3339(&raw.updated_at)?,
        };

        decision.validate()?;
        Ok(decision)
    }

    fn load_versioned_field(
        &self,
        decision_id: DecisionId,
        field: &str,
        current_json: Option<String>,
    ) -> Result<VersionedField<Value>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT version, value_json, created_at, created_by FROM decision_versions
                 WHERE decision_id = ?1 AND field = ?2 ORDER BY version ASC",
            )
            .ctx("prepare version history")?;
        let rows = stmt
            .query_map(params![decision_id.to_string(), field], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .ctx("load version history")?
            .collect::<Result<Vec<_>, _>>()
            .ctx("read version history rows")?;

        let mut history = Vec::with_capacity(rows.len());
        for (version, value_json, created_at, created_by) in rows {
            history.push(VersionEntry {
                version: u32::try_from(version).map_err(|_| {
                    EngineError::Storage(format!("stored version out of range: {version}"))
                })?,
                value: decode_json(&value_json, field)?,
                created_at: parse_rfc3339(&created_at)?,
                created_by,
            });
        }

        let current =
            current_json.as_deref().map(|json| decode_json(json, field)).transpose()?;
        let version = u32::try_from(history.len()).map_err(|_| {
            EngineError::Storage("version history length out of range".to_string())
        })?;
        Ok(VersionedField { current, version, history })
    }

    fn load_status_events(&self, decision_id: DecisionId) -> Result<Vec<StatusEvent>, EngineError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_id, status, reason, created_by, created_at FROM status_events
                 WHERE decision_id = ?1 ORDER BY created_at ASC, event_id ASC",
            )
            .ctx("prepare status events")?;
        let rows = stmt
            .query_map(params![decision_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .ctx("load status events")?
            .collect::<Result<Vec<_>, _>>()
            .ctx("read status event rows")?;

        let mut events = Vec::with_capacity(rows.len());
        for (event_id, status, reason, created_by, created_at) in rows {
            events.push(StatusEvent {
                event_id: StatusEventId(parse_ulid(&event_id, "status event")?),
                status: DecisionStatus::parse(&status)
                    .ok_or_else(|| EngineError::Storage(format!("unknown status: {status}")))?,
                reason,
                created_by,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(events)
    }

    fn assemble_outcome(&self, raw: OutcomeRow) -> Result<Outcome, EngineError> {
        let outcome_id = OutcomeId(parse_ulid(&raw.outcome_id, "outcome")?);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT kpi_key, baseline, target, actual, delta_pct FROM outcome_kpis
                 WHERE outcome_id = ?1 ORDER BY kpi_key ASC",
            )
            .ctx("prepare kpi rows")?;
        let kpis = stmt
            .query_map(params![raw.outcome_id.as_str()], |row| {
                Ok(Kpi {
                    key: row.get(0)?,
                    baseline: row.get(1)?,
                    target: row.get(2)?,
                    actual: row.get(3)?,
                    delta_pct: row.get(4)?,
                })
            })
            .ctx("load kpi rows")?
            .collect::<Result<Vec<_>, _>>()
            .ctx("read kpi rows")?;

        Ok(Outcome {
            outcome_id,
            decision_id: DecisionId(parse_ulid(&raw.decision_id, "decision")?),
            user_id: raw.user_id,
            chosen_scenario_id: raw.chosen_scenario_id,
            status: OutcomeStatus::parse(&raw.status).ok_or_else(|| {
                EngineError::Storage(format!("unknown outcome status: {}", raw.status))
            })?,
            metric: MetricKind::parse(&raw.metric)
                .ok_or_else(|| EngineError::Storage(format!("unknown metric: {}", raw.metric)))?,
            timeframe_days: raw.timeframe_days,
            kpis,
            is_correction: raw.is_correction != 0,
            corrects_outcome_id: raw
                .corrects_outcome_id
                .as_deref()
                .map(|id| parse_ulid(id, "outcome").map(OutcomeId))
                .transpose()?,
            created_at: parse_rfc3339(&raw.created_at)?,
            updated_at: parse_rfc3339(&raw.updated_at)?,
        })
    }
}

fn insert_version_rows(
    tx: &Transaction<'_>,
    decision_id: DecisionId,
    field: &str,
    history: &[VersionEntry<Value>],
    model_meta: Option<&Value>,
) -> Result<(), EngineError> {
    for entry in history {
        tx.execute(
            "INSERT INTO decision_versions(
                decision_id, field, version, value_json, model_meta_json, created_at, created_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                decision_id.to_string(),
                field,
                i64::from(entry.version),
                encode_json(&entry.value, field)?,
                model_meta.map(|meta| encode_json(meta, "model meta")).transpose()?,
                rfc3339(entry.created_at)?,
                entry.created_by,
            ],
        )
        .ctx("insert version history row")?;
    }
    Ok(())
}

fn insert_status_event(
    tx: &Transaction<'_>,
    decision_id: DecisionId,
    event: &StatusEvent,
) -> Result<(), EngineError> {
    tx.execute(
        "INSERT INTO status_events(event_id, decision_id, status, reason, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id.to_string(),
            decision_id.to_string(),
            event.status.as_str(),
            event.reason,
            event.created_by,
            rfc3339(event.created_at)?,
        ],
    )
    .ctx("insert status event")?;
    Ok(())
}

struct DecisionRow {
    decision_id: String,
    user_id: String,
    company_name: String,
    website_url: String,
    context_json: Option<String>,
    context_version: u32,
    verdict_json: Option<String>,
    verdict_version: u32,
    verdict_model_meta_json: Option<String>,
    status: String,
    rejection_reason: Option<String>,
    implemented_at: Option<String>,
    rollback_at: Option<String>,
    rollback_reason: Option<String>,
    episode_status: String,
    scenario_set_id: Option<String>,
    chosen_scenario_id: Option<String>,
    chosen_scenario_at: Option<String>,
    is_deleted: i64,
    deleted_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DecisionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            decision_id: row.get(0)?,
            user_id: row.get(1)?,
            company_name: row.get(2)?,
            website_url: row.get(3)?,
            context_json: row.get(4)?,
            context_version: row.get(5)?,
            verdict_json: row.get(6)?,
            verdict_version: row.get(7)?,
            verdict_model_meta_json: row.get(8)?,
            status: row.get(9)?,
            rejection_reason: row.get(10)?,
            implemented_at: row.get(11)?,
            rollback_at: row.get(12)?,
            rollback_reason: row.get(13)?,
            episode_status: row.get(14)?,
            scenario_set_id: row.get(15)?,
            chosen_scenario_id: row.get(16)?,
            chosen_scenario_at: row.get(17)?,
            is_deleted: row.get(18)?,
            deleted_at: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }
}

struct OutcomeRow {
    outcome_id: String,
    decision_id: String,
    user_id: String,
    chosen_scenario_id: Option<String>,
    status: String,
    metric: String,
    timeframe_days: i64,
    is_correction: i64,
    corrects_outcome_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl OutcomeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            outcome_id: row.get(0)?,
            decision_id: row.get(1)?,
            user_id: row.get(2)?,
            chosen_scenario_id: row.get(3)?,
            status: row.get(4)?,
            metric: row.get(5)?,
            timeframe_days: row.get(6)?,
            is_correction: row.get(7)?,
            corrects_outcome_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

struct ScenarioSetRow {
    scenario_set_id: String,
    decision_id: String,
    user_id: String,
    version: i64,
    scenarios_json: String,
    model_meta_json: Option<String>,
    is_deleted: i64,
    created_at: String,
}

impl ScenarioSetRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            scenario_set_id: row.get(0)?,
            decision_id: row.get(1)?,
            user_id: row.get(2)?,
            version: row.get(3)?,
            scenarios_json: row.get(4)?,
            model_meta_json: row.get(5)?,
            is_deleted: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

fn assemble_scenario_set(raw: ScenarioSetRow) -> Result<ScenarioSet, EngineError> {
    Ok(ScenarioSet {
        scenario_set_id: ScenarioSetId(parse_ulid(&raw.scenario_set_id, "scenario set")?),
        decision_id: DecisionId(parse_ulid(&raw.decision_id, "decision")?),
        user_id: raw.user_id,
        version: u32::try_from(raw.version).map_err(|_| {
            EngineError::Storage(format!("stored scenario set version out of range: {}", raw.version))
        })?,
        scenarios: decode_json(&raw.scenarios_json, "scenarios")?,
        model_meta: raw
            .model_meta_json
            .as_deref()
            .map(|json| decode_json(json, "model meta"))
            .transpose()?,
        is_deleted: raw.is_deleted != 0,
        created_at: parse_rfc3339(&raw.created_at)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64, EngineError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .ctx("read schema version")
}
