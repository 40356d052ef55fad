use std::path::PathBuf;

use pricelens_core::{
    build_compare_item, compute_scenario_delta, effective_outcome, resolve_baseline, Decision,
    DecisionCompareItem, DecisionId, DecisionStatus, EngineError, Kpi, MetricKind, Outcome,
    OutcomeId, OutcomeStatus, Scenario, ScenarioDelta, ScenarioSet, StatusChange,
    validate_compare_ids,
};
use pricelens_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateDecisionRequest {
    pub user_id: String,
    pub company_name: String,
    pub website_url: String,
    /// Optional first context version, recorded as version 1 on creation.
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListDecisionsRequest {
    pub user_id: String,
    pub status: Option<DecisionStatus>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateContextRequest {
    pub decision_id: DecisionId,
    pub user_id: String,
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegenerateVerdictRequest {
    pub decision_id: DecisionId,
    pub user_id: String,
    pub verdict: Value,
    pub model_meta: Option<Value>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateStatusRequest {
    pub decision_id: DecisionId,
    pub user_id: String,
    pub new_status: DecisionStatus,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub implemented_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rollback_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiInput {
    pub key: String,
    pub baseline: f64,
    pub target: f64,
    pub actual: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddOutcomeRequest {
    pub decision_id: DecisionId,
    pub user_id: String,
    pub chosen_scenario_id: Option<String>,
    pub status: OutcomeStatus,
    pub metric: MetricKind,
    pub timeframe_days: i64,
    pub kpis: Vec<KpiInput>,
    pub is_correction: bool,
    pub corrects_outcome_id: Option<OutcomeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateKpiActualRequest {
    pub decision_id: DecisionId,
    pub user_id: String,
    /// When absent the effective outcome of the decision is targeted.
    pub outcome_id: Option<OutcomeId>,
    pub kpi_key: String,
    pub actual: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateScenariosRequest {
    pub decision_id: DecisionId,
    pub user_id: String,
    pub scenarios: Vec<Scenario>,
    pub model_meta: Option<Value>,
    /// Without `force`, an existing current set is returned unchanged.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetDeltaRequest {
    pub decision_id: DecisionId,
    pub user_id: String,
    /// Defaults to the decision's resolved baseline scenario.
    pub baseline_scenario_id: Option<String>,
    pub candidate_scenario_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompareDecisionsRequest {
    pub user_id: String,
    pub decision_ids: Vec<DecisionId>,
}

/// Cache-first delta lookup. A hit is returned unchanged, never refreshed;
/// on a miss the value is computed exactly once and written back best-effort,
/// so a failed cache write still returns the computed value.
fn cached_or_compute<F>(
    store: &mut SqliteStore,
    decision_id: DecisionId,
    verdict_version: u32,
    baseline_scenario_id: &str,
    candidate_scenario_id: &str,
    compute: F,
) -> Result<ScenarioDelta, EngineError>
where
    F: FnOnce() -> Result<ScenarioDelta, EngineError>,
{
    if let Some(hit) = store.get_cached_delta(
        decision_id,
        verdict_version,
        baseline_scenario_id,
        candidate_scenario_id,
    )? {
        return Ok(hit);
    }

    let delta = compute()?;
    let _cache_write = store.upsert_delta(&delta);
    Ok(delta)
}

/// Fold an operator-supplied regeneration reason into the verdict provenance
/// object so the audit trail keeps it alongside the model metadata.
fn verdict_provenance(model_meta: Option<Value>, reason: Option<String>) -> Option<Value> {
    match (model_meta, reason) {
        (meta, None) => meta,
        (Some(Value::Object(mut map)), Some(reason)) => {
            map.insert("regeneration_reason".to_string(), Value::String(reason));
            Some(Value::Object(map))
        }
        (Some(other), Some(reason)) => {
            Some(json!({ "meta": other, "regeneration_reason": reason }))
        }
        (None, Some(reason)) => Some(json!({ "regeneration_reason": reason })),
    }
}

#[derive(Debug, Clone)]
pub struct DecisionEngineApi {
    db_path: PathBuf,
}

impl DecisionEngineApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, EngineError> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, EngineError> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, EngineError> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create one decision owned by `user_id`, optionally seeding context
    /// version 1.
    ///
    /// # Errors
    /// Returns validation errors for blank ownership fields, or a storage
    /// error when persistence fails.
    pub fn create_decision(&self, input: CreateDecisionRequest) -> Result<Decision, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let now = OffsetDateTime::now_utc();
        let mut decision =
            Decision::new(input.user_id.clone(), input.company_name, input.website_url, now);
        if let Some(context) = input.context {
            // Seeded in memory so the decision row and its version-1 history
            // row land in the same insert transaction.
            decision.context.append(context, &input.user_id, now)?;
        }
        decision.validate()?;
        store.insert_decision(&decision)?;
        store.get_decision(decision.decision_id, &input.user_id, false)
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
        let mut store = self.open_store()?;
        store.migrate()?;
        store.get_decision(decision_id, user_id, include_deleted)
    }

    /// List one user's decisions, newest first, with an optional status
    /// filter.
    ///
    /// # Errors
    /// Returns a storage error when rows cannot be read or decoded.
    pub fn list_decisions(&self, input: &ListDecisionsRequest) -> Result<Vec<Decision>, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_decisions(&input.user_id, input.status, input.include_deleted)
    }

    /// Append one context version and return the refreshed decision.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unowned or deleted decision.
    pub fn update_context(&self, input: UpdateContextRequest) -> Result<Decision, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.append_context_version(
            input.decision_id,
            &input.user_id,
            &input.context,
            &input.user_id,
            OffsetDateTime::now_utc(),
        )?;
        store.get_decision(input.decision_id, &input.user_id, false)
    }

    /// Append one verdict version with its provenance and return the
    /// refreshed decision. The prior verdict stays in history untouched.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unowned or deleted decision.
    pub fn regenerate_verdict(
        &self,
        input: RegenerateVerdictRequest,
    ) -> Result<Decision, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let model_meta = verdict_provenance(input.model_meta, input.reason);
        store.append_verdict_version(
            input.decision_id,
            &input.user_id,
            &input.verdict,
            model_meta.as_ref(),
            &input.user_id,
            OffsetDateTime::now_utc(),
        )?;
        store.get_decision(input.decision_id, &input.user_id, false)
    }

    /// Record one status transition with its side effects and audit event.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when a rejected or rolled-back
    /// target is missing its reason, and NotFound for an invisible decision.
    pub fn update_status(&self, input: UpdateStatusRequest) -> Result<Decision, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let change = StatusChange {
            new_status: input.new_status,
            reason: input.reason,
            implemented_at: input.implemented_at,
            rollback_at: input.rollback_at,
        };
        store.record_status_change(
            input.decision_id,
            &input.user_id,
            &change,
            &input.user_id,
            OffsetDateTime::now_utc(),
        )?;
        store.get_decision(input.decision_id, &input.user_id, false)
    }

    /// Soft-delete a decision; history rows survive for audit.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unowned or already deleted
    /// decision.
    pub fn soft_delete_decision(
        &self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<(), EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.soft_delete_decision(decision_id, user_id, OffsetDateTime::now_utc())
    }

    /// Administrative hard delete of a decision and everything attached to it.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the decision is not owned by
    /// `user_id`.
    pub fn hard_delete_decision(
        &self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<(), EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.hard_delete_decision(decision_id, user_id)
    }

    /// Record one outcome (or correction) against a decision.
    ///
    /// # Errors
    /// Returns validation errors from the outcome contract, or NotFound when
    /// the decision or corrected outcome is not visible to the owner.
    pub fn add_outcome(&self, input: AddOutcomeRequest) -> Result<Outcome, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let now = OffsetDateTime::now_utc();
        let kpis = input
            .kpis
            .into_iter()
            .map(|kpi| {
                let mut built = Kpi {
                    key: kpi.key,
                    baseline: kpi.baseline,
                    target: kpi.target,
                    actual: None,
                    delta_pct: None,
                };
                if let Some(actual) = kpi.actual {
                    built.set_actual(actual);
                }
                built
            })
            .collect();

        let outcome = Outcome {
            outcome_id: OutcomeId::new(),
            decision_id: input.decision_id,
            user_id: input.user_id.clone(),
            chosen_scenario_id: input.chosen_scenario_id,
            status: input.status,
            metric: input.metric,
            timeframe_days: input.timeframe_days,
            kpis,
            is_correction: input.is_correction,
            corrects_outcome_id: input.corrects_outcome_id,
            created_at: now,
            updated_at: now,
        };
        store.insert_outcome(&outcome)?;
        store.get_outcome(outcome.outcome_id, &input.user_id)
    }

    /// Direct status update on one outcome.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the outcome is not visible to
    /// the owner.
    pub fn update_outcome_status(
        &self,
        outcome_id: OutcomeId,
        user_id: &str,
        status: OutcomeStatus,
    ) -> Result<Outcome, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.update_outcome_status(outcome_id, user_id, status, OffsetDateTime::now_utc())
    }

    /// Set the measured value of one KPI. When no outcome id is supplied the
    /// decision's effective outcome is targeted.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the outcome, the KPI key, or an
    /// effective outcome to target cannot be found.
    pub fn update_kpi_actual(&self, input: UpdateKpiActualRequest) -> Result<Outcome, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let outcome_id = match input.outcome_id {
            Some(outcome_id) => {
                // An outcome id from another decision reads the same as an
                // absent one; the decision scope in the request is binding.
                let outcome = store.get_outcome(outcome_id, &input.user_id)?;
                if outcome.decision_id != input.decision_id {
                    return Err(EngineError::NotFound(format!("outcome not found: {outcome_id}")));
                }
                outcome_id
            }
            None => {
                let outcomes = store.list_outcomes(input.decision_id, &input.user_id)?;
                effective_outcome(&outcomes)
                    .map(|outcome| outcome.outcome_id)
                    .ok_or_else(|| {
                        EngineError::NotFound(format!(
                            "no effective outcome for decision: {}",
                            input.decision_id
                        ))
                    })?
            }
        };
        store.update_kpi_actual(
            outcome_id,
            &input.user_id,
            &input.kpi_key,
            input.actual,
            OffsetDateTime::now_utc(),
        )
    }

    /// All outcomes of one decision in creation order, corrections included.
    ///
    /// # Errors
    /// Returns a storage error when rows cannot be read or decoded.
    pub fn list_outcomes(
        &self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<Vec<Outcome>, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_outcomes(decision_id, user_id)
    }

    /// Resolve the single outcome consumers should treat as current truth.
    ///
    /// # Errors
    /// Returns a storage error when rows cannot be read or decoded.
    pub fn get_effective_outcome(
        &self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<Option<Outcome>, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let outcomes = store.list_outcomes(decision_id, user_id)?;
        Ok(effective_outcome(&outcomes).cloned())
    }

    /// Hard-delete one outcome and its KPI rows.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the outcome is not visible to
    /// the owner.
    pub fn delete_outcome(&self, outcome_id: OutcomeId, user_id: &str) -> Result<(), EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.delete_outcome(outcome_id, user_id)
    }

    /// Store a generated scenario set. Without `force` an existing current
    /// set is returned unchanged; with `force` the next version is created
    /// and the decision's delta cache is invalidated in the same transaction.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an invisible decision and
    /// validation errors for a malformed scenario list.
    pub fn generate_scenarios(
        &self,
        input: GenerateScenariosRequest,
    ) -> Result<ScenarioSet, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;

        if !input.force {
            if let Some(current) = store.current_scenario_set(input.decision_id, &input.user_id)? {
                return Ok(current);
            }
        }
        store.insert_scenario_set(
            input.decision_id,
            &input.user_id,
            input.scenarios,
            input.model_meta,
            OffsetDateTime::now_utc(),
        )
    }

    /// Current scenario set of a decision, if one has been generated.
    ///
    /// # Errors
    /// Returns a storage error when the row cannot be read or decoded.
    pub fn current_scenarios(
        &self,
        decision_id: DecisionId,
        user_id: &str,
    ) -> Result<Option<ScenarioSet>, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.current_scenario_set(decision_id, user_id)
    }

    /// Record the user's chosen path and flip the decision to `path_chosen`.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the decision is invisible or
    /// the scenario id is absent from the current set.
    pub fn set_chosen_scenario(
        &self,
        decision_id: DecisionId,
        user_id: &str,
        scenario_id: &str,
    ) -> Result<Decision, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.set_chosen_scenario(decision_id, user_id, scenario_id, OffsetDateTime::now_utc())?;
        store.get_decision(decision_id, user_id, false)
    }

    /// Per-metric delta between two scenarios of the current set, served from
    /// the cache when present. The baseline defaults to the decision's chosen
    /// scenario, falling back to the well-known balanced one.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the decision, its scenario set,
    /// or either scenario id cannot be resolved.
    pub fn get_delta(&self, input: GetDeltaRequest) -> Result<ScenarioDelta, EngineError> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let decision = store.get_decision(input.decision_id, &input.user_id, false)?;
        let set = store
            .current_scenario_set(input.decision_id, &input.user_id)?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "no scenario set for decision: {}",
                    input.decision_id
                ))
            })?;

        let baseline_id = input
            .baseline_scenario_id
            .unwrap_or_else(|| resolve_baseline(&decision, Some(&set)).scenario_id);
        let verdict_version = decision.verdict.version;

        cached_or_compute(
            &mut store,
            input.decision_id,
            verdict_version,
            &baseline_id,
            &input.candidate_scenario_id,
            || {
                compute_scenario_delta(
                    &set,
                    verdict_version,
                    &baseline_id,
                    &input.candidate_scenario_id,
                    OffsetDateTime::now_utc(),
                )
            },
        )
    }

    /// Side-by-side summary of 2 or 3 of one user's decisions.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for an out-of-range or duplicated
    /// id list, and NotFound when any decision is invisible to the owner.
    pub fn compare_decisions(
        &self,
        input: &CompareDecisionsRequest,
    ) -> Result<Vec<DecisionCompareItem>, EngineError> {
        validate_compare_ids(&input.decision_ids)?;

        let mut store = self.open_store()?;
        store.migrate()?;

        let mut items = Vec::with_capacity(input.decision_ids.len());
        for decision_id in &input.decision_ids {
            let decision = store.get_decision(*decision_id, &input.user_id, false)?;
            let set = store.current_scenario_set(*decision_id, &input.user_id)?;
            let outcomes = store.list_outcomes(*decision_id, &input.user_id)?;
            items.push(build_compare_item(&decision, set.as_ref(), &outcomes));
        }
        Ok(items)
    }
}
