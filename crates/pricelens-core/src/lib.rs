use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse a canonical ULID string into this identifier.
            ///
            /// # Errors
            /// Returns [`EngineError::Validation`] when the input is not a valid ULID.
            pub fn parse(value: &str) -> Result<Self, EngineError> {
                Ulid::from_string(value).map(Self).map_err(|err| {
                    EngineError::Validation(format!(concat!("invalid ", $label, " id: {}"), err))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(DecisionId, "decision");
ulid_id!(OutcomeId, "outcome");
ulid_id!(ScenarioSetId, "scenario set");
ulid_id!(StatusEventId, "status event");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Proposed,
    InReview,
    Approved,
    Rejected,
    Implemented,
    RolledBack,
}

impl DecisionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Implemented => "implemented",
            Self::RolledBack => "rolled_back",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proposed" => Some(Self::Proposed),
            "in_review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "implemented" => Some(Self::Implemented),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Rejections and rollbacks always carry an operator-supplied reason.
    #[must_use]
    pub fn requires_reason(self) -> bool {
        matches!(self, Self::Rejected | Self::RolledBack)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Exploring,
    PathChosen,
}

impl EpisodeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exploring => "exploring",
            Self::PathChosen => "path_chosen",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exploring" => Some(Self::Exploring),
            "path_chosen" => Some(Self::PathChosen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Pending,
    InProgress,
    Achieved,
    Missed,
}

impl OutcomeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Achieved => "achieved",
            Self::Missed => "missed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "achieved" => Some(Self::Achieved),
            "missed" => Some(Self::Missed),
            _ => None,
        }
    }
}

/// Closed set of measurable metric kinds. Free-form metric names are folded
/// into `Other` at the boundary so validation stays exhaustive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Revenue,
    Churn,
    Activation,
    Retention,
    Pricing,
    Other,
}

impl MetricKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revenue => "revenue",
            Self::Churn => "churn",
            Self::Activation => "activation",
            Self::Retention => "retention",
            Self::Pricing => "pricing",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "revenue" => Some(Self::Revenue),
            "churn" => Some(Self::Churn),
            "activation" => Some(Self::Activation),
            "retention" => Some(Self::Retention),
            "pricing" => Some(Self::Pricing),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionEntry<T> {
    pub version: u32,
    pub value: T,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: String,
}

/// Append-only versioning primitive shared by decision context and verdict.
///
/// `version` always equals `history.len()`, and history entries are numbered
/// `1..=version` in insertion order. Prior entries are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedField<T> {
    pub current: Option<T>,
    pub version: u32,
    pub history: Vec<VersionEntry<T>>,
}

impl<T> Default for VersionedField<T> {
    fn default() -> Self {
        Self { current: None, version: 0, history: Vec::new() }
    }
}

impl<T: Clone> VersionedField<T> {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append one new version: bump the counter by exactly 1, replace the
    /// current value, and push a history entry.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when `actor` is blank.
    pub fn append(
        &mut self,
        value: T,
        actor: &str,
        at: OffsetDateTime,
    ) -> Result<VersionEntry<T>, EngineError> {
        if actor.trim().is_empty() {
            return Err(EngineError::Validation(
                "version append requires a non-empty actor".to_string(),
            ));
        }

        self.version += 1;
        let entry = VersionEntry {
            version: self.version,
            value: value.clone(),
            created_at: at,
            created_by: actor.to_string(),
        };
        self.current = Some(value);
        self.history.push(entry.clone());
        Ok(entry)
    }

    /// Check the counter/history invariant: `version == history.len()` and
    /// entries are numbered `1..=version` in order.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        if self.version as usize != self.history.len() {
            return false;
        }
        self.history
            .iter()
            .enumerate()
            .all(|(index, entry)| entry.version as usize == index + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub event_id: StatusEventId,
    pub status: DecisionStatus,
    pub reason: Option<String>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub decision_id: DecisionId,
    pub user_id: String,
    pub company_name: String,
    pub website_url: String,
    pub context: VersionedField<Value>,
    pub verdict: VersionedField<Value>,
    pub verdict_model_meta: Option<Value>,
    pub status: DecisionStatus,
    pub status_events: Vec<StatusEvent>,
    pub rejection_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub implemented_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rollback_at: Option<OffsetDateTime>,
    pub rollback_reason: Option<String>,
    pub episode_status: EpisodeStatus,
    pub scenario_set_id: Option<ScenarioSetId>,
    pub chosen_scenario_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub chosen_scenario_at: Option<OffsetDateTime>,
    pub is_deleted: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Decision {
    #[must_use]
    pub fn new(
        user_id: String,
        company_name: String,
        website_url: String,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            decision_id: DecisionId::new(),
            user_id,
            company_name,
            website_url,
            context: VersionedField::empty(),
            verdict: VersionedField::empty(),
            verdict_model_meta: None,
            status: DecisionStatus::Proposed,
            status_events: Vec::new(),
            rejection_reason: None,
            implemented_at: None,
            rollback_at: None,
            rollback_reason: None,
            episode_status: EpisodeStatus::Exploring,
            scenario_set_id: None,
            chosen_scenario_id: None,
            chosen_scenario_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate identity fields and the version-counter invariants.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when ownership fields are blank or
    /// a versioned sub-document disagrees with its history.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.user_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "decision MUST be owned by a non-empty user_id".to_string(),
            ));
        }
        if self.website_url.trim().is_empty() {
            return Err(EngineError::Validation("website_url MUST be provided".to_string()));
        }
        if !self.context.is_consistent() {
            return Err(EngineError::Validation(
                "context_version MUST equal the context history length".to_string(),
            ));
        }
        if !self.verdict.is_consistent() {
            return Err(EngineError::Validation(
                "verdict_version MUST equal the verdict history length".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub new_status: DecisionStatus,
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub implemented_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rollback_at: Option<OffsetDateTime>,
}

impl StatusChange {
    /// Check the hard transition contract. The status graph is deliberately
    /// permissive; only the reason requirement is enforced.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when a `rejected`/`rolled_back`
    /// target is missing its reason.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.new_status.requires_reason()
            && self.reason.as_deref().map_or(true, |reason| reason.trim().is_empty())
        {
            return Err(EngineError::Validation(format!(
                "status {} requires a non-empty reason",
                self.new_status.as_str()
            )));
        }
        Ok(())
    }
}

/// Apply one validated status transition to an in-memory decision: update the
/// scalar status, record status-specific side effects, and append exactly one
/// audit event. Prior events are never touched.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the change fails the reason rule
/// or the actor is blank, and [`EngineError::NotFound`] for a soft-deleted
/// decision.
pub fn apply_status_change(
    decision: &mut Decision,
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
    if decision.is_deleted {
        return Err(EngineError::NotFound(format!(
            "decision not found: {}",
            decision.decision_id
        )));
    }

    decision.status = change.new_status;
    match change.new_status {
        DecisionStatus::Implemented => {
            decision.implemented_at = Some(change.implemented_at.unwrap_or(now));
        }
        DecisionStatus::Rejected => {
            decision.rejection_reason = change.reason.clone();
        }
        DecisionStatus::RolledBack => {
            decision.rollback_at = Some(change.rollback_at.unwrap_or(now));
            decision.rollback_reason = change.reason.clone();
        }
        DecisionStatus::Proposed | DecisionStatus::InReview | DecisionStatus::Approved => {}
    }

    let event = StatusEvent {
        event_id: StatusEventId::new(),
        status: change.new_status,
        reason: change.reason.clone(),
        created_by: actor.to_string(),
        created_at: now,
    };
    decision.status_events.push(event.clone());
    decision.updated_at = now;
    Ok(event)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kpi {
    pub key: String,
    pub baseline: f64,
    pub target: f64,
    pub actual: Option<f64>,
    pub delta_pct: Option<f64>,
}

impl Kpi {
    /// Set the measured value and recompute the zero-guarded delta for this
    /// KPI only.
    pub fn set_actual(&mut self, actual: f64) {
        self.actual = Some(actual);
        self.delta_pct = compute_delta_percent(self.baseline, actual);
    }
}

/// Percentage change from `before` to `after`. A zero or non-finite baseline
/// yields `None` rather than an infinity.
#[must_use]
pub fn compute_delta_percent(before: f64, after: f64) -> Option<f64> {
    if before == 0.0 || !before.is_finite() || !after.is_finite() {
        return None;
    }
    Some((after - before) / before * 100.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub outcome_id: OutcomeId,
    pub decision_id: DecisionId,
    pub user_id: String,
    pub chosen_scenario_id: Option<String>,
    pub status: OutcomeStatus,
    pub metric: MetricKind,
    pub timeframe_days: i64,
    pub kpis: Vec<Kpi>,
    pub is_correction: bool,
    pub corrects_outcome_id: Option<OutcomeId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Outcome {
    /// Validate one outcome record before persistence.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for a non-positive timeframe, blank
    /// ownership, a correction without its back-reference, or malformed KPIs.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.user_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "outcome MUST be owned by a non-empty user_id".to_string(),
            ));
        }
        if self.timeframe_days <= 0 {
            return Err(EngineError::Validation(
                "timeframe_days MUST be positive".to_string(),
            ));
        }
        if self.is_correction && self.corrects_outcome_id.is_none() {
            return Err(EngineError::Validation(
                "a correction MUST reference the outcome it corrects".to_string(),
            ));
        }
        if !self.is_correction && self.corrects_outcome_id.is_some() {
            return Err(EngineError::Validation(
                "corrects_outcome_id is only valid on a correction".to_string(),
            ));
        }
        if self.corrects_outcome_id == Some(self.outcome_id) {
            return Err(EngineError::Validation(
                "an outcome cannot correct itself".to_string(),
            ));
        }

        let mut seen_keys = BTreeSet::new();
        for kpi in &self.kpis {
            if kpi.key.trim().is_empty() {
                return Err(EngineError::Validation("kpi key MUST be non-empty".to_string()));
            }
            if !seen_keys.insert(kpi.key.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate kpi key: {}",
                    kpi.key
                )));
            }
        }
        Ok(())
    }
}

/// Resolve the single outcome a consumer should treat as current truth.
///
/// Every outcome referenced by any other outcome's `corrects_outcome_id` is
/// superseded; among the remainder the latest `created_at` wins, with the
/// outcome id as a deterministic tie-breaker. Corrections may arrive out of
/// order, so this never reduces to "last row inserted".
#[must_use]
pub fn effective_outcome(outcomes: &[Outcome]) -> Option<&Outcome> {
    let corrected: BTreeSet<OutcomeId> =
        outcomes.iter().filter_map(|outcome| outcome.corrects_outcome_id).collect();

    outcomes
        .iter()
        .filter(|outcome| !corrected.contains(&outcome.outcome_id))
        .max_by(|lhs, rhs| {
            lhs.created_at
                .cmp(&rhs.created_at)
                .then_with(|| lhs.outcome_id.cmp(&rhs.outcome_id))
        })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioMetric {
    pub metric: MetricKind,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub scenario_id: String,
    pub title: String,
    pub summary: String,
    pub metrics: Vec<ScenarioMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioSet {
    pub scenario_set_id: ScenarioSetId,
    pub decision_id: DecisionId,
    pub user_id: String,
    pub version: u32,
    pub scenarios: Vec<Scenario>,
    pub model_meta: Option<Value>,
    pub is_deleted: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ScenarioSet {
    /// Validate a generated scenario set before persistence.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the set is empty, a scenario
    /// id is blank or duplicated, or a scenario repeats a metric kind.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.version == 0 {
            return Err(EngineError::Validation(
                "scenario set version MUST be >= 1".to_string(),
            ));
        }
        if self.scenarios.is_empty() {
            return Err(EngineError::Validation(
                "scenario set MUST contain at least one scenario".to_string(),
            ));
        }

        let mut seen_ids = BTreeSet::new();
        for scenario in &self.scenarios {
            if scenario.scenario_id.trim().is_empty() {
                return Err(EngineError::Validation("scenario_id MUST be non-empty".to_string()));
            }
            if !seen_ids.insert(scenario.scenario_id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate scenario_id: {}",
                    scenario.scenario_id
                )));
            }
            let mut seen_metrics = BTreeSet::new();
            for entry in &scenario.metrics {
                if !seen_metrics.insert(entry.metric) {
                    return Err(EngineError::Validation(format!(
                        "scenario {} repeats metric {}",
                        scenario.scenario_id,
                        entry.metric.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn find_scenario(&self, scenario_id: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|scenario| scenario.scenario_id == scenario_id)
    }
}

pub const DEFAULT_BASELINE_SCENARIO_ID: &str = "balanced";
pub const DEFAULT_BASELINE_LABEL: &str = "Balanced (Recommended)";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BaselineRef {
    pub scenario_id: String,
    pub label: String,
}

/// Baseline for display and default comparison: the chosen scenario when one
/// is set, otherwise the well-known `balanced` scenario.
#[must_use]
pub fn resolve_baseline(decision: &Decision, current_set: Option<&ScenarioSet>) -> BaselineRef {
    match &decision.chosen_scenario_id {
        Some(chosen_id) => {
            let label = current_set
                .and_then(|set| set.find_scenario(chosen_id))
                .map_or_else(|| chosen_id.clone(), |scenario| scenario.title.clone());
            BaselineRef { scenario_id: chosen_id.clone(), label }
        }
        None => BaselineRef {
            scenario_id: DEFAULT_BASELINE_SCENARIO_ID.to_string(),
            label: DEFAULT_BASELINE_LABEL.to_string(),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricDelta {
    pub metric: MetricKind,
    pub baseline: f64,
    pub candidate: f64,
    pub diff: f64,
    pub delta_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioDelta {
    pub decision_id: DecisionId,
    pub verdict_version: u32,
    pub baseline_scenario_id: String,
    pub candidate_scenario_id: String,
    pub deltas: Vec<MetricDelta>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Compute per-metric differences between two named scenarios of one set.
/// Metrics present in only one scenario are skipped.
///
/// # Errors
/// Returns [`EngineError::NotFound`] when either scenario id is absent from
/// the set.
pub fn compute_scenario_delta(
    set: &ScenarioSet,
    verdict_version: u32,
    baseline_scenario_id: &str,
    candidate_scenario_id: &str,
    now: OffsetDateTime,
) -> Result<ScenarioDelta, EngineError> {
    let baseline = set
        .find_scenario(baseline_scenario_id)
        .ok_or_else(|| EngineError::NotFound(format!("scenario not found: {baseline_scenario_id}")))?;
    let candidate = set.find_scenario(candidate_scenario_id).ok_or_else(|| {
        EngineError::NotFound(format!("scenario not found: {candidate_scenario_id}"))
    })?;

    let mut deltas = Vec::new();
    for base_metric in &baseline.metrics {
        let Some(cand_metric) =
            candidate.metrics.iter().find(|entry| entry.metric == base_metric.metric)
        else {
            continue;
        };
        deltas.push(MetricDelta {
            metric: base_metric.metric,
            baseline: base_metric.value,
            candidate: cand_metric.value,
            diff: cand_metric.value - base_metric.value,
            delta_pct: compute_delta_percent(base_metric.value, cand_metric.value),
        });
    }

    Ok(ScenarioDelta {
        decision_id: set.decision_id,
        verdict_version,
        baseline_scenario_id: baseline_scenario_id.to_string(),
        candidate_scenario_id: candidate_scenario_id.to_string(),
        deltas,
        created_at: now,
    })
}

pub const COMPARE_MIN_DECISIONS: usize = 2;
pub const COMPARE_MAX_DECISIONS: usize = 3;

/// Validate the id list of a compare request: 2 to 3 distinct decisions.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the count is out of range or an
/// id repeats.
pub fn validate_compare_ids(ids: &[DecisionId]) -> Result<(), EngineError> {
    if !(COMPARE_MIN_DECISIONS..=COMPARE_MAX_DECISIONS).contains(&ids.len()) {
        return Err(EngineError::Validation(format!(
            "compare requires between {COMPARE_MIN_DECISIONS} and {COMPARE_MAX_DECISIONS} decision ids, got {}",
            ids.len()
        )));
    }
    let distinct: BTreeSet<&DecisionId> = ids.iter().collect();
    if distinct.len() != ids.len() {
        return Err(EngineError::Validation(
            "compare decision ids MUST be distinct".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionCompareItem {
    pub decision_id: DecisionId,
    pub company_name: String,
    pub status: DecisionStatus,
    pub verdict_version: u32,
    pub baseline_scenario_id: String,
    pub baseline_label: String,
    pub effective_outcome_status: Option<OutcomeStatus>,
    pub effective_outcome_metric: Option<MetricKind>,
}

#[must_use]
pub fn build_compare_item(
    decision: &Decision,
    current_set: Option<&ScenarioSet>,
    outcomes: &[Outcome],
) -> DecisionCompareItem {
    let baseline = resolve_baseline(decision, current_set);
    let effective = effective_outcome(outcomes);
    DecisionCompareItem {
        decision_id: decision.decision_id,
        company_name: decision.company_name.clone(),
        status: decision.status,
        verdict_version: decision.verdict.version,
        baseline_scenario_id: baseline.scenario_id,
        baseline_label: baseline.label,
        effective_outcome_status: effective.map(|outcome| outcome.status),
        effective_outcome_metric: effective.map(|outcome| outcome.metric),
    }
}

/// Decode an opaque JSON payload column into a typed value.
///
/// # Errors
/// Returns [`EngineError::Storage`] when the stored JSON no longer decodes.
pub fn decode_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T, EngineError> {
    serde_json::from_str(raw)
        .map_err(|err| EngineError::Storage(format!("failed to decode stored {what}: {err}")))
}

/// Encode a value for an opaque JSON column.
///
/// # Errors
/// Returns [`EngineError::Storage`] when serialization fails.
pub fn encode_json<T: Serialize>(value: &T, what: &str) -> Result<String, EngineError> {
    serde_json::to_string(value)
        .map_err(|err| EngineError::Storage(format!("failed to encode {what}: {err}")))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_decision() -> Decision {
        Decision::new(
            "user_a".to_string(),
            "Acme Analytics".to_string(),
            "https://acme.example".to_string(),
            fixture_time(),
        )
    }

    fn fixture_outcome(decision_id: DecisionId, created_at: OffsetDateTime) -> Outcome {
        Outcome {
            outcome_id: OutcomeId::new(),
            decision_id,
            user_id: "user_a".to_string(),
            chosen_scenario_id: Some("balanced".to_string()),
            status: OutcomeStatus::Pending,
            metric: MetricKind::Revenue,
            timeframe_days: 30,
            kpis: vec![Kpi {
                key: "mrr".to_string(),
                baseline: 1000.0,
                target: 1200.0,
                actual: None,
                delta_pct: None,
            }],
            is_correction: false,
            corrects_outcome_id: None,
            created_at,
            updated_at: created_at,
        }
    }

    fn fixture_set(decision_id: DecisionId) -> ScenarioSet {
        ScenarioSet {
            scenario_set_id: ScenarioSetId::new(),
            decision_id,
            user_id: "user_a".to_string(),
            version: 1,
            scenarios: vec![
                Scenario {
                    scenario_id: "balanced".to_string(),
                    title: "Balanced".to_string(),
                    summary: "Hold price, add tier".to_string(),
                    metrics: vec![
                        ScenarioMetric { metric: MetricKind::Revenue, value: 100.0 },
                        ScenarioMetric { metric: MetricKind::Churn, value: 5.0 },
                    ],
                },
                Scenario {
                    scenario_id: "aggressive".to_string(),
                    title: "Aggressive".to_string(),
                    summary: "Raise price 20%".to_string(),
                    metrics: vec![
                        ScenarioMetric { metric: MetricKind::Revenue, value: 150.0 },
                        ScenarioMetric { metric: MetricKind::Churn, value: 8.0 },
                        ScenarioMetric { metric: MetricKind::Activation, value: 2.0 },
                    ],
                },
            ],
            model_meta: None,
            is_deleted: false,
            created_at: fixture_time(),
        }
    }

    #[test]
    fn version_append_increments_by_one_and_keeps_history() {
        let mut field: VersionedField<Value> = VersionedField::empty();
        let first = match field.append(json!({"n": 1}), "writer", fixture_time()) {
            Ok(entry) => entry.version,
            Err(err) => panic!("append should succeed: {err}"),
        };
        assert_eq!(first, 1);

        if let Err(err) = field.append(json!({"n": 2}), "writer", fixture_time()) {
            panic!("append should succeed: {err}");
        }

        assert_eq!(field.version, 2);
        assert_eq!(field.history.len(), 2);
        assert_eq!(field.history[0].value, json!({"n": 1}));
        assert_eq!(field.current, Some(json!({"n": 2})));
        assert!(field.is_consistent());
    }

    #[test]
    fn version_append_returns_the_entry_it_recorded() {
        let mut field: VersionedField<Value> = VersionedField::empty();
        let entry = match field.append(json!({"draft": true}), "writer", fixture_time()) {
            Ok(entry) => entry,
            Err(err) => panic!("append should succeed: {err}"),
        };
        assert_eq!(entry.version, 1);
        assert_eq!(entry.created_by, "writer");
        assert_eq!(field.history.last(), Some(&entry));
    }

    #[test]
    fn version_append_rejects_blank_actor() {
        let mut field: VersionedField<Value> = VersionedField::empty();
        match field.append(json!(1), "  ", fixture_time()) {
            Err(EngineError::Validation(message)) => {
                assert!(message.contains("actor"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(field.version, 0);
        assert!(field.history.is_empty());
    }

    proptest! {
        #[test]
        fn version_counter_always_matches_history(values in prop::collection::vec(0_i64..1000, 0..40)) {
            let mut field: VersionedField<Value> = VersionedField::empty();
            let mut snapshots: Vec<VersionEntry<Value>> = Vec::new();

            for value in values {
                let entry = match field.append(json!(value), "prop", fixture_time()) {
                    Ok(entry) => entry,
                    Err(err) => panic!("append should succeed: {err}"),
                };
                // No earlier entry may change once a later one lands.
                prop_assert_eq!(&field.history[..snapshots.len()], &snapshots[..]);
                snapshots.push(entry);
                prop_assert!(field.is_consistent());
            }
        }
    }

    #[test]
    fn status_change_to_rejected_requires_reason() {
        let change = StatusChange {
            new_status: DecisionStatus::Rejected,
            reason: Some("  ".to_string()),
            implemented_at: None,
            rollback_at: None,
        };
        match change.validate() {
            Err(EngineError::Validation(message)) => assert!(message.contains("reason")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepted_rejection_appends_exactly_one_event() {
        let mut decision = fixture_decision();
        let change = StatusChange {
            new_status: DecisionStatus::Rejected,
            reason: Some("bad fit".to_string()),
            implemented_at: None,
            rollback_at: None,
        };
        let event = match apply_status_change(&mut decision, &change, "reviewer", fixture_time()) {
            Ok(event) => event,
            Err(err) => panic!("transition should be accepted: {err}"),
        };

        assert_eq!(decision.status, DecisionStatus::Rejected);
        assert_eq!(decision.rejection_reason.as_deref(), Some("bad fit"));
        assert_eq!(decision.status_events.len(), 1);
        assert_eq!(decision.status_events[0], event);
    }

    #[test]
    fn implemented_defaults_timestamp_and_honors_supplied_one() {
        let mut decision = fixture_decision();
        let supplied = fixture_time() + Duration::days(3);
        let change = StatusChange {
            new_status: DecisionStatus::Implemented,
            reason: None,
            implemented_at: Some(supplied),
            rollback_at: None,
        };
        if let Err(err) = apply_status_change(&mut decision, &change, "owner", fixture_time()) {
            panic!("transition should be accepted: {err}");
        }
        assert_eq!(decision.implemented_at, Some(supplied));

        let rollback = StatusChange {
            new_status: DecisionStatus::RolledBack,
            reason: Some("conversion collapsed".to_string()),
            implemented_at: None,
            rollback_at: None,
        };
        let now = fixture_time() + Duration::days(10);
        if let Err(err) = apply_status_change(&mut decision, &rollback, "owner", now) {
            panic!("transition should be accepted: {err}");
        }
        assert_eq!(decision.rollback_at, Some(now));
        assert_eq!(decision.rollback_reason.as_deref(), Some("conversion collapsed"));
        assert_eq!(decision.status_events.len(), 2);
    }

    #[test]
    fn soft_deleted_decision_rejects_transitions_as_not_found() {
        let mut decision = fixture_decision();
        decision.is_deleted = true;
        let change = StatusChange {
            new_status: DecisionStatus::Approved,
            reason: None,
            implemented_at: None,
            rollback_at: None,
        };
        match apply_status_change(&mut decision, &change, "owner", fixture_time()) {
            Err(EngineError::NotFound(_)) => {}
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn permissive_graph_allows_proposed_to_implemented() {
        let mut decision = fixture_decision();
        let change = StatusChange {
            new_status: DecisionStatus::Implemented,
            reason: None,
            implemented_at: None,
            rollback_at: None,
        };
        if let Err(err) = apply_status_change(&mut decision, &change, "owner", fixture_time()) {
            panic!("permissive graph should accept proposed -> implemented: {err}");
        }
        assert_eq!(decision.status, DecisionStatus::Implemented);
    }

    #[test]
    fn delta_percent_zero_baseline_is_unset() {
        assert_eq!(compute_delta_percent(0.0, 50.0), None);
        assert_eq!(compute_delta_percent(100.0, 150.0), Some(50.0));
        assert_eq!(compute_delta_percent(200.0, 100.0), Some(-50.0));
    }

    #[test]
    fn kpi_set_actual_recomputes_only_its_own_delta() {
        let mut kpi = Kpi {
            key: "mrr".to_string(),
            baseline: 1000.0,
            target: 1200.0,
            actual: None,
            delta_pct: None,
        };
        kpi.set_actual(1100.0);
        assert_eq!(kpi.actual, Some(1100.0));
        assert_eq!(kpi.delta_pct, Some(10.0));

        let mut zero_base =
            Kpi { key: "signups".to_string(), baseline: 0.0, target: 10.0, actual: None, delta_pct: None };
        zero_base.set_actual(50.0);
        assert_eq!(zero_base.delta_pct, None);
    }

    #[test]
    fn effective_outcome_follows_correction_chain() {
        let decision_id = DecisionId::new();
        let first = fixture_outcome(decision_id, fixture_time());
        let mut correction = fixture_outcome(decision_id, fixture_time() + Duration::hours(1));
        correction.is_correction = true;
        correction.corrects_outcome_id = Some(first.outcome_id);

        let outcomes = vec![first, correction.clone()];
        match effective_outcome(&outcomes) {
            Some(effective) => assert_eq!(effective.outcome_id, correction.outcome_id),
            None => panic!("effective outcome should exist"),
        }
    }

    #[test]
    fn out_of_order_correction_does_not_shadow_latest_uncorrected() {
        let decision_id = DecisionId::new();
        let first = fixture_outcome(decision_id, fixture_time());
        let second = fixture_outcome(decision_id, fixture_time() + Duration::hours(1));
        let mut late_correction = fixture_outcome(decision_id, fixture_time() + Duration::hours(2));
        late_correction.is_correction = true;
        late_correction.corrects_outcome_id = Some(first.outcome_id);

        // O3 corrects O1, so O2 and O3 both survive; O3 is latest.
        let outcomes = vec![first, second.clone(), late_correction.clone()];
        match effective_outcome(&outcomes) {
            Some(effective) => assert_eq!(effective.outcome_id, late_correction.outcome_id),
            None => panic!("effective outcome should exist"),
        }

        // With the correction created before O2, the latest uncorrected row wins.
        let first = fixture_outcome(decision_id, fixture_time());
        let mut early_correction =
            fixture_outcome(decision_id, fixture_time() + Duration::minutes(30));
        early_correction.is_correction = true;
        early_correction.corrects_outcome_id = Some(first.outcome_id);
        let outcomes = vec![first, second.clone(), early_correction];
        match effective_outcome(&outcomes) {
            Some(effective) => assert_eq!(effective.outcome_id, second.outcome_id),
            None => panic!("effective outcome should exist"),
        }
    }

    #[test]
    fn effective_outcome_of_empty_list_is_none() {
        assert!(effective_outcome(&[]).is_none());
    }

    #[test]
    fn outcome_validation_rejects_bad_timeframe_and_dangling_correction() {
        let decision_id = DecisionId::new();
        let mut outcome = fixture_outcome(decision_id, fixture_time());
        outcome.timeframe_days = 0;
        match outcome.validate() {
            Err(EngineError::Validation(message)) => assert!(message.contains("timeframe_days")),
            other => panic!("expected validation error, got {other:?}"),
        }

        let mut correction = fixture_outcome(decision_id, fixture_time());
        correction.is_correction = true;
        match correction.validate() {
            Err(EngineError::Validation(message)) => assert!(message.contains("correction")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn baseline_defaults_to_balanced_until_a_path_is_chosen() {
        let decision = fixture_decision();
        let set = fixture_set(decision.decision_id);

        let baseline = resolve_baseline(&decision, Some(&set));
        assert_eq!(baseline.scenario_id, DEFAULT_BASELINE_SCENARIO_ID);
        assert_eq!(baseline.label, DEFAULT_BASELINE_LABEL);

        let mut chosen = fixture_decision();
        chosen.chosen_scenario_id = Some("aggressive".to_string());
        let baseline = resolve_baseline(&chosen, Some(&set));
        assert_eq!(baseline.scenario_id, "aggressive");
        assert_eq!(baseline.label, "Aggressive");
    }

    #[test]
    fn scenario_delta_skips_metrics_missing_from_either_side() {
        let decision_id = DecisionId::new();
        let set = fixture_set(decision_id);
        let delta =
            match compute_scenario_delta(&set, 1, "balanced", "aggressive", fixture_time()) {
                Ok(delta) => delta,
                Err(err) => panic!("delta should compute: {err}"),
            };

        // Activation only exists on the candidate side.
        assert_eq!(delta.deltas.len(), 2);
        let revenue = &delta.deltas[0];
        assert_eq!(revenue.metric, MetricKind::Revenue);
        assert_eq!(revenue.diff, 50.0);
        assert_eq!(revenue.delta_pct, Some(50.0));
    }

    #[test]
    fn scenario_delta_unknown_scenario_is_not_found() {
        let set = fixture_set(DecisionId::new());
        match compute_scenario_delta(&set, 1, "balanced", "missing", fixture_time()) {
            Err(EngineError::NotFound(message)) => assert!(message.contains("missing")),
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn compare_id_count_is_bounded() {
        let one = vec![DecisionId::new()];
        match validate_compare_ids(&one) {
            Err(EngineError::Validation(_)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }

        let four = vec![DecisionId::new(), DecisionId::new(), DecisionId::new(), DecisionId::new()];
        match validate_compare_ids(&four) {
            Err(EngineError::Validation(_)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }

        let id = DecisionId::new();
        match validate_compare_ids(&[id, id]) {
            Err(EngineError::Validation(message)) => assert!(message.contains("distinct")),
            other => panic!("expected validation error, got {other:?}"),
        }

        if let Err(err) = validate_compare_ids(&[DecisionId::new(), DecisionId::new()]) {
            panic!("two distinct ids should pass: {err}");
        }
    }

    #[test]
    fn compare_item_reports_baseline_and_effective_outcome() {
        let mut decision = fixture_decision();
        decision.chosen_scenario_id = Some("aggressive".to_string());
        let set = fixture_set(decision.decision_id);
        let mut outcome = fixture_outcome(decision.decision_id, fixture_time());
        outcome.status = OutcomeStatus::Achieved;

        let item = build_compare_item(&decision, Some(&set), std::slice::from_ref(&outcome));
        assert_eq!(item.baseline_scenario_id, "aggressive");
        assert_eq!(item.baseline_label, "Aggressive");
        assert_eq!(item.effective_outcome_status, Some(OutcomeStatus::Achieved));
        assert_eq!(item.effective_outcome_metric, Some(MetricKind::Revenue));
    }

    #[test]
    fn scenario_set_validation_rejects_duplicates() {
        let mut set = fixture_set(DecisionId::new());
        set.scenarios[1].scenario_id = "balanced".to_string();
        match set.validate() {
            Err(EngineError::Validation(message)) => assert!(message.contains("duplicate")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn decision_validation_detects_counter_history_mismatch() {
        let mut decision = fixture_decision();
        decision.context.version = 3;
        match decision.validate() {
            Err(EngineError::Validation(message)) => assert!(message.contains("context_version")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
