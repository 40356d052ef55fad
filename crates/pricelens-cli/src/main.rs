use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pricelens_api::{
    AddOutcomeRequest, CompareDecisionsRequest, CreateDecisionRequest, DecisionEngineApi,
    GenerateScenariosRequest, GetDeltaRequest, KpiInput, ListDecisionsRequest,
    RegenerateVerdictRequest, UpdateContextRequest, UpdateKpiActualRequest, UpdateStatusRequest,
};
use pricelens_core::{
    DecisionId, DecisionStatus, MetricKind, OutcomeId, OutcomeStatus, Scenario,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "plx")]
#[command(about = "PriceLens decision engine CLI")]
struct Cli {
    #[arg(long, default_value = "./pricelens.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Decision {
        #[command(subcommand)]
        command: Box<DecisionCommand>,
    },
    Outcome {
        #[command(subcommand)]
        command: Box<OutcomeCommand>,
    },
    Scenario {
        #[command(subcommand)]
        command: Box<ScenarioCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DecisionCommand {
    Create(DecisionCreateArgs),
    Get(DecisionGetArgs),
    List(DecisionListArgs),
    UpdateContext(UpdateContextArgs),
    RegenerateVerdict(RegenerateVerdictArgs),
    UpdateStatus(UpdateStatusArgs),
    ChooseScenario(ChooseScenarioArgs),
    Compare(CompareArgs),
    SoftDelete(DecisionRefArgs),
    HardDelete(DecisionRefArgs),
}

#[derive(Debug, Args)]
struct DecisionCreateArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    company: String,
    #[arg(long)]
    website: String,
    /// Initial decision context as a JSON object.
    #[arg(long)]
    context: Option<String>,
}

#[derive(Debug, Args)]
struct DecisionGetArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    #[arg(long, default_value_t = false)]
    include_deleted: bool,
}

#[derive(Debug, Args)]
struct DecisionListArgs {
    #[arg(long)]
    user: String,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long, default_value_t = false)]
    include_deleted: bool,
}

#[derive(Debug, Args)]
struct UpdateContextArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    /// Replacement context as a JSON object; the prior version stays in
    /// history.
    #[arg(long)]
    context: String,
}

#[derive(Debug, Args)]
struct RegenerateVerdictArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    /// New verdict payload as JSON.
    #[arg(long)]
    verdict: String,
    #[arg(long)]
    model_meta: Option<String>,
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, Args)]
struct UpdateStatusArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    status: StatusArg,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    implemented_at: Option<String>,
    #[arg(long)]
    rollback_at: Option<String>,
}

#[derive(Debug, Args)]
struct ChooseScenarioArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    #[arg(long)]
    scenario: String,
}

#[derive(Debug, Args)]
struct CompareArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "id")]
    ids: Vec<String>,
}

#[derive(Debug, Args)]
struct DecisionRefArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum OutcomeCommand {
    Add(OutcomeAddArgs),
    UpdateStatus(OutcomeStatusArgs),
    UpdateKpi(UpdateKpiArgs),
    Effective(OutcomeDecisionArgs),
    List(OutcomeDecisionArgs),
    Delete(OutcomeRefArgs),
}

#[derive(Debug, Args)]
struct OutcomeAddArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    decision: String,
    #[arg(long)]
    scenario: Option<String>,
    #[arg(long, value_enum, default_value_t = OutcomeStatusArg::Pending)]
    status: OutcomeStatusArg,
    #[arg(long, value_enum)]
    metric: MetricArg,
    #[arg(long)]
    timeframe_days: i64,
    /// KPI spec `key=baseline:target` with an optional `:actual` suffix.
    #[arg(long = "kpi")]
    kpis: Vec<String>,
    /// Record this outcome as a correction of an earlier one.
    #[arg(long)]
    corrects: Option<String>,
}

#[derive(Debug, Args)]
struct OutcomeStatusArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    status: OutcomeStatusArg,
}

#[derive(Debug, Args)]
struct UpdateKpiArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    decision: String,
    /// Target a specific outcome; defaults to the effective one.
    #[arg(long)]
    outcome: Option<String>,
    #[arg(long)]
    key: String,
    #[arg(long)]
    actual: f64,
}

#[derive(Debug, Args)]
struct OutcomeDecisionArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    decision: String,
}

#[derive(Debug, Args)]
struct OutcomeRefArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum ScenarioCommand {
    Generate(ScenarioGenerateArgs),
    Current(OutcomeDecisionArgs),
    Delta(ScenarioDeltaArgs),
}

#[derive(Debug, Args)]
struct ScenarioGenerateArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    decision: String,
    /// Scenario list as a JSON array.
    #[arg(long)]
    scenarios: String,
    #[arg(long)]
    model_meta: Option<String>,
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Args)]
struct ScenarioDeltaArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    decision: String,
    /// Defaults to the decision's resolved baseline scenario.
    #[arg(long)]
    baseline: Option<String>,
    #[arg(long)]
    candidate: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Proposed,
    InReview,
    Approved,
    Rejected,
    Implemented,
    RolledBack,
}

impl From<StatusArg> for DecisionStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Proposed => Self::Proposed,
            StatusArg::InReview => Self::InReview,
            StatusArg::Approved => Self::Approved,
            StatusArg::Rejected => Self::Rejected,
            StatusArg::Implemented => Self::Implemented,
            StatusArg::RolledBack => Self::RolledBack,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeStatusArg {
    Pending,
    InProgress,
    Achieved,
    Missed,
}

impl From<OutcomeStatusArg> for OutcomeStatus {
    fn from(value: OutcomeStatusArg) -> Self {
        match value {
            OutcomeStatusArg::Pending => Self::Pending,
            OutcomeStatusArg::InProgress => Self::InProgress,
            OutcomeStatusArg::Achieved => Self::Achieved,
            OutcomeStatusArg::Missed => Self::Missed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MetricArg {
    Revenue,
    Churn,
    Activation,
    Retention,
    Pricing,
    Other,
}

impl From<MetricArg> for MetricKind {
    fn from(value: MetricArg) -> Self {
        match value {
            MetricArg::Revenue => Self::Revenue,
            MetricArg::Churn => Self::Churn,
            MetricArg::Activation => Self::Activation,
            MetricArg::Retention => Self::Retention,
            MetricArg::Pricing => Self::Pricing,
            MetricArg::Other => Self::Other,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_serialized<T: serde::Serialize>(value: &T, what: &str) -> Result<()> {
    emit_json(serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))?)
}

fn parse_decision_id(raw: &str) -> Result<DecisionId> {
    DecisionId::parse(raw).map_err(|err| anyhow!(err))
}

fn parse_outcome_id(raw: &str) -> Result<OutcomeId> {
    OutcomeId::parse(raw).map_err(|err| anyhow!(err))
}

fn parse_json_arg(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

fn parse_optional_rfc3339(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| {
        OffsetDateTime::parse(value, &Rfc3339)
            .with_context(|| format!("invalid RFC 3339 timestamp: {value}"))
    })
    .transpose()
}

/// Parse one `key=baseline:target[:actual]` KPI spec.
fn parse_kpi_spec(raw: &str) -> Result<KpiInput> {
    let (key, numbers) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("kpi spec must look like key=baseline:target, got `{raw}`"))?;
    if key.trim().is_empty() {
        return Err(anyhow!("kpi spec has an empty key: `{raw}`"));
    }

    let parts: Vec<&str> = numbers.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(anyhow!("kpi spec must carry 2 or 3 numbers, got `{raw}`"));
    }
    let mut parsed = Vec::with_capacity(parts.len());
    for part in &parts {
        let number: f64 =
            part.parse().with_context(|| format!("invalid number `{part}` in kpi spec `{raw}`"))?;
        parsed.push(number);
    }

    Ok(KpiInput {
        key: key.to_string(),
        baseline: parsed[0],
        target: parsed[1],
        actual: parsed.get(2).copied(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = DecisionEngineApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Decision { command } => run_decision(*command, &api),
        Command::Outcome { command } => run_outcome(*command, &api),
        Command::Scenario { command } => run_scenario(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &DecisionEngineApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_serialized(&result, "migrate result")
        }
    }
}

fn run_decision(command: DecisionCommand, api: &DecisionEngineApi) -> Result<()> {
    match command {
        DecisionCommand::Create(args) => {
            let context =
                args.context.as_deref().map(|raw| parse_json_arg(raw, "context")).transpose()?;
            let decision = api.create_decision(CreateDecisionRequest {
                user_id: args.user,
                company_name: args.company,
                website_url: args.website,
                context,
            })?;
            emit_serialized(&decision, "decision")
        }
        DecisionCommand::Get(args) => {
            let decision = api.get_decision(
                parse_decision_id(&args.id)?,
                &args.user,
                args.include_deleted,
            )?;
            emit_serialized(&decision, "decision")
        }
        DecisionCommand::List(args) => {
            let decisions = api.list_decisions(&ListDecisionsRequest {
                user_id: args.user,
                status: args.status.map(DecisionStatus::from),
                include_deleted: args.include_deleted,
            })?;
            emit_json(serde_json::json!({ "decisions": decisions }))
        }
        DecisionCommand::UpdateContext(args) => {
            let decision = api.update_context(UpdateContextRequest {
                decision_id: parse_decision_id(&args.id)?,
                user_id: args.user,
                context: parse_json_arg(&args.context, "context")?,
            })?;
            emit_serialized(&decision, "decision")
        }
        DecisionCommand::RegenerateVerdict(args) => {
            let model_meta = args
                .model_meta
                .as_deref()
                .map(|raw| parse_json_arg(raw, "model_meta"))
                .transpose()?;
            let decision = api.regenerate_verdict(RegenerateVerdictRequest {
                decision_id: parse_decision_id(&args.id)?,
                user_id: args.user,
                verdict: parse_json_arg(&args.verdict, "verdict")?,
                model_meta,
                reason: args.reason,
            })?;
            emit_serialized(&decision, "decision")
        }
        DecisionCommand::UpdateStatus(args) => {
            let decision = api.update_status(UpdateStatusRequest {
                decision_id: parse_decision_id(&args.id)?,
                user_id: args.user,
                new_status: args.status.into(),
                reason: args.reason,
                implemented_at: parse_optional_rfc3339(args.implemented_at.as_deref())?,
                rollback_at: parse_optional_rfc3339(args.rollback_at.as_deref())?,
            })?;
            emit_serialized(&decision, "decision")
        }
        DecisionCommand::ChooseScenario(args) => {
            let decision = api.set_chosen_scenario(
                parse_decision_id(&args.id)?,
                &args.user,
                &args.scenario,
            )?;
            emit_serialized(&decision, "decision")
        }
        DecisionCommand::Compare(args) => {
            let decision_ids = args
                .ids
                .iter()
                .map(|raw| parse_decision_id(raw))
                .collect::<Result<Vec<_>>>()?;
            let items = api.compare_decisions(&CompareDecisionsRequest {
                user_id: args.user,
                decision_ids,
            })?;
            emit_json(serde_json::json!({ "items": items }))
        }
        DecisionCommand::SoftDelete(args) => {
            let decision_id = parse_decision_id(&args.id)?;
            api.soft_delete_decision(decision_id, &args.user)?;
            emit_json(serde_json::json!({
                "decision_id": decision_id.to_string(),
                "deleted": true
            }))
        }
        DecisionCommand::HardDelete(args) => {
            let decision_id = parse_decision_id(&args.id)?;
            api.hard_delete_decision(decision_id, &args.user)?;
            emit_json(serde_json::json!({
                "decision_id": decision_id.to_string(),
                "purged": true
            }))
        }
    }
}

fn run_outcome(command: OutcomeCommand, api: &DecisionEngineApi) -> Result<()> {
    match command {
        OutcomeCommand::Add(args) => {
            let kpis = args
                .kpis
                .iter()
                .map(|raw| parse_kpi_spec(raw))
                .collect::<Result<Vec<_>>>()?;
            let corrects_outcome_id =
                args.corrects.as_deref().map(parse_outcome_id).transpose()?;
            let outcome = api.add_outcome(AddOutcomeRequest {
                decision_id: parse_decision_id(&args.decision)?,
                user_id: args.user,
                chosen_scenario_id: args.scenario,
                status: args.status.into(),
                metric: args.metric.into(),
                timeframe_days: args.timeframe_days,
                kpis,
                is_correction: corrects_outcome_id.is_some(),
                corrects_outcome_id,
            })?;
            emit_serialized(&outcome, "outcome")
        }
        OutcomeCommand::UpdateStatus(args) => {
            let outcome = api.update_outcome_status(
                parse_outcome_id(&args.id)?,
                &args.user,
                args.status.into(),
            )?;
            emit_serialized(&outcome, "outcome")
        }
        OutcomeCommand::UpdateKpi(args) => {
            let outcome = api.update_kpi_actual(UpdateKpiActualRequest {
                decision_id: parse_decision_id(&args.decision)?,
                user_id: args.user,
                outcome_id: args.outcome.as_deref().map(parse_outcome_id).transpose()?,
                kpi_key: args.key,
                actual: args.actual,
            })?;
            emit_serialized(&outcome, "outcome")
        }
        OutcomeCommand::Effective(args) => {
            let effective =
                api.get_effective_outcome(parse_decision_id(&args.decision)?, &args.user)?;
            emit_json(serde_json::json!({ "effective": effective }))
        }
        OutcomeCommand::List(args) => {
            let outcomes = api.list_outcomes(parse_decision_id(&args.decision)?, &args.user)?;
            emit_json(serde_json::json!({ "outcomes": outcomes }))
        }
        OutcomeCommand::Delete(args) => {
            let outcome_id = parse_outcome_id(&args.id)?;
            api.delete_outcome(outcome_id, &args.user)?;
            emit_json(serde_json::json!({
                "outcome_id": outcome_id.to_string(),
                "deleted": true
            }))
        }
    }
}

fn run_scenario(command: ScenarioCommand, api: &DecisionEngineApi) -> Result<()> {
    match command {
        ScenarioCommand::Generate(args) => {
            let scenarios: Vec<Scenario> = serde_json::from_str(&args.scenarios)
                .context("scenarios is not a valid JSON scenario array")?;
            let model_meta = args
                .model_meta
                .as_deref()
                .map(|raw| parse_json_arg(raw, "model_meta"))
                .transpose()?;
            let set = api.generate_scenarios(GenerateScenariosRequest {
                decision_id: parse_decision_id(&args.decision)?,
                user_id: args.user,
                scenarios,
                model_meta,
                force: args.force,
            })?;
            emit_serialized(&set, "scenario set")
        }
        ScenarioCommand::Current(args) => {
            let set = api.current_scenarios(parse_decision_id(&args.decision)?, &args.user)?;
            emit_json(serde_json::json!({ "scenario_set": set }))
        }
        ScenarioCommand::Delta(args) => {
            let delta = api.get_delta(GetDeltaRequest {
                decision_id: parse_decision_id(&args.decision)?,
                user_id: args.user,
                baseline_scenario_id: args.baseline,
                candidate_scenario_id: args.candidate,
            })?;
            emit_serialized(&delta, "scenario delta")
        }
    }
}
