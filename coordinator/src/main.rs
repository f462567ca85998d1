use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config_manager::CoordinatorConfig;
use coordinator::{build, serve};
use tracing_subscriber::EnvFilter;
use workflow_coordinator::types::{ParamValue, Parameters, Priority, QualityPreference, QualityTier, SubscriptionTier};
use workflow_coordinator::{SubmitOutcome, TaskSubmission};

#[derive(Parser)]
#[command(name = "coordinator", version, about = "ML/compute workflow coordinator")]
struct Cli {
    /// Optional TOML file layered over the compiled-in defaults and env vars.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator: all scheduling and autoscaling loops, until Ctrl+C.
    Serve,
    /// Submit a single task and print the outcome (cache hit or enqueued id).
    Submit {
        task_type: String,
        #[arg(long, value_enum, default_value_t = CliPriority::Medium)]
        priority: CliPriority,
        /// JSON object of request parameters, e.g. '{"image-count": 5}'.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, value_enum)]
        tier: Option<CliTier>,
        #[arg(long, value_enum)]
        quality_preference: Option<CliQualityPreference>,
        #[arg(long, value_enum)]
        quality_target: Option<CliTier>,
    },
    /// Print the current state of a task.
    Status { task_id: String },
    /// Cancel a task; idempotent.
    Cancel { task_id: String },
    /// Print the current metrics scrape text.
    Metrics,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliPriority {
    High,
    Medium,
    Low,
    Batch,
}

impl From<CliPriority> for Priority {
    fn from(p: CliPriority) -> Self {
        match p {
            CliPriority::High => Priority::High,
            CliPriority::Medium => Priority::Medium,
            CliPriority::Low => Priority::Low,
            CliPriority::Batch => Priority::Batch,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliTier {
    Free,
    Standard,
    Premium,
}

impl From<CliTier> for SubscriptionTier {
    fn from(t: CliTier) -> Self {
        match t {
            CliTier::Free => SubscriptionTier::Free,
            CliTier::Standard => SubscriptionTier::Standard,
            CliTier::Premium => SubscriptionTier::Premium,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliQualityPreference {
    Quality,
    Speed,
    Balanced,
}

impl From<CliQualityPreference> for QualityPreference {
    fn from(p: CliQualityPreference) -> Self {
        match p {
            CliQualityPreference::Quality => QualityPreference::Quality,
            CliQualityPreference::Speed => QualityPreference::Speed,
            CliQualityPreference::Balanced => QualityPreference::Balanced,
        }
    }
}

/// `--tier`/`--quality-target` overload `CliTier`'s variants for the quality
/// tier CLI flag too (`free`/`standard`/`premium` have no meaning there, but
/// `clap`'s derive doesn't let two enums share variant names cleanly, so the
/// quality-target flag is parsed through its own small mapping instead).
fn quality_tier_from_flag(tier: CliTier) -> QualityTier {
    match tier {
        CliTier::Free => QualityTier::Low,
        CliTier::Standard => QualityTier::Medium,
        CliTier::Premium => QualityTier::High,
    }
}

fn json_to_parameters(value: serde_json::Value) -> Result<Parameters> {
    match json_to_param_value(value) {
        ParamValue::Map(map) => Ok(map),
        _ => anyhow::bail!("--params must be a JSON object"),
    }
}

fn json_to_param_value(value: serde_json::Value) -> ParamValue {
    match value {
        serde_json::Value::Null => ParamValue::Null,
        serde_json::Value::Bool(b) => ParamValue::Bool(b),
        serde_json::Value::Number(n) => ParamValue::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => ParamValue::String(s),
        serde_json::Value::Array(items) => ParamValue::List(items.into_iter().map(json_to_param_value).collect()),
        serde_json::Value::Object(map) => {
            ParamValue::Map(map.into_iter().map(|(k, v)| (k, json_to_param_value(v))).collect::<BTreeMap<_, _>>())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CoordinatorConfig::load(cli.config.as_deref()).context("load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Commands::Serve => {
            let app = build(config).await?;
            serve(app).await
        }
        Commands::Submit { task_type, priority, params, user, tier, quality_preference, quality_target } => {
            let app = build(config).await?;
            let parameters = json_to_parameters(serde_json::from_str(&params).context("parse --params as JSON")?)?;
            let outcome = app
                .manager
                .submit_task(TaskSubmission {
                    task_type,
                    parameters,
                    priority: priority.into(),
                    user_id: user,
                    subscription_tier: tier.map(Into::into),
                    quality_preference: quality_preference.map(Into::into),
                    quality_target: quality_target.map(quality_tier_from_flag),
                })
                .await?;
            match outcome {
                SubmitOutcome::CacheHit { workflow_id } => println!("cache hit: workflow {workflow_id}"),
                SubmitOutcome::Enqueued { task_id } => println!("enqueued: task {task_id}"),
            }
            Ok(())
        }
        Commands::Status { task_id } => {
            let app = build(config).await?;
            match app.manager.get_task(&task_id).await? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => println!("task {task_id} not found"),
            }
            Ok(())
        }
        Commands::Cancel { task_id } => {
            let app = build(config).await?;
            let cancelled = app.manager.cancel_task(&task_id).await?;
            println!("{}", if cancelled { "cancelled" } else { "already terminal" });
            Ok(())
        }
        Commands::Metrics => {
            let app = build(config).await?;
            print!("{}", app.metrics.render()?);
            Ok(())
        }
    }
}
