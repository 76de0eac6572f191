use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use agentprobe::{
    evaluate_run, load_scenario, load_scenarios, DetectionEngine, HarnessConfig, LLMProvider,
    ModelSettings, PatternHistoryStore, RunArtifact, RunEvaluation, Scenario, ScriptedProvider,
    SuiteJob, SuiteRunner,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentprobe")]
#[command(about = "Run scripted behavioral scenarios against a model and grade the transcripts")]
struct Cli {
    /// Harness configuration (YAML). Environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scenarios with scripted model replies, then grade and record them
    Run {
        /// Scenario file or directory of scenarios
        #[arg(short, long)]
        scenario: PathBuf,

        /// Script file, or a directory holding `<scenario id>.yaml` scripts
        #[arg(long)]
        script: PathBuf,

        #[arg(long, default_value = "scripted-model")]
        model: String,

        #[arg(long)]
        max_turns: Option<usize>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        max_tokens: Option<u32>,

        /// Do not update the pattern history
        #[arg(long)]
        no_calibration: bool,
    },
    /// Grade an existing run artifact
    Grade {
        #[arg(short, long)]
        scenario: PathBuf,

        #[arg(short, long)]
        artifact: PathBuf,

        /// Record the resulting observations into the pattern history
        #[arg(long)]
        record: bool,
    },
    /// Show recorded per-pattern statistics
    History {
        /// Only entries of this clause type
        #[arg(long)]
        clause_type: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,agentprobe=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = HarnessConfig::load(cli.config.as_deref())?;
    let engine = Arc::new(DetectionEngine::new().with_macros(config.macro_table()));

    let clean = match cli.command {
        Command::Run {
            scenario,
            script,
            model,
            max_turns,
            temperature,
            seed,
            max_tokens,
            no_calibration,
        } => {
            let mut settings = ModelSettings::new(model);
            settings.temperature = temperature;
            settings.seed = seed;
            settings.max_tokens = max_tokens;
            settings.timeout_ms = config.model_timeout_ms;
            let record = config.record_calibration && !no_calibration;
            run(&config, engine, &scenario, &script, settings, max_turns, record).await?
        }
        Command::Grade {
            scenario,
            artifact,
            record,
        } => {
            let scenario = load_scenario(&scenario)?;
            let artifact = RunArtifact::from_json_file(&artifact)?;
            let store = config.history_store();
            let evaluation = grade(&engine, &store, &scenario, &artifact, record)?;
            println!("{}", serde_json::to_string_pretty(&evaluation)?);
            evaluation.all_passed()
        }
        Command::History { clause_type, limit } => {
            history(&config.history_store(), clause_type.as_deref(), limit)?;
            true
        }
    };

    if !clean {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(
    config: &HarnessConfig,
    engine: Arc<DetectionEngine>,
    scenario_path: &Path,
    script_path: &Path,
    settings: ModelSettings,
    max_turns: Option<usize>,
    record: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let scenarios = load_scenarios(scenario_path)?;
    let mut jobs = Vec::with_capacity(scenarios.len());
    let mut by_id = std::collections::HashMap::new();
    for scenario in scenarios {
        let script = script_for(script_path, &scenario)?;
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider::from_path(&script)?);
        let scenario = Arc::new(scenario);
        by_id.insert(scenario.id.clone(), Arc::clone(&scenario));
        jobs.push(SuiteJob::new(
            provider.name(),
            provider,
            settings.clone(),
            scenario,
        ));
    }

    let mut runner = SuiteRunner::new(max_turns.unwrap_or(config.default_max_turns))
        .with_default_limit(config.default_concurrency)
        .with_engine(Arc::clone(&engine));
    for (key, limit) in &config.provider_concurrency {
        runner = runner.with_limit(key.clone(), *limit);
    }

    let store = config.history_store();
    let runs_dir = config.runs_dir();
    let mut clean = true;
    for outcome in runner.run(jobs).await {
        let artifact = outcome.artifact;
        let path = artifact.write_to_dir(&runs_dir)?;
        let Some(scenario) = by_id.get(&artifact.scenario_id) else {
            continue;
        };
        let evaluation = grade(&engine, &store, scenario, &artifact, record)?;
        evaluation.write_to_dir(&runs_dir)?;

        let failed: Vec<_> = evaluation.failed().map(|c| c.id.as_str()).collect();
        println!(
            "{} [{}] turns={} tool_calls={} blocked={} termination={:?} failed={:?} unsupported={}",
            artifact.scenario_id,
            artifact.run_id,
            artifact.summary.turns,
            artifact.summary.tool_calls,
            artifact.summary.blocked_tool_calls,
            artifact.summary.termination,
            failed,
            evaluation.unsupported.clauses.len(),
        );
        if let Some(error) = &artifact.error {
            println!("  model error: {error}");
        }
        info!(artifact = %path.display(), "run written");
        clean &= evaluation.all_passed();
    }
    Ok(clean)
}

/// A single script file serves a single scenario; a directory is searched for
/// `<scenario id>.{yaml,yml,json}`.
fn script_for(
    script_path: &Path,
    scenario: &Scenario,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if !script_path.is_dir() {
        return Ok(script_path.to_path_buf());
    }
    ["yaml", "yml", "json"]
        .iter()
        .map(|ext| script_path.join(format!("{}.{ext}", scenario.id)))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            format!(
                "no script for scenario {} in {}",
                scenario.id,
                script_path.display()
            )
            .into()
        })
}

fn grade(
    engine: &DetectionEngine,
    store: &PatternHistoryStore,
    scenario: &Scenario,
    artifact: &RunArtifact,
    record: bool,
) -> Result<RunEvaluation, Box<dyn std::error::Error>> {
    let history = store.snapshot()?;
    let evaluation = evaluate_run(engine, scenario, artifact, &history);
    if record && !evaluation.observations.is_empty() {
        let recorded = store.record_observations(
            &evaluation.observations,
            &artifact.run_id,
            &artifact.scenario_id,
        );
        if let Err(err) = recorded {
            warn!(error = %err, "pattern history not updated");
        }
    }
    Ok(evaluation)
}

fn history(
    store: &PatternHistoryStore,
    clause_type: Option<&str>,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let history = store.load()?;
    let mut entries: Vec<_> = history
        .entries
        .values()
        .filter(|entry| clause_type.map_or(true, |t| entry.clause_type == t))
        .collect();
    entries.sort_by(|a, b| {
        b.false_positive_rate
            .total_cmp(&a.false_positive_rate)
            .then(b.total_evaluations.cmp(&a.total_evaluations))
    });

    println!(
        "{:<32} {:>6} {:>6} {:>8} {:>6}  pattern",
        "key", "evals", "match", "accuracy", "fpr"
    );
    for entry in entries.into_iter().take(limit) {
        println!(
            "{:<32} {:>6} {:>6} {:>8.3} {:>6.3}  {}",
            entry.key,
            entry.total_evaluations,
            entry.match_count,
            entry.accuracy,
            entry.false_positive_rate,
            entry.pattern
        );
    }
    println!(
        "{} patterns, {} recent observations",
        history.entries.len(),
        history.observations.len()
    );
    Ok(())
}
