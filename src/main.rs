use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use humaneval_harness::config::{Config, DEBUG_NUM_EXAMPLES};
use humaneval_harness::evaluation::{resolve_evals, EvalKind, Evaluator};
use humaneval_harness::report::{self, ReportSet, RunReport};
use humaneval_harness::sampler::chat_completion::OPENAI_SYSTEM_MESSAGE_API;
use humaneval_harness::sampler::{ChatCompletionSampler, Sampler};
use humaneval_harness::sandbox::Sandbox;
use humaneval_harness::task::{load_task_set, DatasetSource, TaskSet};

#[derive(Parser, Debug)]
#[command(name = "humaneval-harness")]
#[command(author, version, about = "Run HumanEval against chat-completion models", long_about = None)]
struct Cli {
    /// Model to evaluate; repeat to evaluate several
    #[arg(short, long)]
    model: Vec<String>,

    /// Chat-completions base URL (overrides OPENAI_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Environment variable holding the API key
    #[arg(long)]
    api_key_env: Option<String>,

    /// Print the configured models and exit
    #[arg(long)]
    list_models: bool,

    /// Evals to run, comma separated or repeated
    #[arg(short, long = "eval", value_delimiter = ',', default_value = "humaneval")]
    evals: Vec<String>,

    /// Quick run on a small fixed subset of tasks
    #[arg(long)]
    debug: bool,

    /// Number of tasks to evaluate
    #[arg(long)]
    examples: Option<usize>,

    /// Dataset path or URL (overrides HUMANEVAL_DATASET)
    #[arg(long)]
    dataset: Option<String>,

    #[arg(long)]
    samples_per_task: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-sample sandbox timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Directory for results.json and sample logs
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write every graded sample to a JSONL file
    #[arg(long)]
    log_samples: bool,
}

impl Cli {
    fn apply(&self, mut config: Config) -> Config {
        if let Some(ref var) = self.api_key_env {
            config = config.with_api_key_env(var);
        }
        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
        }
        if let Some(ref dataset) = self.dataset {
            config.dataset = Some(dataset.clone());
        }
        if let Some(n) = self.samples_per_task {
            config.samples_per_task = n;
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(secs) = self.timeout_secs {
            config.sandbox_timeout_secs = secs;
        }
        if let Some(ref dir) = self.output {
            config.output_dir = dir.clone();
        }
        if let Some(first) = self.model.first() {
            config.model = first.clone();
        }
        config
    }

    fn models(&self, config: &Config) -> Vec<String> {
        if self.model.is_empty() {
            vec![config.model.clone()]
        } else {
            self.model.clone()
        }
    }

    fn num_examples(&self) -> Option<usize> {
        match (self.examples, self.debug) {
            (Some(n), _) => Some(n),
            (None, true) => Some(DEBUG_NUM_EXAMPLES),
            (None, false) => None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("humaneval_harness=info".parse().expect("static directive")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.apply(Config::from_env());
    let models = cli.models(&config);

    if cli.list_models {
        for model in &models {
            println!("{}", model);
        }
        return Ok(());
    }

    let evals = resolve_evals(&cli.evals[..])?;
    config.validate()?;
    config.print_banner();

    // Every task set is loaded before the first request goes out.
    let num_examples = cli.num_examples();
    let mut task_sets: Vec<(EvalKind, TaskSet)> = Vec::with_capacity(evals.len());
    for eval in evals {
        let source = config
            .dataset
            .as_deref()
            .map(DatasetSource::parse)
            .unwrap_or_else(|| eval.default_dataset());
        let tasks = load_task_set(&source)
            .await
            .with_context(|| format!("Failed to load dataset for {}", eval))?
            .subsample(num_examples);
        task_sets.push((eval, tasks));
    }

    let sandbox = Arc::new(Sandbox::new(config.sandbox_config()));
    let mut reports = ReportSet::new();

    // Finished (model, eval) reports are written even when a later pair aborts.
    let outcome = evaluate_all(&cli, &config, &models, &task_sets, sandbox, &mut reports).await;
    let path = reports.write_after(&config.output_dir, outcome)?;
    println!("{}", serde_json::to_string_pretty(&reports.to_json())?);
    info!("Results written to {}", path.display());
    Ok(())
}

async fn evaluate_all(
    cli: &Cli,
    config: &Config,
    models: &[String],
    task_sets: &[(EvalKind, TaskSet)],
    sandbox: Arc<Sandbox>,
    reports: &mut ReportSet,
) -> Result<()> {
    for model in models {
        let sampler: Arc<dyn Sampler> = Arc::new(
            ChatCompletionSampler::new(model.clone(), &config.base_url, config.sampler_timeout())?
                .with_api_key(config.api_key.clone())
                .with_system_message(OPENAI_SYSTEM_MESSAGE_API)
                .with_temperature(config.temperature)
                .with_retry_policy(config.retry_policy()),
        );

        for (eval, tasks) in task_sets {
            info!(model = %model, eval = %eval, tasks = tasks.len(), "Running eval");
            let evaluator = Evaluator::new(
                config.eval_config(cli.log_samples),
                eval.task_definition(),
                sandbox.clone(),
            )?;
            let result = evaluator
                .run(tasks, sampler.clone())
                .await
                .with_context(|| format!("{} on {} aborted", eval, model))?;

            if cli.log_samples {
                report::write_samples(&config.output_dir, eval.name(), model, &result.samples)?;
            }

            let run_report = RunReport::new(
                model.clone(),
                eval.name(),
                &result,
                config.samples_per_task,
                tasks.fingerprint(),
            );
            println!("{}", run_report.summary_line());
            reports.push(run_report);
        }
    }
    Ok(())
}
