//! Apex Jobs - demo runner.
//!
//! Runs a small scenario against the job executor: grouped jobs that must
//! serialize, a disjoint group that runs alongside them, and an interactive
//! job whose question is answered by an observer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use apex_jobs::{
    config::Config,
    jobs::{
        Job, JobContext, JobError, JobEvent, JobExecutor, JobGroupPath, JobHandler, JobRegistry,
        JobResult, Question, Request,
    },
    telemetry::{init_logging, LogFormat},
};

/// Apex Jobs - in-process job orchestration
#[derive(Parser)]
#[command(
    name = "apex-jobs",
    version,
    about = "Apex Jobs - grouped job execution with interactive questions",
    propagate_version = true
)]
struct Cli {
    /// Configuration file (any format supported by the `config` crate)
    #[arg(short, long, global = true, env = "APEX_JOBS_CONFIG")]
    config: Option<String>,

    /// Override the configured log format
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo scenario
    Demo(DemoArgs),

    /// Show the pool policy resolved for a group path
    Resolve {
        /// Group path, `/`-separated
        path: String,
    },
}

#[derive(Args)]
struct DemoArgs {
    /// How long each grouped job works
    #[arg(long, default_value_t = 200)]
    work_ms: u64,

    /// Answer given to the interactive job
    #[arg(long, default_value = "yes")]
    answer: String,

    /// Do not answer the interactive job; it times out instead
    #[arg(long)]
    no_answer: bool,
}

fn parse_log_format(raw: &str) -> std::result::Result<LogFormat, String> {
    match raw {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        "compact" => Ok(LogFormat::Compact),
        other => Err(format!("unknown log format: {}", other)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Demo jobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Works for `millis` inside the group given by the `group` property.
#[derive(Default)]
struct WorkJob;

#[async_trait]
impl JobHandler for WorkJob {
    fn job_type(&self) -> &str {
        "work"
    }

    fn group_path(&self, request: &Request) -> Option<JobGroupPath> {
        let group: String = request.property("group").ok()??;
        Some(JobGroupPath::new(group.split('/')))
    }

    async fn run_internal(&self, ctx: &JobContext) -> JobResult {
        let millis: u64 = ctx.request().property("millis")?.unwrap_or(100);
        ctx.set_cancelable(true);

        for step in 1..=4u8 {
            ctx.check_canceled()?;
            tokio::time::sleep(Duration::from_millis(millis / 4)).await;
            ctx.report_progress(step * 25, Some(format!("step {}", step)));
        }
        ctx.log_info("work done");
        Ok(())
    }
}

/// Asks for confirmation before doing anything.
#[derive(Default)]
struct ConfirmJob;

#[async_trait]
impl JobHandler for ConfirmJob {
    fn job_type(&self) -> &str {
        "confirm"
    }

    async fn run_internal(&self, ctx: &JobContext) -> JobResult {
        let question = Question::new("confirm", json!({ "prompt": "Proceed with upgrade?" }));
        let answered = ctx.ask_timeout(question.clone(), Duration::from_millis(500)).await?;

        if !answered {
            ctx.log_warn("no answer, skipping upgrade");
            return Err(JobError::new("confirmation timed out").with_code("timeout"));
        }

        match question.answer() {
            Some(answer) if answer == "yes" => {
                ctx.log_info("confirmed");
                Ok(())
            }
            other => Err(JobError::new("upgrade declined").with_context(other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging)?;

    let registry = Arc::new(JobRegistry::new());
    registry.register::<WorkJob>();
    registry.register::<ConfirmJob>();
    let executor = JobExecutor::from_config(&config.executor, registry);

    match cli.command {
        Commands::Demo(args) => run_demo(&executor, args).await?,
        Commands::Resolve { path } => {
            let path = JobGroupPath::new(path.split('/').filter(|s| !s.is_empty()));
            let initializer = executor.initializers().get_grouped_job_initializer(&path);
            println!(
                "{}: pool_size={} keep_alive={}ms",
                path,
                initializer.pool_size(),
                initializer.keep_alive_millis()
            );
        }
    }

    Ok(())
}

async fn run_demo(executor: &JobExecutor, args: DemoArgs) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting demo");

    if !args.no_answer {
        let answer = args.answer.clone();
        executor.observation().add_observer(Arc::new(move |event: &JobEvent| {
            if let JobEvent::QuestionAsked { status, question } = event {
                if question.kind() == "confirm" {
                    question.set_answer(json!(answer));
                    status.answered();
                }
            }
        }));
    }

    let work = |id: &str, group: &str| {
        Request::builder()
            .id(vec!["demo", id])
            .property("group", group)
            .property("millis", args.work_ms)
            .build()
    };

    let jobs: Vec<Job> = vec![
        executor.execute("work", work("app", "install/app"))?,
        executor.execute("work", work("all", "install"))?,
        executor.execute("work", work("scan", "scan"))?,
        executor.execute(
            "confirm",
            Request::builder().id(vec!["demo", "confirm"]).interactive(true).build(),
        )?,
    ];

    println!(
        "scheduled {} jobs ({} queued behind a conflicting group)",
        jobs.len(),
        executor.queued_jobs().len()
    );

    executor.join_all().await;
    executor.shutdown();

    for job in &jobs {
        let status = job.status();
        let outcome = match status.error() {
            None => "succeeded".to_string(),
            Some(error) => format!("failed: {}", error),
        };
        println!(
            "{:<14} {:<8} {:<12} started {} finished {}  {}",
            status.display_id(),
            job.job_type(),
            job.group_path().map(ToString::to_string).unwrap_or_else(|| "-".into()),
            status.start_date().map(|d| d.format("%H:%M:%S%.3f").to_string()).unwrap_or_default(),
            status.end_date().map(|d| d.format("%H:%M:%S%.3f").to_string()).unwrap_or_default(),
            outcome
        );
    }

    Ok(())
}
