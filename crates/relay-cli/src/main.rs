mod jobs;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::domain::TaskStatusView;
use relay_core::impls::FileTaskStore;
use relay_core::{Engine, EngineBuilder, EngineConfig, EnqueueOptions, TaskId, TaskStatus};

use crate::jobs::{
    GenerateDailyReport, GenerateInvoice, GenerateInvoicePdf, InvoiceDesk, LogEmailActivity,
    SendInvoiceEmail, UpdateCommunicationHistory, ValidateInvoiceData,
};

#[derive(Parser)]
#[command(name = "relay", version, about = "Background task scheduler demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the invoice pipeline to completion and print every task.
    Run(RunArgs),

    /// Print tasks from a durable store. The store is not modified.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    /// TOML engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Durable store; overrides `store_path` from the configuration.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Number of invoices to push through the pipeline.
    #[arg(long, default_value_t = 3)]
    invoices: u64,

    /// Directory the jobs write their artifacts to.
    #[arg(long, default_value = "relay-out")]
    out: PathBuf,

    /// How many PDF renders fail before the renderer recovers.
    #[arg(long, default_value_t = 1)]
    flaky: u32,

    /// Give up waiting for the pipeline after this many seconds.
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(long)]
    store: PathBuf,

    #[arg(long)]
    queue: Option<String>,

    /// pending, running, completed, failed or cancelled.
    #[arg(long)]
    status: Option<TaskStatus>,

    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay=info")),
        )
        .with_target(false)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Inspect(args) => inspect(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(store) = args.store {
        config.store_path = Some(store);
    }

    let desk = InvoiceDesk::new(&args.out, args.flaky);
    let engine = desk
        .register(EngineBuilder::new().with_config(config))?
        .build()
        .await
        .context("starting engine")?;
    let workers = engine.start();

    let ids = submit_pipeline(&engine, args.invoices).await?;
    info!(tasks = ids.len(), out = %args.out.display(), "pipeline submitted");

    let timeout = Duration::from_secs(args.timeout_secs);
    let finished = tokio::select! {
        res = wait_all(&engine, &ids, timeout) => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    workers.shutdown_and_join().await;

    let views = match finished {
        Some(res) => res?,
        None => {
            warn!("interrupted; pending work stays in the store");
            return Ok(());
        }
    };
    println!("{}", serde_json::to_string_pretty(&views)?);

    let counts = engine.counts(None).await?;
    info!(
        completed = counts.completed,
        failed = counts.failed,
        cancelled = counts.cancelled,
        "pipeline finished"
    );
    if counts.failed > 0 || counts.cancelled > 0 {
        bail!("{} tasks failed, {} cancelled", counts.failed, counts.cancelled);
    }
    Ok(())
}

/// Submit one pipeline per invoice plus a report over all of them.
///
/// Per invoice: generate, then validate / render / log / record history in
/// parallel, then email once all four are done.
async fn submit_pipeline(engine: &Engine, invoices: u64) -> Result<Vec<TaskId>> {
    let mut batch = engine.batch();
    let mut generated = Vec::new();
    let mut emails = Vec::new();

    for invoice_id in 1..=invoices {
        let generate = batch.add_job(
            &GenerateInvoice {
                invoice_id,
                customer_id: invoice_id % 3 + 1,
                items: Vec::new(),
                due_days: 30,
            },
            EnqueueOptions::new(),
        )?;
        let after_generate = || EnqueueOptions::new().depends_on(generate);

        let validate = batch.add_job(&ValidateInvoiceData { invoice_id }, after_generate())?;
        let pdf = batch.add_job(&GenerateInvoicePdf { invoice_id }, after_generate())?;
        let log = batch.add_job(
            &LogEmailActivity {
                invoice_id,
                recipient_email: None,
                status: "sent".into(),
            },
            after_generate(),
        )?;
        let history = batch.add_job(
            &UpdateCommunicationHistory {
                invoice_id,
                communication_type: "email".into(),
            },
            after_generate(),
        )?;
        let email = batch.add_job(
            &SendInvoiceEmail { invoice_id },
            after_generate().after([validate, pdf, log, history]),
        )?;

        generated.push(generate);
        emails.push(email);
    }

    batch.add_job(
        &GenerateDailyReport,
        EnqueueOptions::new().after(generated).after(emails),
    )?;
    Ok(batch.submit().await?)
}

async fn wait_all(engine: &Engine, ids: &[TaskId], timeout: Duration) -> Result<Vec<TaskStatusView>> {
    let mut views = Vec::with_capacity(ids.len());
    for &id in ids {
        views.push(engine.wait(id, timeout).await?);
    }
    Ok(views)
}

async fn inspect(args: InspectArgs) -> Result<()> {
    if !args.store.exists() {
        bail!("no task store at {}", args.store.display());
    }
    let records = FileTaskStore::read_snapshot(&args.store)
        .await
        .with_context(|| format!("reading {}", args.store.display()))?;

    let views: Vec<TaskStatusView> = records
        .iter()
        .filter(|r| args.queue.as_deref().is_none_or(|q| r.queue == q))
        .filter(|r| args.status.is_none_or(|s| r.status == s))
        .filter(|r| args.name.as_deref().is_none_or(|n| r.name == n))
        .map(TaskStatusView::from)
        .collect();
    println!("{}", serde_json::to_string_pretty(&views)?);
    Ok(())
}
