use crate::{
    commands::Commands,
    error::CliError,
    handler::{BatchProcessor, PassThroughHandler, load_items},
    shutdown::{ExitCode, ShutdownCoordinator},
};
use chrono::NaiveDate;
use clap::Parser;
use model::{
    core::identifiers::{BatchId, Identifier, ProcessorName},
    report::PhasePair,
};
use pipeline_core::{
    event_bus::EventBus,
    heartbeat::Heartbeater,
    metrics::Metrics,
    retry::RetryPolicy,
    settings::EngineSettings,
    state::{BatchStore, RunLedger, sled_store::SledStore},
};
use pipeline_processing::{
    breaker::CircuitBreaker,
    gate::IdempotencyGate,
    runner::{ProcessorRunner, RunOutcome},
};
use pipeline_reconcile::{
    collaborators::CountsFile, service::ReconciliationService, severity::SeverityThresholds,
};
use pipeline_runtime::{
    consolidate::DestinationConsolidator, control::ControlService, queue::InProcessQueue,
};
use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};
use tracing::{Level, info};

mod commands;
mod error;
mod handler;
mod output;
mod shutdown;

/// Phase-pair upstream name resolved against the schedule instead of a
/// warehouse phase.
const SOURCE_PHASE: &str = "schedule";

#[derive(Parser)]
#[command(name = "trellis", version = "0.1.0", about = "Pipeline reliability engine")]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Settings file path; built-in defaults apply when omitted"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    // Initialize logger
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => ExitCode::Success,
        Err(CliError::ShutdownRequested) => ExitCode::ShutdownRequested,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::GeneralError
        }
    };
    process::exit(code.as_i32());
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Start {
            processor,
            identifier,
            items,
            force,
        } => start(&settings, processor, identifier, items, force).await,
        Commands::Status { batch, json } => status(&settings, batch, json).await,
        Commands::CheckStalled => check_stalled(&settings).await,
        Commands::Reconcile {
            date,
            counts,
            pairs,
            json,
            output,
        } => reconcile(&settings, date, counts, pairs, json, output).await,
        Commands::History {
            processor,
            identifier,
            json,
        } => history(&settings, processor, identifier, json).await,
    }
}

fn load_settings(path: Option<&Path>) -> Result<EngineSettings, CliError> {
    match path {
        Some(path) => Ok(EngineSettings::load(path)?),
        None => Ok(EngineSettings::default()),
    }
}

fn open_state_store(settings: &EngineSettings) -> Result<Arc<SledStore>, CliError> {
    let path = match &settings.state_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .ok_or_else(|| CliError::Unexpected("Could not determine home directory".into()))?
            .join(".trellis/state"),
    };
    let store = SledStore::open(&path).map_err(|err| {
        CliError::Unexpected(format!(
            "Failed to open state store at {}: {err}",
            path.display()
        ))
    })?;
    Ok(Arc::new(store))
}

async fn start(
    settings: &EngineSettings,
    processor: String,
    identifier: String,
    items_path: String,
    force: bool,
) -> Result<(), CliError> {
    let store = open_state_store(settings)?;
    let bus = EventBus::new();
    let metrics = Metrics::new();

    let items = load_items(&items_path)?;
    info!(items = items.len(), "Loaded batch items");

    let queue = Arc::new(InProcessQueue::new(settings.max_redeliveries));
    let consolidator = Arc::new(DestinationConsolidator::new(store.clone()));
    let mut control = ControlService::new(
        store.clone(),
        store.clone(),
        queue,
        consolidator,
        bus.clone(),
        metrics.clone(),
        settings.stall_threshold_secs,
    );
    control.spawn_workers(
        Arc::new(PassThroughHandler),
        settings.worker_count,
        RetryPolicy::default(),
    );

    let shutdown = ShutdownCoordinator::new(control.cancel_token());
    shutdown.register_handlers();

    let gate = IdempotencyGate::new(store.clone(), bus.clone(), metrics.clone());
    let breaker = CircuitBreaker::new(
        store.clone(),
        bus.clone(),
        metrics.clone(),
        settings.failure_threshold,
        Duration::from_secs(settings.min_probe_interval_secs),
    );
    let heartbeater = Heartbeater::new(
        store.clone(),
        bus.clone(),
        Duration::from_secs(settings.heartbeat_interval_secs),
    );
    let runner = ProcessorRunner::new(
        store.clone(),
        gate,
        breaker,
        heartbeater,
        bus,
        metrics.clone(),
    );

    let name = ProcessorName::new(processor);
    let identifier = Identifier::new(identifier);
    let batch = BatchProcessor::new(name, control, items);

    let cancelled = shutdown.cancel_token();
    let outcome = tokio::select! {
        outcome = runner.run(&batch, &identifier, force) => Some(outcome),
        _ = cancelled.cancelled() => None,
    };

    batch.into_control().shutdown().await;

    let outcome = match outcome {
        Some(outcome) => outcome?,
        None => return Err(CliError::ShutdownRequested),
    };

    match outcome {
        RunOutcome::Completed(record) => output::print_run_table(&record),
        RunOutcome::Skipped { reason } => println!("Run skipped: {reason}"),
    }
    output::print_metrics(&metrics.snapshot());

    Ok(())
}

async fn status(settings: &EngineSettings, batch: String, json: bool) -> Result<(), CliError> {
    let store = open_state_store(settings)?;
    let batch_id = BatchId::new(batch);
    let record = store.batch(&batch_id).await?.ok_or_else(|| {
        CliError::Unexpected(format!("No batch '{batch_id}' in the state store"))
    })?;

    if json {
        let json = serde_json::to_string_pretty(&record).map_err(CliError::JsonSerialize)?;
        println!("{json}");
    } else {
        output::print_batch_table(&record);
    }
    Ok(())
}

async fn check_stalled(settings: &EngineSettings) -> Result<(), CliError> {
    let store = open_state_store(settings)?;
    let queue = Arc::new(InProcessQueue::new(settings.max_redeliveries));
    let consolidator = Arc::new(DestinationConsolidator::new(store.clone()));
    let control = ControlService::new(
        store.clone(),
        store.clone(),
        queue,
        consolidator,
        EventBus::new(),
        Metrics::new(),
        settings.stall_threshold_secs,
    );

    let stalled = control.check_stalled().await;
    control.shutdown().await;
    let stalled = stalled?;

    if stalled.is_empty() {
        println!("No stalled batches.");
    } else {
        println!("Force-finalized {} stalled batch(es):", stalled.len());
        for id in &stalled {
            println!("  {id}");
        }
    }
    Ok(())
}

async fn reconcile(
    settings: &EngineSettings,
    date: String,
    counts: String,
    pairs: Vec<String>,
    json: bool,
    output_path: Option<String>,
) -> Result<(), CliError> {
    let date =
        NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| CliError::InvalidDate(date))?;
    let pairs = parse_pairs(pairs)?;
    let counts = Arc::new(CountsFile::load(&counts)?);

    let service = ReconciliationService::new(
        counts.clone(),
        counts,
        pairs,
        SeverityThresholds::from_settings(settings),
        SOURCE_PHASE,
        EventBus::new(),
    );

    let report = service.reconcile(date).await;

    match output_path {
        Some(path) => output::write_report(&report, path).await?,
        None if json => {
            let json = serde_json::to_string_pretty(&report).map_err(CliError::JsonSerialize)?;
            println!("{json}");
        }
        None => output::print_report_table(&report),
    }
    Ok(())
}

fn parse_pairs(raw: Vec<String>) -> Result<Vec<PhasePair>, CliError> {
    if raw.is_empty() {
        return Ok(vec![
            PhasePair::new(SOURCE_PHASE, "staged"),
            PhasePair::new("staged", "published"),
        ]);
    }

    raw.into_iter()
        .map(|spec| {
            spec.split_once(':')
                .filter(|(up, down)| !up.is_empty() && !down.is_empty())
                .map(|(up, down)| PhasePair::new(up, down))
                .ok_or(CliError::InvalidPhasePair(spec))
        })
        .collect()
}

async fn history(
    settings: &EngineSettings,
    processor: String,
    identifier: String,
    json: bool,
) -> Result<(), CliError> {
    let store = open_state_store(settings)?;
    let name = ProcessorName::new(processor);
    let identifier = Identifier::new(identifier);
    let records = store.history(&name, &identifier).await?;

    if json {
        let json = serde_json::to_string_pretty(&records).map_err(CliError::JsonSerialize)?;
        println!("{json}");
    } else {
        output::print_history_table(&name, &identifier, &records);
    }
    Ok(())
}
