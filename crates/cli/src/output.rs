use crate::error::CliError;
use model::{
    core::identifiers::{Identifier, ProcessorName},
    records::{batch::BatchRecord, run::RunRecord},
    report::ReconciliationReport,
};
use pipeline_core::metrics::MetricsSnapshot;

pub fn print_run_table(record: &RunRecord) {
    println!("Run '{}':", record.run_id);
    println!("-----------------------------");
    println!("{:<16} {}", "Processor", record.processor);
    println!("{:<16} {}", "Identifier", record.identifier);
    println!("{:<16} {:?}", "Status", record.status);
    println!("{:<16} {}", "Records written", record.records_written);
    println!("{:<16} {:?}", "Category", record.failure_category);
    let message = record.error_message.as_deref().unwrap_or("n/a");
    println!("{:<16} {}", "Message", message);
}

pub fn print_batch_table(record: &BatchRecord) {
    println!("Batch '{}':", record.batch_id);
    println!("-----------------------------");
    println!("{:<16} {}", "Processor", record.processor);
    println!("{:<16} {}", "Identifier", record.identifier);
    println!("{:<16} {:?}", "Status", record.status);
    println!("{:<16} {}", "Total items", record.total_items);
    println!("{:<16} {}", "Items done", record.items_done);
    println!("{:<16} {}", "Items failed", record.items_failed);
    println!("{:<16} {}", "Outstanding", record.outstanding());
    println!(
        "{:<16} {}",
        "Last progress",
        record.last_progress_at.to_rfc3339()
    );
    println!("{:<16} {}", "Consolidated", record.consolidated);
}

pub fn print_history_table(
    processor: &ProcessorName,
    identifier: &Identifier,
    records: &[RunRecord],
) {
    println!("History for processor '{processor}' / identifier '{identifier}':");
    println!("-----------------------------");
    if records.is_empty() {
        println!("No finalized attempts.");
        return;
    }

    println!(
        "{:<6} {:<10} {:<26} {:<8} Message",
        "Seq", "Status", "Completed", "Records"
    );
    for record in records {
        let status = format!("{:?}", record.status);
        let completed = record
            .completed_at
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{:<6} {:<10} {:<26} {:<8} {}",
            record.seq,
            status,
            completed,
            record.records_written,
            record.error_message.as_deref().unwrap_or("")
        );
    }
}

pub fn print_report_table(report: &ReconciliationReport) {
    println!("Reconciliation report for {}:", report.report_date);
    println!("-----------------------------");
    if report.checks.is_empty() {
        println!("No gaps found.");
    }
    for check in &report.checks {
        println!("[{:?}] {}: {}", check.severity, check.phase_pair, check.message);
    }
    for skip in &report.skipped {
        println!("[skipped] {skip}");
    }
    println!("{:<16} {}", "Gaps found", report.gaps_found);
    if let Some(severity) = report.highest_severity() {
        println!("{:<16} {:?}", "Highest severity", severity);
    }
}

pub async fn write_report(report: &ReconciliationReport, path: String) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(report).map_err(CliError::JsonSerialize)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

pub fn print_metrics(snapshot: &MetricsSnapshot) {
    println!("Engine metrics:");
    println!("-----------------------------");
    println!("{:<20} {}", "Runs started", snapshot.runs_started);
    println!("{:<20} {}", "Runs succeeded", snapshot.runs_succeeded);
    println!("{:<20} {}", "Runs failed", snapshot.runs_failed);
    println!("{:<20} {}", "Runs suppressed", snapshot.runs_suppressed);
    println!("{:<20} {}", "Probes performed", snapshot.probes_performed);
    println!("{:<20} {}", "Items completed", snapshot.items_completed);
    println!("{:<20} {}", "Items failed", snapshot.items_failed);
    println!("{:<20} {}", "Batches finalized", snapshot.batches_finalized);
    println!("{:<20} {}", "Retries", snapshot.retry_count);
}
