use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Trigger a processor run over a batch of work items
    Start {
        #[arg(long, help = "Processor name to run")]
        processor: String,

        #[arg(long, help = "Logical identifier of the unit of work, e.g. a date")]
        identifier: String,

        #[arg(long, help = "JSON file listing the batch items to dispatch")]
        items: String,

        #[arg(long, help = "Bypass the idempotency gate for a manual re-run")]
        force: bool,
    },
    /// Show the current record of one batch
    Status {
        #[arg(long, help = "Batch ID to inspect")]
        batch: String,

        #[arg(
            long,
            help = "If set, prints the batch record as JSON instead of a table"
        )]
        json: bool,
    },
    /// Force-finalize running batches past their stall threshold
    CheckStalled,
    /// Audit phase row counts for one date and grade the gaps
    Reconcile {
        #[arg(long, help = "Report date (YYYY-MM-DD)")]
        date: String,

        #[arg(
            long,
            help = "JSON counts file with expected units and per-phase row counts"
        )]
        counts: String,

        #[arg(
            long = "pair",
            help = "Phase pair to check, as 'upstream:downstream'; repeatable"
        )]
        pairs: Vec<String>,

        #[arg(long, help = "If set, prints the report as JSON instead of a table")]
        json: bool,

        #[arg(
            long,
            help = "If specified, writes the JSON report to this file instead of stdout"
        )]
        output: Option<String>,
    },
    /// List every finalized attempt for a processor and identifier
    History {
        #[arg(long, help = "Processor name")]
        processor: String,

        #[arg(long, help = "Identifier whose attempts to list")]
        identifier: String,

        #[arg(long, help = "If set, prints the history as JSON instead of a table")]
        json: bool,
    },
}
