use std::path::{Path, PathBuf};
use std::sync::Arc;

use caseport::mapping::StatsSnapshot;
use caseport::migrate::{JsonReportSink, MigrationContext, Orchestrator, ReportError, ReportSink};
use caseport::qase::{QaseClient, QaseScimClient};
use caseport::service::RateLimitedSource;
use caseport::testrail::TestRailClient;
use caseport::{Mappings, MigrationReport, Pools, StageKind};
use clap::ValueEnum;
use tabled::{Table, Tabled, settings::Style};

use crate::config::Config;
use crate::progress::ProgressReporter;

/// Failures listed in the table summary; the JSON report has all of them.
const MAX_LISTED_FAILURES: usize = 20;

/// Output format for the run summary.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Display as a formatted table (default)
    #[default]
    Table,
    /// Display as JSON
    Json,
}

/// Options for a migration run.
#[derive(Debug, Clone, clap::Args)]
pub(crate) struct RunArgs {
    /// Report file prefix (default from config or "caseport")
    #[arg(short, long)]
    pub prefix: Option<String>,

    /// Skip a stage; can be repeated (e.g. --skip attachments --skip runs)
    #[arg(short, long = "skip", value_name = "STAGE")]
    pub skip: Vec<StageKind>,

    /// Create destination accounts for unmatched users (needs qase.scim_token)
    #[arg(long)]
    pub create_users: bool,

    /// Leave out source projects marked completed
    #[arg(long)]
    pub exclude_completed: bool,

    /// Summary output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,
}

/// Per-entity row of the summary table.
#[derive(Debug, Clone, serde::Serialize, Tabled)]
struct EntityRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Attempted")]
    attempted: u64,
    #[tabled(rename = "Created")]
    created: u64,
    #[tabled(rename = "Skipped")]
    skipped: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
}

#[derive(Debug, Clone, Tabled)]
struct FailureRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Source ID")]
    source_id: u64,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Error")]
    error: String,
}

fn entity_rows(snapshot: &StatsSnapshot) -> Vec<EntityRow> {
    snapshot
        .entities
        .iter()
        .map(|(kind, stats)| EntityRow {
            entity: kind.to_string(),
            attempted: stats.attempted,
            created: stats.succeeded,
            skipped: stats.skipped,
            failed: stats.failed,
        })
        .collect()
}

fn failure_rows(snapshot: &StatsSnapshot) -> Vec<FailureRow> {
    snapshot
        .failures
        .iter()
        .take(MAX_LISTED_FAILURES)
        .map(|f| FailureRow {
            entity: f.kind.to_string(),
            source_id: f.source_id,
            project: f.project.clone().unwrap_or_else(|| "-".to_string()),
            error: f.error.lines().next().unwrap_or_default().to_string(),
        })
        .collect()
}

/// Writes the per-entity table of each checkpoint to `<dir>/<prefix>_stats.txt`.
struct TableReportSink {
    path: PathBuf,
}

impl TableReportSink {
    fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            path: dir.join(format!("{prefix}_stats.txt")),
        }
    }
}

impl ReportSink for TableReportSink {
    fn save(&self, label: &str, snapshot: &StatsSnapshot) -> Result<(), ReportError> {
        let mut table = Table::new(entity_rows(snapshot));
        table.with(Style::rounded());
        let body = format!(
            "checkpoint: {label}\nfailures: {}\n\n{table}\n",
            snapshot.failures.len()
        );
        let tmp = self.path.with_extension("txt.tmp");
        std::fs::write(&tmp, body).map_err(|source| ReportError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| ReportError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn render_summary(report: &MigrationReport, output: OutputFormat) -> Result<String, serde_json::Error> {
    match output {
        OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "projects": report.projects,
            "counts": report.counts,
            "stats": report.snapshot,
        })),
        OutputFormat::Table => {
            let mut out = String::new();
            let mut table = Table::new(entity_rows(&report.snapshot));
            table.with(Style::rounded());
            out.push_str(&table.to_string());

            let failures = failure_rows(&report.snapshot);
            if !failures.is_empty() {
                let mut table = Table::new(failures);
                table.with(Style::rounded());
                out.push_str("\n\nFailures:\n");
                out.push_str(&table.to_string());
                let hidden = report.snapshot.failures.len().saturating_sub(MAX_LISTED_FAILURES);
                if hidden > 0 {
                    out.push_str(&format!("\n... and {hidden} more"));
                }
            }
            Ok(out)
        }
    }
}

/// Handle the run command.
pub(crate) async fn handle_run(args: RunArgs, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let default_user = config.users.default.ok_or("users.default is not set")?;

    let mut options = config.migration_options();
    for stage in &args.skip {
        options.stages.set(*stage, false);
    }
    if let Some(prefix) = args.prefix {
        options.report_prefix = prefix;
    }
    if args.create_users {
        options.create_missing_users = true;
    }
    if args.exclude_completed {
        options.include_completed_projects = false;
    }

    let testrail = &config.testrail;
    let source = TestRailClient::new(
        testrail.host.as_deref().unwrap_or_default(),
        testrail.user.as_deref().unwrap_or_default(),
        testrail.api_key.as_deref().unwrap_or_default(),
    )?;
    let destination = QaseClient::new(
        &config.qase.api_url,
        config.qase.token.as_deref().unwrap_or_default(),
    )?;

    let reporter = Arc::new(ProgressReporter::new());
    let mut builder = MigrationContext::builder()
        .destination(destination)
        .options(options.clone())
        .progress(reporter.as_callback());
    builder = match config.pools.source_requests_per_second {
        Some(rps) => builder.source(RateLimitedSource::new(source, rps)),
        None => builder.source(source),
    };
    if let Some(token) = config.qase.scim_token.as_deref().filter(|t| !t.trim().is_empty()) {
        builder = builder.provisioner(QaseScimClient::new(&config.qase.scim_url, token)?);
    } else if options.create_missing_users {
        tracing::warn!("User creation requested but qase.scim_token is not set");
    }
    let ctx = builder.build()?;

    let report_dir = config.report_dir();
    std::fs::create_dir_all(&report_dir)?;
    let sink = JsonReportSink::new(&report_dir, &options.report_prefix);
    let report_path = sink.path().to_path_buf();

    let pools = Pools::from_config(&config.pool_config());
    let mut orchestrator = Orchestrator::new(ctx, pools.clone())
        .with_sink(sink)
        .with_sink(TableReportSink::new(&report_dir, &options.report_prefix));

    tracing::info!(
        source = %testrail.host.as_deref().unwrap_or_default(),
        destination = %config.qase.api_url,
        report = %report_path.display(),
        "Starting migration"
    );

    let outcome = tokio::select! {
        result = orchestrator.run(Mappings::new(default_user)) => result,
        _ = tokio::signal::ctrl_c() => {
            reporter.finish();
            pools.shutdown().await;
            return Err(format!(
                "interrupted; statistics up to the last finished project are in {}",
                report_path.display()
            )
            .into());
        }
    };
    reporter.finish();
    pools.shutdown().await;

    let report = outcome.map_err(|e| {
        tracing::error!(error = %e, "Migration failed");
        e
    })?;

    println!("{}", render_summary(&report, args.output)?);
    println!();
    println!("Statistics written to {}", report_path.display());
    if !report.is_clean() {
        eprintln!(
            "{} entities failed to import, details in {}",
            report.snapshot.failures.len(),
            report_path.display()
        );
    }

    Ok(())
}
