use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use metric_intake::logging::init_logging;
use metric_intake::{BatchStatus, IntakeConfig, Period, Pipeline};

#[derive(Parser)]
#[command(name = "metric-intake", version, about = "Periodic metric intake: extract, validate, merge")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the base data directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract one document and submit it to the validation gate
    Extract {
        path: PathBuf,
        #[arg(long)]
        source: String,
        /// Reporting period (YYYY-MM); decoded from the file name when omitted
        #[arg(long)]
        period: Option<String>,
    },
    /// List pending batches
    Pending {
        /// Only batches in the needs-review band
        #[arg(long)]
        review: bool,
    },
    /// Approve a pending batch
    Approve {
        batch_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Reject a pending batch
    Reject {
        batch_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Merge all approved batches into the store
    Load,
    /// Agent statistics and recommendation
    Patterns {
        #[arg(long)]
        signature: Option<String>,
    },
    /// Record counts and date ranges per family
    Status,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Ok(false) when the command finished but a stage reported failures
fn run(cli: Cli) -> Result<bool> {
    let mut config = IntakeConfig::load(cli.config.as_deref())?;
    if let Some(base_dir) = cli.base_dir {
        config = config.with_base_dir(base_dir);
    }
    let pipeline = Pipeline::new(config)?;

    match cli.command {
        Command::Extract { path, source, period } => {
            let period = period.as_deref().map(Period::parse).transpose()?;
            let run = pipeline.extract(&path, &source, period)?;

            println!("📄 Extraction");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("Batch:      {}", run.batch_id);
            println!("Status:     {}", run.status.as_str());
            println!("Agent:      {} ({})", run.agent, run.strategy);
            println!("Invoked:    {}", run.agents_invoked.join(" → "));
            if let Some(agent) = &run.recommended {
                println!("Memory:     {} recommended", agent);
            }
            println!("Confidence: {:.1}%", run.aggregate_confidence * 100.0);
            println!(
                "Records:    {} produced, {} skipped, {} flagged",
                run.produced, run.skipped, run.flagged
            );
            for failure in &run.page_failures {
                println!("⚠️  page {}: {}", failure.page, failure.reason);
            }
            if run.status == BatchStatus::Pending {
                println!("\n👀 Awaiting review: metric-intake approve {} --reason \"...\"", run.batch_id);
            }
        }

        Command::Pending { review } => {
            let gate = pipeline.gate();
            let batches = if review { gate.needs_review()? } else { gate.pending()? };
            if batches.is_empty() {
                println!("✓ No pending batches");
            }
            for batch in &batches {
                println!("[{:?}] {}", batch.band, batch.report.summary());
                for issue in &batch.report.issues {
                    println!("    {:?} {}: {}", issue.severity, issue.field, issue.issue);
                }
            }
        }

        Command::Approve { batch_id, reason, actor } => {
            let report = pipeline.gate().approve(&batch_id, &reason, &actor)?;
            println!("✅ Approved {}", report.batch_id);
        }

        Command::Reject { batch_id, reason, actor } => {
            let report = pipeline.gate().reject(&batch_id, &reason, &actor)?;
            println!("🚫 Rejected {}", report.batch_id);
        }

        Command::Load => {
            let summary = pipeline.load()?;
            println!("💾 Load");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            for load in &summary.loaded {
                println!(
                    "✓ {} → {} ({} inserted, {} unchanged, {} superseded, {} conflicts)",
                    load.batch_id,
                    load.family,
                    load.stats.inserted,
                    load.stats.unchanged,
                    load.stats.superseded,
                    load.stats.conflicts
                );
            }
            for failure in &summary.failed {
                println!("❌ {}: {}", failure.batch_id, failure.error);
            }
            println!("\n{}", summary.summary_line());
            return Ok(!summary.has_failures());
        }

        Command::Patterns { signature } => {
            let memory = pipeline.pattern_memory()?;
            println!("🧠 Agent statistics");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            for (agent, stats) in memory.stats() {
                println!(
                    "{:<10} {:>4} attempts, {:>4} successes, {:.0}% success rate",
                    agent,
                    stats.total_attempts,
                    stats.success_count,
                    stats.success_rate * 100.0
                );
            }
            if let Some(signature) = signature {
                match memory.recommend(&signature) {
                    Some(agent) => println!("\nRecommended for {}: {}", signature, agent),
                    None => println!("\nNo recommendation for {}", signature),
                }
            }
        }

        Command::Status => {
            println!("📊 Store");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            for family in pipeline.status()? {
                let range = match (&family.first_date, &family.last_date) {
                    (Some(first), Some(last)) => format!("{} → {}", first, last),
                    _ => "empty".to_string(),
                };
                println!("{:<10} {:>6} records  {}", family.family, family.records, range);
            }
        }
    }

    Ok(true)
}
