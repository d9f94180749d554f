//! chamber_inspect - command-line front end for chamber inspection.
//!
//! `submit` runs one image through the full pipeline; the other subcommands
//! query, delete and export stored records without loading a detector.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use chamber_inspect::ingest::FileImageSource;
use chamber_inspect::{
    parse_export, DetectionRecord, DetectionStore, InspectConfig, Pipeline, QueryService,
    RecordFilter, RecordKey, SqliteDetectionStore, WriteMode,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "chamber_inspect",
    version,
    about = "Inspect chamber fasteners and query stored results"
)]
struct Args {
    /// Path to the SQLite DB (overrides CHAMBER_DB_PATH / config file)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<String>,

    /// Write mode: upsert (one record per chamber) or append (history)
    #[arg(long, global = true, value_name = "MODE")]
    mode: Option<WriteMode>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, global = true, default_value = "auto", value_name = "MODE")]
    ui: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one image through detection and store the result
    Submit {
        /// Chamber identifier
        #[arg(long)]
        chamber: String,
        /// Local image file (JPEG or PNG)
        #[arg(long, value_name = "PATH")]
        image: String,
        /// Print the stored record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records, newest first
    List {
        /// Only records for this exact chamber id
        #[arg(long)]
        chamber: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Records whose chamber id contains SUBSTRING (case-sensitive)
    Search { substring: String },
    /// Records for one chamber (current record in upsert mode, history in append mode)
    Get {
        chamber: Option<String>,
        /// Look up by record id instead
        #[arg(long, conflicts_with = "chamber")]
        id: Option<i64>,
    },
    /// Delete one record (chamber id in upsert mode, record id in append mode)
    Delete { key: String },
    /// Write a CSV export
    Export {
        /// Only chambers containing this substring
        #[arg(long)]
        search: Option<String>,
        /// Output file (stdout when omitted)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Re-read an export file and report its rows
    VerifyExport { path: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let ui = ui::Ui::from_args(
        &args.ui,
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );

    let mut config = InspectConfig::load()?;
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    if let Some(mode) = args.mode {
        config.store_mode = mode;
    }

    match args.command {
        Command::Submit {
            chamber,
            image,
            json,
        } => submit(&ui, &config, &chamber, &image, json),
        Command::List { chamber, limit } => {
            let query = open_query(&ui, &config)?;
            let mut filter = match chamber {
                Some(chamber) => RecordFilter::exact(chamber),
                None => RecordFilter::all(),
            };
            if let Some(limit) = limit {
                filter = filter.with_limit(limit);
            }
            print_records(&query.list(&filter)?);
            Ok(())
        }
        Command::Search { substring } => {
            let query = open_query(&ui, &config)?;
            print_records(&query.search(&substring)?);
            Ok(())
        }
        Command::Get { chamber, id } => {
            let query = open_query(&ui, &config)?;
            let records = match (chamber, id) {
                (_, Some(id)) => vec![query.by_id(id)?],
                (Some(chamber), None) => query.by_chamber(&chamber)?.into_vec(),
                (None, None) => return Err(anyhow!("give a chamber id or --id")),
            };
            print_records(&records);
            Ok(())
        }
        Command::Delete { key } => {
            let store = open_store(&ui, &config)?;
            let key = RecordKey::parse_for(store.mode(), &key)?;
            let removed = store.delete(&key)?;
            println!(
                "deleted record #{} for chamber {}",
                removed.id, removed.chamber_id
            );
            if let Some(path) = removed.image_ref.as_deref() {
                println!("  image file left in place: {path}");
            }
            Ok(())
        }
        Command::Export { search, out } => {
            let query = open_query(&ui, &config)?;
            let csv = {
                let _stage = ui.stage("Export records");
                query.export_matching(search.as_deref())?
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, &csv)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("wrote {}", path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&csv)?;
                }
            }
            Ok(())
        }
        Command::VerifyExport { path } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let rows = parse_export(&bytes)?;
            println!("verify-export: {} rows OK in {}", rows.len(), path.display());
            for row in rows {
                println!(
                    "  {} missing={} good={} other={} at {}",
                    row.chamber_id,
                    row.missing_count,
                    row.good_count,
                    row.other_count,
                    row.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
    }
}

fn submit(
    ui: &ui::Ui,
    config: &InspectConfig,
    chamber: &str,
    image: &str,
    json: bool,
) -> Result<()> {
    let pipeline = {
        let _stage = ui.stage("Load detector and store");
        Pipeline::from_config(config)?
    };
    let mut source = FileImageSource::new(image)?;
    let outcome = ui.run_stage("Inspect chamber", || pipeline.run(chamber, &mut source))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.record)?);
    } else {
        println!("{}", outcome.summary);
    }
    Ok(())
}

fn open_store(ui: &ui::Ui, config: &InspectConfig) -> Result<Arc<dyn DetectionStore>> {
    let _stage = ui.stage("Open database");
    let store = SqliteDetectionStore::open(&config.db_path, config.store_mode)?;
    Ok(Arc::new(store))
}

fn open_query(ui: &ui::Ui, config: &InspectConfig) -> Result<QueryService> {
    Ok(QueryService::new(open_store(ui, config)?))
}

fn print_records(records: &[DetectionRecord]) {
    if records.is_empty() {
        println!("no records");
        return;
    }
    for record in records {
        println!(
            "#{:<5} {:<20} missing={:<3} good={:<3} other={:<3} {}",
            record.id,
            record.chamber_id,
            record.counts.missing,
            record.counts.good,
            record.counts.other,
            record.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
}
