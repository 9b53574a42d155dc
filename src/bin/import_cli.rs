//! import-cli - run the import pipeline against a local store
//!
//! Usage: import-cli <command> [options]; every command prints JSON.

use clap::{Parser, Subcommand};
use import_pipeline::commands::{
    self, AnalyzePayload, ClassifyPayload, IngestPayload, ListItemsPayload, PromotePayload,
};
use import_pipeline::{CommandError, MappingSuggestion, PipelineConfig, PipelineError, PipelineState};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "import-cli")]
#[command(about = "Classify, map, validate and promote uploaded business documents")]
struct Cli {
    /// SQLite store (overrides IMPORT_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show which optional collaborators are configured
    Status,

    /// Classify a file and suggest a column mapping
    Analyze {
        file: PathBuf,
        #[arg(long)]
        tenant: Option<String>,
        /// Ask the assistance provider when heuristics are unsure
        #[arg(long)]
        ai: bool,
    },

    /// Classify free text (e.g. OCR output) against a parser list
    Classify {
        text: String,
        #[arg(long = "parser")]
        parsers: Vec<String>,
    },

    /// Stream a file into import items
    Ingest {
        file: PathBuf,
        #[arg(long)]
        tenant: String,
        /// Force the document type (aliases accepted)
        #[arg(long)]
        doc_type: Option<String>,
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        currency: Option<String>,
        /// JSON file holding a confirmed mapping suggestion
        #[arg(long)]
        mapping: Option<PathBuf>,
        #[arg(long)]
        ai: bool,
        /// Run as a background job and report progress
        #[arg(long)]
        background: bool,
    },

    /// Promote a batch into the destination tables
    Promote {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        batch: i64,
        /// Confirm a batch the gate flagged for review
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        background: bool,
    },

    /// List the items of a batch
    Items {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        batch: i64,
        #[arg(long)]
        status: Option<String>,
    },

    /// Retrain the classifier from accumulated feedback
    Retrain,
}

fn command_error(e: impl Into<PipelineError>) -> CommandError {
    CommandError::from(e.into())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CommandError> {
    let out = serde_json::to_string_pretty(value).map_err(command_error)?;
    println!("{}", out);
    Ok(())
}

fn read_mapping(path: &PathBuf) -> Result<MappingSuggestion, CommandError> {
    let body = std::fs::read_to_string(path).map_err(command_error)?;
    serde_json::from_str(&body).map_err(command_error)
}

fn run(cli: Cli) -> Result<(), CommandError> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let state = PipelineState::from_config(config)?;

    match cli.command {
        Command::Status => print_json(&commands::status(&state)),
        Command::Analyze { file, tenant, ai } => print_json(&commands::analyze(
            &state,
            AnalyzePayload {
                path: file,
                tenant_id: tenant,
                use_ai: ai,
            },
        )?),
        Command::Classify { text, parsers } => print_json(&commands::classify(
            &state,
            ClassifyPayload {
                text,
                available_parsers: parsers,
            },
        )),
        Command::Ingest {
            file,
            tenant,
            doc_type,
            country,
            currency,
            mapping,
            ai,
            background,
        } => {
            let payload = IngestPayload {
                tenant_id: tenant,
                path: file,
                doc_type,
                country,
                currency,
                mapping: mapping.as_ref().map(read_mapping).transpose()?,
                use_ai: ai,
            };
            if background {
                let tenant_id = payload.tenant_id.clone();
                let job = commands::start_ingest(&state, payload)?;
                while !job.is_finished() {
                    let p = job.progress();
                    tracing::info!(batch_id = job.batch_id(), processed = p.processed, created = p.created, "ingesting");
                    std::thread::sleep(POLL_INTERVAL);
                }
                let batch_id = job.batch_id();
                job.join()?;
                print_json(&commands::get_batch(
                    &state,
                    commands::BatchPayload {
                        tenant_id,
                        batch_id,
                    },
                )?)
            } else {
                print_json(&commands::ingest(&state, payload)?)
            }
        }
        Command::Promote {
            tenant,
            batch,
            confirm,
            background,
        } => {
            let payload = PromotePayload {
                tenant_id: tenant,
                batch_id: batch,
                confirmed: confirm,
            };
            if background {
                let job = commands::start_promote(&state, payload)?;
                while !job.is_finished() {
                    let p = job.progress();
                    tracing::info!(batch_id = batch, promoted = p.promoted, failed = p.failed, "promoting");
                    std::thread::sleep(POLL_INTERVAL);
                }
                print_json(&job.join()?)
            } else {
                print_json(&commands::promote(&state, payload)?)
            }
        }
        Command::Items {
            tenant,
            batch,
            status,
        } => print_json(&commands::list_items(
            &state,
            ListItemsPayload {
                tenant_id: tenant,
                batch_id: batch,
                status,
            },
        )?),
        Command::Retrain => print_json(&commands::retrain(&state)?),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = %e.kind, "{}", e.message);
            if let Ok(body) = serde_json::to_string(&e) {
                eprintln!("{}", body);
            }
            ExitCode::FAILURE
        }
    }
}
