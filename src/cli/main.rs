//! mpdp command-line interface

mod commands;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mpdp::{ContractError, PipelineError};
use tracing_subscriber::EnvFilter;

/// Contract-driven pipeline for public datasets
#[derive(Parser, Debug)]
#[command(name = "mpdp", version, about, long_about = None)]
pub struct Cli {
    /// Dataset contract file
    #[arg(long, global = true, default_value = "configs/sources.yaml")]
    pub contracts: PathBuf,

    /// Settings file (TOML); environment variables override it
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List dataset contracts and their validation status
    ShowSources {
        /// Show one dataset in detail
        dataset_id: Option<String>,
    },
    /// Fetch a dataset's source into a bronze snapshot
    Ingest { dataset_id: String },
    /// Parse and validate the latest bronze snapshot into silver
    Transform { dataset_id: String },
    /// Upsert the latest silver snapshot into the staging table
    Load { dataset_id: String },
    /// Ingest, transform and load
    Run {
        dataset_id: Option<String>,
        /// Run every valid contract in parallel
        #[arg(long, conflicts_with = "dataset_id")]
        all: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,mpdp={}", level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 2 when the contract file itself is unusable, 1 otherwise
fn exit_code(err: &PipelineError) -> ExitCode {
    match err {
        PipelineError::Contract(ContractError::FileNotFound(_) | ContractError::Parse { .. }) => {
            ExitCode::from(2)
        }
        _ => ExitCode::FAILURE,
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match commands::dispatch(&cli) {
        Ok(code) => code,
        Err(err) => match err.downcast_ref::<PipelineError>() {
            Some(pipeline_error) => {
                eprintln!("Error: {}", pipeline_error.user_message());
                exit_code(pipeline_error)
            }
            None => {
                eprintln!("Error: {:#}", err);
                ExitCode::FAILURE
            }
        },
    }
}
