//! Command handlers

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use mpdp::contract::ContractEntry;
use mpdp::{ContractError, ContractStore, ParserRegistry, Pipeline, PipelineError, PipelineSettings};

use crate::output;
use crate::{Cli, Command};

pub fn dispatch(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Command::ShowSources { dataset_id } => show_sources(&cli.contracts, dataset_id.as_deref()),
        Command::Ingest { dataset_id } => {
            let report = pipeline(cli)?.ingest(dataset_id)?;
            output::print_stage_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Command::Transform { dataset_id } => {
            let report = pipeline(cli)?.transform(dataset_id)?;
            output::print_stage_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Command::Load { dataset_id } => {
            let report = pipeline(cli)?.load(dataset_id)?;
            output::print_stage_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            dataset_id: Some(dataset_id),
            ..
        } => {
            let report = pipeline(cli)?.run(dataset_id);
            output::print_dataset_report(&report);
            match report.error {
                Some(err) => Err(err.into()),
                None => Ok(ExitCode::SUCCESS),
            }
        }
        Command::Run {
            dataset_id: None,
            all: true,
        } => {
            let batch = pipeline(cli)?.run_all()?;
            output::print_batch_report(&batch);
            Ok(if batch.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Run {
            dataset_id: None,
            all: false,
        } => bail!("give a DATASET_ID or --all"),
    }
}

fn load_contracts(path: &Path, registry: &ParserRegistry) -> Result<ContractStore> {
    Ok(ContractStore::load(path, registry).map_err(PipelineError::from)?)
}

fn pipeline(cli: &Cli) -> Result<Pipeline> {
    let settings = PipelineSettings::load(cli.settings.as_deref())?;
    let registry = ParserRegistry::builtin().map_err(PipelineError::from)?;
    let contracts = load_contracts(&cli.contracts, &registry)?;
    for rejected in contracts.rejected() {
        tracing::warn!(dataset_id = %rejected.dataset_id, "Contract is invalid and will be skipped");
    }
    Pipeline::from_settings(settings, contracts, registry)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("cannot start pipeline for {}", cli.contracts.display()))
}

fn show_sources(path: &Path, dataset_id: Option<&str>) -> Result<ExitCode> {
    let registry = ParserRegistry::builtin().map_err(PipelineError::from)?;
    let store = load_contracts(path, &registry)?;

    if let Some(id) = dataset_id {
        let Some(entry) = store.entries().iter().find(|e| e.dataset_id() == id) else {
            return Err(PipelineError::from(ContractError::UnknownDataset(id.to_string())).into());
        };
        return Ok(match entry {
            ContractEntry::Valid(contract) => {
                output::print_contract(contract);
                ExitCode::SUCCESS
            }
            ContractEntry::Rejected(rejected) => {
                output::print_rejected(rejected);
                ExitCode::FAILURE
            }
        });
    }

    if store.entries().is_empty() {
        println!("No datasets declared in {}", path.display());
        return Ok(ExitCode::FAILURE);
    }
    output::print_sources(&store);
    Ok(if store.rejected().is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
