//! Output formatting for CLI

use mpdp::contract::{ContractEntry, RejectedContract};
use mpdp::{BatchReport, ContractStore, DatasetContract, DatasetReport, StageReport};

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let kept: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Contract table followed by the violations of rejected entries
pub fn print_sources(store: &ContractStore) {
    if let Some(path) = store.path() {
        println!("Contracts: {}", path.display());
        println!();
    }
    println!("{:<28} {:<8} {:<26} {}", "DATASET", "STATUS", "PARSER", "SOURCE");
    for entry in store.entries() {
        match entry {
            ContractEntry::Valid(contract) => println!(
                "{:<28} {:<8} {:<26} {}",
                truncate(&contract.dataset_id, 28),
                "valid",
                truncate(&contract.parser, 26),
                contract.source
            ),
            ContractEntry::Rejected(rejected) => println!(
                "{:<28} {:<8} {:<26} {}",
                truncate(&rejected.dataset_id, 28),
                "INVALID",
                "-",
                format!("{} violation(s)", rejected.violations.len())
            ),
        }
    }

    let rejected = store.rejected();
    if !rejected.is_empty() {
        println!();
        for entry in rejected {
            print_rejected(entry);
        }
    }
}

pub fn print_rejected(rejected: &RejectedContract) {
    println!("Contract '{}' is invalid:", rejected.dataset_id);
    for violation in &rejected.violations {
        println!("  - {}", violation);
    }
}

pub fn print_contract(contract: &DatasetContract) {
    println!("Dataset: {}", contract.dataset_id);
    println!("  Source:      {}", contract.source);
    println!("  Parser:      {}", contract.parser);
    println!("  Encoding:    {}", contract.encoding);
    println!("  Primary key: {}", contract.primary_key.join(", "));
    println!("  Partition:   {}", contract.partition_rule.name());
    println!("  Table:       {}", contract.qualified_table());
    if let Some(owner) = &contract.owner {
        println!("  Owner:       {}", owner);
    }
    if let Some(license) = &contract.license {
        println!("  License:     {}", license);
    }

    println!();
    println!("  Columns:");
    for column in &contract.schema {
        println!(
            "    {:<24} {:<10} {}",
            column.name,
            column.column_type.name(),
            if contract.is_required(column) {
                "required"
            } else {
                "nullable"
            }
        );
    }

    if !contract.quality_rules.is_empty() {
        println!();
        println!("  Quality rules:");
        for rule in &contract.quality_rules {
            println!(
                "    {:<24} {:<10} {}",
                rule.name,
                rule.check.kind(),
                rule.severity
            );
        }
    }
}

pub fn print_stage_report(report: &StageReport) {
    println!(
        "{} {}: {} ({} ms)",
        report.stage,
        report.dataset_id,
        report.status,
        report.duration_ms
    );
    if let Some(message) = &report.message {
        println!("  {}", message);
    }
}

pub fn print_dataset_report(report: &DatasetReport) {
    println!("Run {} for {}", report.run_id, report.dataset_id);
    for stage in &report.stages {
        print_stage_report(stage);
    }
}

pub fn print_batch_report(batch: &BatchReport) {
    println!("{:<28} {:<10} {:<10} {}", "DATASET", "INGEST", "TRANSFORM", "LOAD");
    for dataset in &batch.datasets {
        let status = |stage| {
            dataset
                .stage(stage)
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<28} {:<10} {:<10} {}",
            truncate(&dataset.dataset_id, 28),
            status(mpdp::PipelineStage::Ingest),
            status(mpdp::PipelineStage::Transform),
            status(mpdp::PipelineStage::Load)
        );
    }

    let failures: Vec<&DatasetReport> = batch.datasets.iter().filter(|d| !d.is_success()).collect();
    if !failures.is_empty() {
        println!();
        println!("Failures:");
        for dataset in failures {
            if let Some(err) = &dataset.error {
                println!("  {}: {}", dataset.dataset_id, err);
            }
        }
    }
    if !batch.rejected.is_empty() {
        println!();
        println!("Skipped invalid contracts: {}", batch.rejected.join(", "));
    }

    println!();
    println!(
        "{} succeeded, {} failed, {} skipped",
        batch.succeeded(),
        batch.failed(),
        batch.rejected.len()
    );
}
