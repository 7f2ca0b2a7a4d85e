//! Stockpile step invoked by the last rule of an intersection chain.
//!
//! Applies the engine outcome to the matrix and writes the success file the
//! chain declared as its final output.

use anyhow::{Context, Result};
use clap::Parser;
use gridflow_core::db::open_db;
use gridflow_core::{
    init_logging, EngineReport, SiteConfig, SqliteCatalog, SqliteChainRepository, Status,
    StatusService, SystemClock,
};
use log::warn;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "gridflow_stockpile", version, about = "Record a computed matrix")]
struct Args {
    /// Catalog id of the matrix
    #[arg(long, value_name = "ID")]
    matrix: Uuid,

    /// Success file written once the matrix is complete
    #[arg(long, value_name = "FILE")]
    success: PathBuf,

    /// Engine failure code; the matrix is marked failed instead
    #[arg(long, value_name = "CODE", allow_negative_numbers = true)]
    failed: Option<i64>,

    /// Site settings TOML; built-in defaults when absent
    #[arg(long, value_name = "FILE")]
    site: Option<PathBuf>,

    /// Computed matrix file; the stored location when omitted
    #[arg(value_name = "ARTIFACT")]
    artifacts: Vec<PathBuf>,
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(Status::Complete) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("gridflow_stockpile: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<Status> {
    let site = SiteConfig::load(args.site.as_deref()).context("failed to load site settings")?;
    init_logging(&site.logging).map_err(anyhow::Error::msg)?;

    if args.artifacts.len() > 1 {
        warn!(
            "event=cli_stockpile module=cli status=error matrix={} extra_artifacts={}",
            args.matrix,
            args.artifacts.len() - 1
        );
    }
    let report = match args.failed {
        Some(code) => EngineReport::Failure { code },
        None => EngineReport::Success {
            artifact: args.artifacts.into_iter().next(),
        },
    };

    let conn = open_db(site.database_path())?;
    let service = StatusService::new(
        SqliteCatalog::new(&conn),
        SqliteChainRepository::new(&conn),
        Arc::new(SystemClock),
    );
    let matrix = service
        .stockpile(args.matrix, &args.success, &report)
        .with_context(|| format!("failed to stockpile matrix {}", args.matrix))?;
    println!("matrix={} status={}", args.matrix, matrix.status);
    Ok(matrix.status)
}
