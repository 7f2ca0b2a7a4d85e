//! Archive initialization entry point.
//!
//! # Responsibility
//! - Load the site and archive request, open the catalog and run the
//!   orchestrator once.
//! - Map failures to process exit codes.
//!
//! # Exit codes
//! - `0` on success.
//! - `255` when the request file does not exist.
//! - `1` on any other failure.

use anyhow::{Context, Result};
use clap::Parser;
use gridflow_core::db::open_db;
use gridflow_core::{
    init_logging, ArchiveOrchestrator, ArchiveRequest, FsLayerIo, SiteConfig, SqliteCatalog,
    SqliteChainRepository, SystemClock,
};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const MISSING_CONFIG_EXIT: u8 = 255;

#[derive(Parser, Debug)]
#[command(
    name = "gridflow_init",
    version,
    about = "Catalog an archive request and author its workflow chains"
)]
struct Args {
    /// Archive request TOML
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Also author one intersection chain per unfinished GRIM
    #[arg(long)]
    build_intersect_chains: bool,

    /// Site settings TOML; built-in defaults when absent
    #[arg(long, value_name = "FILE")]
    site: Option<PathBuf>,

    /// Overrides the site log level (trace|debug|info|warn|error)
    #[arg(long, value_name = "L")]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if !args.config.is_file() {
        eprintln!(
            "gridflow_init: request file `{}` does not exist",
            args.config.display()
        );
        return ExitCode::from(MISSING_CONFIG_EXIT);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gridflow_init: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let site = SiteConfig::load(args.site.as_deref()).context("failed to load site settings")?;
    let mut logging = site.logging.clone();
    if let Some(level) = &args.log_level {
        logging.level.clone_from(level);
    }
    init_logging(&logging).map_err(anyhow::Error::msg)?;

    let request = ArchiveRequest::from_file(&args.config, &site)
        .with_context(|| format!("invalid archive request `{}`", args.config.display()))?;

    let database = site.database_path();
    if let Some(parent) = database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create `{}`", parent.display()))?;
    }
    let conn = open_db(&database)?;

    let orchestrator = ArchiveOrchestrator::new(
        SqliteCatalog::new(&conn),
        SqliteChainRepository::new(&conn),
        Box::new(FsLayerIo),
        Arc::new(SystemClock),
        site.clone(),
    )
    .with_intersect_chains(args.build_intersect_chains);
    let outcome = orchestrator.run(&request)?;

    info!(
        "event=cli_init module=cli status=ok archive={} chains={}",
        request.archive_name,
        outcome.chains().count()
    );
    println!("gridset={}", outcome.gridset.name);
    println!("config_record={}", outcome.config_record.display());
    for chain in outcome.chains() {
        if let Some(document) = &chain.dlocation {
            println!("chain={document}");
        }
    }
    Ok(())
}
