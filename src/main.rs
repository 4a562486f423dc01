mod cli;
mod config;
mod docker;
mod engine;
mod firewall;
mod hash;
mod packages;
mod plan;
mod remote;
mod report;
mod ssh;

#[cfg(test)]
mod testutil;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::Parser;

use cli::{Cli, Command};
use config::PlanConfig;
use engine::{Engine, ExecuteOptions};
use plan::Plan;
use ssh::client::SshClientSource;
use ssh::pool::ConnectionPool;

enum Mode {
    Deploy,
    Destroy,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Command::Deploy(args) => run(&args.plan, args.dry_run, Mode::Deploy),
        Command::Destroy(args) => run(&args.plan, args.dry_run, Mode::Destroy),
        Command::Check(args) => check(&args.plan),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            report::error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(path: &Path, dry_run: bool, mode: Mode) -> Result<bool> {
    let plan = load_plan(path)?;

    let pool = ConnectionPool::new(Box::new(SshClientSource));
    let engine = Engine::new(&plan, &pool);
    let options = ExecuteOptions {
        dry_run,
        ..ExecuteOptions::default()
    };

    let report = match mode {
        Mode::Deploy => engine.deploy(&options),
        Mode::Destroy => engine.destroy(&options),
    };

    if let Err(err) = pool.close_all() {
        log::warn!("could not close all connections cleanly: {err}");
    }

    report::print_report(&report, dry_run);
    Ok(report.is_success())
}

fn check(path: &Path) -> Result<bool> {
    let config = PlanConfig::load(path)?;
    match config.validate() {
        Ok(()) => {
            report::info(&format!("{} is valid", path.display()));
            Ok(true)
        }
        Err(errors) => {
            for error in &errors {
                report::error(&error.to_string());
            }
            Ok(false)
        }
    }
}

/// Load, validate, and resolve a plan file. Validation reports every
/// problem before failing, not just the first one.
fn load_plan(path: &Path) -> Result<Plan> {
    let config = PlanConfig::load(path)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            report::error(&error.to_string());
        }
        bail!(
            "plan {} has {} validation error(s)",
            path.display(),
            errors.len()
        );
    }

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    config.into_plan(base_dir)
}
