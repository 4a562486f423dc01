use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "caravel")]
#[command(version)]
#[command(about = "Declarative Docker deployment over SSH", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Converge every host to the plan
    Deploy(DeployArgs),

    /// Remove everything the plan owns from its hosts
    Destroy(DestroyArgs),

    /// Validate a plan file without connecting to any host
    Check(CheckArgs),
}

#[derive(Parser)]
pub struct DeployArgs {
    /// Path to the plan file (TOML)
    pub plan: PathBuf,

    /// Decide and report without mutating any host
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Parser)]
pub struct DestroyArgs {
    /// Path to the plan file (TOML)
    pub plan: PathBuf,

    /// Report what would be removed without removing anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Parser)]
pub struct CheckArgs {
    /// Path to the plan file (TOML)
    pub plan: PathBuf,
}
