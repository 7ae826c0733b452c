//! Kiln CLI: the command-line driver for the incremental build cache.
//!
//! Provides `kiln build` for incrementally compiling and linking every module
//! of a project, and `kiln clean` for discarding the cache.

#![warn(missing_docs)]

mod build;
mod clean;
mod pipeline;

use std::process;

use clap::{Parser, Subcommand, ValueEnum};

/// Kiln: an incremental multi-module build.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Kiln incremental build")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a custom `kiln.toml` configuration file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Incrementally build and link every module.
    Build(BuildArgs),
    /// Remove the cache directory.
    Clean,
}

/// Arguments for the `kiln build` subcommand.
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Number of worker threads (overrides `build.jobs`; 0 uses all cores).
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Output format for the build report.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,

    /// Print the classification of every unit.
    #[arg(long)]
    pub explain: bool,
}

/// Build report output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable terminal output.
    Text,
    /// Machine-readable JSON output.
    Json,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print verbose/debug information.
    pub verbose: bool,
    /// Optional path to a custom config file.
    pub config: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        config: cli.config,
    };
    pipeline::init_logging(&global);

    let result = match cli.command {
        Command::Build(ref args) => build::run(args, &global),
        Command::Clean => clean::run(&global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
