mod completion;
mod core_flows;
mod dispatch;
mod exit;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::completion::CliCompletionShell;
use crate::dispatch::run_cli;
use crate::exit::exit_code_for;
use crate::render::{current_output_style, format_failure_lines};

#[derive(Parser, Debug)]
#[command(name = "frameset")]
#[command(version, about = "Transactional installer for framework components", long_about = None)]
pub(crate) struct Cli {
    /// Target root (defaults to FRAMESET_TARGET, then the per-user location)
    #[arg(long, global = true)]
    target: Option<PathBuf>,
    /// Log engine activity to stderr
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Never prompt; questions that need an answer fail instead
    #[arg(long, global = true)]
    non_interactive: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct ManifestArgs {
    /// Manifest file (TOML, or JSON by extension)
    #[arg(long, default_value = "frameset.toml")]
    manifest: PathBuf,
    /// Directory component sources are resolved against (defaults to the manifest's directory)
    #[arg(long)]
    source: Option<PathBuf>,
    /// Show the plan without changing anything
    #[arg(long)]
    dry_run: bool,
    /// Overwrite files that differ from the framework copy
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Install the components of a manifest
    Install {
        #[command(flatten)]
        manifest: ManifestArgs,
    },
    /// Move an installation to the manifest's version
    Update {
        #[command(flatten)]
        manifest: ManifestArgs,
        /// Keep every locally modified file, including mergeable configs
        #[arg(long)]
        preserve_all: bool,
        /// Merge config files recursively instead of top-level keys only
        #[arg(long)]
        merge_config: bool,
    },
    /// Remove an installation
    Uninstall {
        /// Show the plan without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Delete locally modified files too, without backups
        #[arg(long, conflicts_with = "no_preserve")]
        purge: bool,
        /// Leave locally modified files in place instead of backing them up
        #[arg(long)]
        no_preserve: bool,
    },
    /// Check installed files against the recorded hashes
    Verify,
    /// Roll back transactions left behind by an interrupted run
    Recover,
    /// Print a shell completion script
    Completions { shell: CliCompletionShell },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let style = current_output_style();
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            for line in format_failure_lines(&err, style) {
                eprintln!("{line}");
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn default_log_level(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else if verbose {
        "info"
    } else {
        "warn"
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_env("FRAMESET_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(verbose, quiet)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .try_init();
}
