use anyhow::Result;

use crate::completion::write_completions_script;
use crate::core_flows::{run_install, run_recover, run_uninstall, run_update, run_verify, Session};
use crate::render::current_output_style;
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let open_session =
        || Session::open(cli.target.as_deref(), current_output_style(), cli.non_interactive);

    match &cli.command {
        Commands::Install { manifest } => {
            let session = open_session()?;
            run_install(&session, manifest)?;
        }
        Commands::Update {
            manifest,
            preserve_all,
            merge_config,
        } => {
            let session = open_session()?;
            run_update(&session, manifest, *preserve_all, *merge_config)?;
        }
        Commands::Uninstall {
            dry_run,
            purge,
            no_preserve,
        } => {
            let session = open_session()?;
            run_uninstall(&session, *dry_run, *purge, *no_preserve)?;
        }
        Commands::Verify => {
            let session = open_session()?;
            run_verify(&session)?;
        }
        Commands::Recover => {
            let session = open_session()?;
            run_recover(&session)?;
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(*shell, &mut stdout)?;
        }
    }

    Ok(())
}
