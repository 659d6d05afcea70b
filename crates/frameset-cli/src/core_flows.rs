use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use frameset_core::Manifest;
use frameset_installer::{
    default_target_root, install, probe_environment_with_timeout, require_metadata, uninstall,
    update, verify_installation, EngineConfig, EngineError, EnvironmentReport, InstallOptions,
    Interrupt, PurgeToken, RecoveryReport, TargetLayout, TransactionEngine, UninstallOptions,
    UpdateOptions,
};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use tracing::debug;

use crate::exit::EXIT_CANCELLED;
use crate::render::{
    format_install_lines, format_plan_lines, format_recovery_lines, format_uninstall_lines,
    format_update_lines, format_verify_lines, OutputStyle, TerminalRenderer,
};
use crate::ManifestArgs;

/// Everything one command needs to talk to a target root.
pub(crate) struct Session {
    engine: TransactionEngine,
    renderer: TerminalRenderer,
    non_interactive: bool,
}

impl Session {
    pub(crate) fn open(
        target: Option<&Path>,
        style: OutputStyle,
        non_interactive: bool,
    ) -> Result<Self> {
        let root = match target {
            Some(root) => root.to_path_buf(),
            None => default_target_root()?,
        };
        let interrupt = Interrupt::new();
        register_interrupt_handlers(&interrupt)?;
        let engine = TransactionEngine::new(TargetLayout::new(root), EngineConfig::from_env())
            .with_interrupt(interrupt);
        debug!(root = %engine.layout().root().display(), "session opened");
        Ok(Self {
            engine,
            renderer: TerminalRenderer::from_style(style),
            non_interactive,
        })
    }

    fn layout(&self) -> &TargetLayout {
        self.engine.layout()
    }

    fn probe(&self) -> Result<EnvironmentReport, EngineError> {
        probe_environment_with_timeout(self.layout(), self.engine.config().probe_timeout)
    }

    /// A run that made no transaction of its own still honors a signal
    /// that arrived while it worked.
    fn finish_untransacted(&self) -> Result<(), EngineError> {
        ensure_not_interrupted(self.engine.interrupt())
    }

    fn print_recovered(&self, reports: &[RecoveryReport]) {
        self.renderer
            .print_lines(&format_recovery_lines(reports, self.renderer.style()));
    }
}

pub(crate) fn ensure_not_interrupted(interrupt: &Interrupt) -> Result<(), EngineError> {
    if interrupt.is_requested() {
        Err(EngineError::Interrupted)
    } else {
        Ok(())
    }
}

/// The first signal requests cancellation; a second one while the flag is
/// still set exits at once with the cancellation status.
fn register_interrupt_handlers(interrupt: &Interrupt) -> Result<()> {
    for signal in TERM_SIGNALS {
        flag::register_conditional_shutdown(*signal, i32::from(EXIT_CANCELLED), interrupt.flag())
            .with_context(|| format!("failed to register handler for signal {signal}"))?;
        flag::register(*signal, interrupt.flag())
            .with_context(|| format!("failed to register handler for signal {signal}"))?;
    }
    Ok(())
}

fn load_manifest(args: &ManifestArgs) -> Result<(Manifest, PathBuf)> {
    let manifest = Manifest::load(&args.manifest)?;
    let source_root = match &args.source {
        Some(source) => source.clone(),
        None => manifest_dir(&args.manifest),
    };
    Ok((manifest, source_root))
}

fn manifest_dir(manifest_path: &Path) -> PathBuf {
    match manifest_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub(crate) fn run_install(session: &Session, args: &ManifestArgs) -> Result<()> {
    let (manifest, source_root) = load_manifest(args)?;
    let environment = session.probe()?;
    let style = session.renderer.style();

    session.renderer.print_section("install");
    let progress = session.renderer.start_progress("install");
    let result = install(
        &session.engine,
        &manifest,
        &source_root,
        &environment,
        InstallOptions {
            dry_run: args.dry_run,
            force: args.force,
        },
    );
    let result = match result {
        Ok(result) => result,
        Err(err) => {
            progress.finish_abandon();
            return Err(err.into());
        }
    };
    progress.finish_success(result.plan.len());

    session.print_recovered(&result.recovered);
    if result.dry_run {
        session
            .renderer
            .print_lines(&format_plan_lines(&result.plan, style));
        session.finish_untransacted()?;
        return Ok(());
    }
    session
        .renderer
        .print_lines(&format_install_lines(&manifest.name, &result, style));
    if result.txid.is_none() {
        session.finish_untransacted()?;
    }
    Ok(())
}

pub(crate) fn run_update(
    session: &Session,
    args: &ManifestArgs,
    preserve_all: bool,
    merge_config: bool,
) -> Result<()> {
    let (manifest, source_root) = load_manifest(args)?;
    let environment = session.probe()?;
    let existing = environment
        .existing_installation
        .clone()
        .ok_or_else(|| EngineError::NotInstalled {
            root: session.layout().root().to_path_buf(),
        })?;
    let style = session.renderer.style();

    session.renderer.print_section("update");
    let progress = session.renderer.start_progress("update");
    let result = update(
        &session.engine,
        &manifest,
        &source_root,
        &existing,
        &environment,
        UpdateOptions {
            preserve_all,
            merge_config,
            force: args.force,
            dry_run: args.dry_run,
        },
    );
    let result = match result {
        Ok(result) => result,
        Err(err) => {
            progress.finish_abandon();
            return Err(err.into());
        }
    };
    progress.finish_success(result.plan.len());

    session.print_recovered(&result.recovered);
    if result.dry_run {
        session
            .renderer
            .print_lines(&format_plan_lines(&result.plan, style));
        session.finish_untransacted()?;
        return Ok(());
    }
    session
        .renderer
        .print_lines(&format_update_lines(&result, style));
    if result.txid.is_none() {
        session.finish_untransacted()?;
    }
    Ok(())
}

pub(crate) fn run_uninstall(
    session: &Session,
    dry_run: bool,
    purge: bool,
    no_preserve: bool,
) -> Result<()> {
    let metadata = require_metadata(session.layout())?;
    let style = session.renderer.style();

    let purge = if !purge {
        None
    } else if dry_run {
        let answer = PurgeToken::expected_answer(session.layout());
        Some(PurgeToken::confirm(session.layout(), &answer)?)
    } else {
        Some(confirm_purge(session)?)
    };

    session.renderer.print_section("uninstall");
    let progress = session.renderer.start_progress("uninstall");
    let result = uninstall(
        &session.engine,
        &metadata,
        UninstallOptions {
            preserve_customizations: !no_preserve,
            purge,
            dry_run,
        },
    );
    let result = match result {
        Ok(result) => result,
        Err(err) => {
            progress.finish_abandon();
            return Err(err.into());
        }
    };
    progress.finish_success(result.plan.len());

    session.print_recovered(&result.recovered);
    if result.dry_run {
        session
            .renderer
            .print_lines(&format_plan_lines(&result.plan, style));
        session.finish_untransacted()?;
        return Ok(());
    }
    session
        .renderer
        .print_lines(&format_uninstall_lines(&result, style));
    if let Some(path) = &result.preservation_path {
        session.renderer.print_status(
            "step",
            &format!("backups of modified files: {}", path.display()),
        );
    }
    Ok(())
}

fn confirm_purge(session: &Session) -> Result<PurgeToken> {
    let layout = session.layout();
    let expected = PurgeToken::expected_answer(layout);
    if session.non_interactive {
        return Err(EngineError::PurgeNotConfirmed { expected }.into());
    }

    print!(
        "Purge deletes every tracked file under {}, including your edits. Type '{expected}' to confirm: ",
        layout.root().display()
    );
    io::stdout()
        .flush()
        .context("failed to flush purge prompt")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read purge confirmation")?;
    Ok(PurgeToken::confirm(layout, &answer)?)
}

pub(crate) fn run_verify(session: &Session) -> Result<()> {
    let layout = session.layout();
    let metadata = require_metadata(layout)?;
    let report = verify_installation(layout, &metadata)?;
    session
        .renderer
        .print_lines(&format_verify_lines(&report, session.renderer.style()));
    session.finish_untransacted()?;
    report
        .into_result()
        .map_err(|error| EngineError::Verification {
            error,
            rollback: None,
        })?;
    Ok(())
}

pub(crate) fn run_recover(session: &Session) -> Result<()> {
    let reports = session.engine.recover()?;
    if reports.is_empty() {
        session
            .renderer
            .print_status("ok", "no interrupted transactions found");
        session.finish_untransacted()?;
        return Ok(());
    }
    session.print_recovered(&reports);

    let unrestored = reports
        .iter()
        .map(|report| report.unrestored.len())
        .sum::<usize>();
    if unrestored > 0 {
        anyhow::bail!(
            "recovery finished with {unrestored} path(s) unrestored; restore them from {}",
            session.layout().transactions_staging_dir().display()
        );
    }
    session.renderer.print_status(
        "ok",
        &format!("recovered {} transaction(s)", reports.len()),
    );
    Ok(())
}
