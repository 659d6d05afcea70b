use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use anyhow::Error;
use frameset_installer::{
    Action, EngineError, InstallResult, RecoveryReport, UninstallResult, UpdateResult,
    VerifyReport,
};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, no_color: bool) -> OutputStyle {
    if stdout_is_tty && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

/// Spinner shown while a transaction runs; plain output gets none.
pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!();
            println!("{}", colorize(section_style(), &line));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed_precise}")
            {
                progress_bar.set_style(style.tick_chars(progress_tick_chars(label)));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    pub(crate) fn finish_success(mut self, actions: usize) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        if let Some(line) =
            render_progress_line(self.style, &self.label, actions, self.started_at.elapsed())
        {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "update" => "<^>v ",
        "uninstall" => "\\|/- ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

fn render_progress_line(
    style: OutputStyle,
    label: &str,
    actions: usize,
    elapsed: Duration,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }
    Some(format!(
        "{} {} action(s) complete in {}",
        colorize(progress_label_style(), label),
        HumanCount(actions as u64),
        format_elapsed(elapsed)
    ))
}

pub(crate) fn format_plan_lines(plan: &[Action], style: OutputStyle) -> Vec<String> {
    if plan.is_empty() {
        return vec![render_status_line(style, "ok", "nothing to do")];
    }
    plan.iter()
        .map(|action| render_status_line(style, "step", &format!("would {action}")))
        .collect()
}

pub(crate) fn format_recovery_lines(reports: &[RecoveryReport], style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for report in reports {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "rolled back interrupted {} transaction {} ({} action(s) reverted)",
                report.operation, report.txid, report.reverted
            ),
        ));
        for path in &report.unrestored {
            lines.push(render_status_line(
                style,
                "err",
                &format!("could not restore {path}"),
            ));
        }
    }
    lines
}

pub(crate) fn format_install_lines(
    name: &str,
    result: &InstallResult,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = Vec::new();
    let version = result
        .metadata
        .as_ref()
        .map(|metadata| metadata.version.to_string());
    match (&result.txid, version) {
        (Some(txid), Some(version)) => lines.push(render_status_line(
            style,
            "ok",
            &format!(
                "installed {name} {version}: {} file(s) written, {} already present (transaction {txid})",
                result.installed_files.len(),
                result.already_present.len()
            ),
        )),
        _ => lines.push(render_status_line(
            style,
            "ok",
            &format!("{name} is already installed"),
        )),
    }
    for path in &result.conflicts {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "left {} in place: it differs from the framework copy (use --force to replace)",
                path.display()
            ),
        ));
    }
    for skipped in &result.skipped {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("skipped optional component {}: {}", skipped.name, skipped.reason),
        ));
    }
    lines
}

pub(crate) fn format_update_lines(result: &UpdateResult, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    match &result.txid {
        Some(txid) => lines.push(render_status_line(
            style,
            "ok",
            &format!(
                "updated {} -> {}: {} updated, {} created, {} merged, {} deleted, {} preserved (transaction {txid})",
                result.from_version,
                result.to_version,
                result.updated_files.len(),
                result.created_files.len(),
                result.merged_files.len(),
                result.deleted_files.len(),
                result.preserved_files.len()
            ),
        )),
        None => lines.push(render_status_line(
            style,
            "ok",
            &format!("installation is already at {}", result.to_version),
        )),
    }
    for path in &result.merged_files {
        lines.push(render_status_line(
            style,
            "step",
            &format!("merged new settings into {}", path.display()),
        ));
    }
    for path in &result.preserved_files {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("kept local changes in {}", path.display()),
        ));
    }
    if let (Some(_), Some(backup)) = (&result.txid, &result.backup_path) {
        lines.push(render_status_line(
            style,
            "step",
            &format!("previous versions saved to {}", backup.display()),
        ));
    }
    for skipped in &result.skipped {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("skipped optional component {}: {}", skipped.name, skipped.reason),
        ));
    }
    lines
}

pub(crate) fn format_uninstall_lines(result: &UninstallResult, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!("removed {} file(s)", result.removed_files.len()),
    )];
    for preserved in &result.preserved_files {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "saved modified {} to {}",
                preserved.original.display(),
                preserved.backup.display()
            ),
        ));
    }
    for path in &result.kept_files {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("left modified {} in place", path.display()),
        ));
    }
    for path in &result.refused_paths {
        lines.push(render_status_line(
            style,
            "err",
            &format!("refused to remove {}: outside the target root", path.display()),
        ));
    }
    lines
}

pub(crate) fn format_verify_lines(report: &VerifyReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for path in &report.missing {
        lines.push(render_status_line(
            style,
            "err",
            &format!("missing {}", path.display()),
        ));
    }
    for path in &report.modified {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("modified {}", path.display()),
        ));
    }
    let summary = format!(
        "verify summary: checked={} missing={} modified={}",
        report.checked,
        report.missing.len(),
        report.modified.len()
    );
    let status = if report.missing.is_empty() { "ok" } else { "err" };
    lines.push(render_status_line(style, status, &summary));
    lines
}

/// Error message, any paths a failed rollback left behind, and a hint.
pub(crate) fn format_failure_lines(err: &Error, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(style, "err", &format!("{err:#}"))];
    let engine = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>());
    if let Some(engine) = engine {
        if let EngineError::Rollback { rollback, .. } = engine {
            for path in &rollback.unrestored {
                lines.push(render_status_line(
                    style,
                    "err",
                    &format!("not restored: {path}"),
                ));
            }
        }
        lines.push(format!("hint: {}", engine.remediation()));
    }
    lines
}
