use std::{
    io::{self, Write},
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use speechctl::{
    cancel::CancelToken,
    core::settings::Settings,
    error::InstallError,
    install::{progress_fraction, InstallRecord, RepairReport},
    installer::{CheckReport, ComponentCheck, InstallOutcome, InstallRequest, InstallStatus, Installer},
    manifest::Component,
    selector::{CpuReason, DeviceDecision, DevicePreference, SelectionWarning},
};

#[derive(Debug, Parser)]
#[command(
    name = "speechctl",
    about = "Install and inspect prebuilt speech assets (STT/TTS)",
    version,
    after_help = "Environment: SPEECH_MODELS_DIR, SPEECH_BIN_DIR, SPEECH_MANIFEST_URL, \
                  SPEECH_FORCE_CPU, SPEECHCTL_LOG, SPEECHCTL_LOG_FORMAT"
)]
pub struct Cli {
    /// Debug-level diagnostics on stderr.
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Speech-to-text assets: show status, or install with --install.
    Stt(SttArgs),
    /// Text-to-speech assets: show status, or install with --install.
    Tts(TtsArgs),
    /// Verify every recorded install against what is on disk.
    Check(ReportArgs),
    /// List recorded installs.
    List(ReportArgs),
    /// Rebuild the install store from published directories.
    Repair(ReportArgs),
    /// Print the version.
    Version,
}

#[derive(Debug, Args)]
pub struct SttArgs {
    #[command(flatten)]
    pub common: InstallArgs,
    /// Model selection (per release manifest).
    #[arg(long, value_name = "NAME")]
    pub model: Option<String>,
}

#[derive(Debug, Args)]
pub struct TtsArgs {
    #[command(flatten)]
    pub common: InstallArgs,
    /// Voice selection (per release manifest).
    #[arg(long, value_name = "NAME")]
    pub voice: Option<String>,
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Download and install the assets.
    #[arg(long)]
    pub install: bool,
    /// Install root.
    #[arg(long, value_name = "DIR")]
    pub dest: Option<PathBuf>,
    #[arg(long, value_name = "cpu|gpu|auto", default_value = "auto")]
    pub device: DevicePreference,
    /// Manifest URL or path.
    #[arg(long, value_name = "URL")]
    pub manifest: Option<String>,
    /// Fail instead of touching the network.
    #[arg(long)]
    pub offline: bool,
    /// Re-resolve the manifest and reinstall even if present.
    #[arg(long)]
    pub upgrade: bool,
    #[arg(long)]
    pub json: bool,
    /// Give up after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long, value_name = "DIR")]
    pub dest: Option<PathBuf>,
    #[arg(long)]
    pub json: bool,
}

impl Command {
    pub fn json(&self) -> bool {
        match self {
            Command::Stt(args) => args.common.json,
            Command::Tts(args) => args.common.json,
            Command::Check(args) | Command::List(args) | Command::Repair(args) => args.json,
            Command::Version => false,
        }
    }

    /// Cancellation for the whole run, bounded by `--timeout` when given.
    pub fn cancel_token(&self) -> CancelToken {
        match self.timeout() {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::new(),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self {
            Command::Stt(args) => args.common.timeout,
            Command::Tts(args) => args.common.timeout,
            _ => None,
        }
        .map(Duration::from_secs)
    }
}

/// Outcome of a command that ran to completion.
pub enum Completion {
    Success,
    /// `check` found problems.
    Unhealthy,
}

pub fn run(command: Command, cancel: &CancelToken) -> Result<Completion> {
    if let Command::Version = command {
        println!("speechctl version {}", env!("CARGO_PKG_VERSION"));
        return Ok(Completion::Success);
    }

    let settings = Settings::load(env!("CARGO_PKG_VERSION"))?;
    let installer = Installer::new(settings)?;
    let mut out = io::stdout().lock();

    match command {
        Command::Stt(args) => {
            component(&installer, Component::Stt, args.common, args.model, cancel, &mut out)
        }
        Command::Tts(args) => {
            component(&installer, Component::Tts, args.common, args.voice, cancel, &mut out)
        }
        Command::Check(args) => {
            let report = installer.check(args.dest.as_deref())?;
            if args.json {
                write_json(&mut out, &report)?;
            } else {
                render_check(&mut out, &report)?;
            }
            Ok(if report.ok {
                Completion::Success
            } else {
                Completion::Unhealthy
            })
        }
        Command::List(args) => {
            let records = installer.list(args.dest.as_deref())?;
            if args.json {
                write_json(&mut out, &records)?;
            } else {
                render_list(&mut out, &records)?;
            }
            Ok(Completion::Success)
        }
        Command::Repair(args) => {
            let report = installer.repair(args.dest.as_deref(), cancel)?;
            if args.json {
                write_json(&mut out, &report)?;
            } else {
                render_repair(&mut out, &report)?;
            }
            Ok(Completion::Success)
        }
        Command::Version => Ok(Completion::Success),
    }
}

fn component(
    installer: &Installer,
    component: Component,
    args: InstallArgs,
    variant: Option<String>,
    cancel: &CancelToken,
    out: &mut impl Write,
) -> Result<Completion> {
    if !args.install {
        let report = installer.check(args.dest.as_deref())?;
        let entries: Vec<&ComponentCheck> = report
            .components
            .iter()
            .filter(|check| check.component == component)
            .collect();
        if args.json {
            write_json(out, &entries)?;
        } else if entries.is_empty() {
            writeln!(out, "{component}: not installed")?;
        } else {
            for entry in &entries {
                render_component_check(out, entry)?;
            }
        }
        return Ok(Completion::Success);
    }

    let request = InstallRequest {
        component,
        dest: args.dest,
        device: args.device,
        variant: variant.unwrap_or_default(),
        manifest: args.manifest,
        offline: args.offline,
        upgrade: args.upgrade,
    };
    let last_decile = AtomicU32::new(0);
    let outcome = installer
        .install_with_progress(&request, cancel, &|done, total| {
            let decile = (progress_fraction(done, total) * 10.0) as u32;
            if decile > last_decile.fetch_max(decile, Ordering::Relaxed) {
                info!(percent = decile * 10, bytes = done, "downloading {component}");
            }
        })
        .with_context(|| format!("{component} install failed"))?;

    if args.json {
        write_json(out, &outcome)?;
    } else {
        render_outcome(out, &outcome)?;
    }
    Ok(Completion::Success)
}

fn write_json<T: Serialize + ?Sized>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).context("encode json output")?;
    writeln!(out)?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    kind: Option<speechctl::error::ErrorKind>,
    message: String,
    exit_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
}

pub fn render_error_json(err: &anyhow::Error, exit_code: u8) -> Result<()> {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<InstallError>())
        .map(InstallError::kind);
    let root = err.root_cause().to_string();
    let message = err.to_string();
    let body = ErrorBody {
        kind,
        source: (root != message).then_some(root.as_str()),
        message,
        exit_code,
    };
    let mut out = io::stdout().lock();
    write_json(&mut out, &serde_json::json!({ "error": body }))
}

fn describe_variant(variant: &str) -> &str {
    if variant.is_empty() {
        "default"
    } else {
        variant
    }
}

fn render_outcome(out: &mut impl Write, outcome: &InstallOutcome) -> io::Result<()> {
    let variant = describe_variant(&outcome.variant);
    match outcome.status {
        InstallStatus::UpToDate => writeln!(
            out,
            "{} {variant} {} is up to date ({})",
            outcome.component,
            outcome.version,
            outcome.installed_path.display()
        )?,
        status => {
            let verb = match status {
                InstallStatus::Upgraded => "upgraded",
                InstallStatus::Reinstalled => "reinstalled",
                _ => "installed",
            };
            writeln!(
                out,
                "{verb} {} {variant} {} [{}] -> {}",
                outcome.component,
                outcome.version,
                outcome.device,
                outcome.installed_path.display()
            )?;
        }
    }
    if let DeviceDecision::AutoCpu { reason } = outcome.device_decision {
        let why = match reason {
            CpuReason::NoGpuDetected => "no GPU detected",
            CpuReason::NoGpuArtifact => "no GPU build for this platform",
        };
        writeln!(out, "  device: cpu ({why})")?;
    }
    for warning in &outcome.warnings {
        match warning {
            SelectionWarning::DuplicateCandidates { key, count } => {
                writeln!(out, "  warning: manifest lists {key} {count} times; kept the largest")?;
            }
        }
    }
    for link in &outcome.linked {
        writeln!(out, "  linked {}", link.display())?;
    }
    Ok(())
}

fn render_component_check(out: &mut impl Write, check: &ComponentCheck) -> io::Result<()> {
    let state = if check.ok { "ok" } else { "BROKEN" };
    write!(
        out,
        "{:<4} {:<20} {:<12} {:<4} {state}",
        check.component.as_str(),
        describe_variant(&check.variant),
        check.version,
        check.device.as_str()
    )?;
    match &check.detail {
        Some(detail) => writeln!(out, ": {detail}"),
        None => writeln!(out),
    }
}

fn render_check(out: &mut impl Write, report: &CheckReport) -> io::Result<()> {
    if report.components.is_empty() {
        return writeln!(out, "no speech assets installed in {}", report.root.display());
    }
    for check in &report.components {
        render_component_check(out, check)?;
    }
    if !report.ok {
        writeln!(out, "run `speechctl stt|tts --install --upgrade` to reinstall broken assets")?;
    }
    Ok(())
}

fn render_list(out: &mut impl Write, records: &[InstallRecord]) -> io::Result<()> {
    if records.is_empty() {
        return writeln!(out, "no speech assets installed");
    }
    for record in records {
        writeln!(
            out,
            "{:<4} {:<20} {:<12} {:<4} {}  {}",
            record.component.as_str(),
            describe_variant(&record.variant),
            record.release_version,
            record.device.as_str(),
            record.installed_at.date(),
            record.install_path.display()
        )?;
    }
    Ok(())
}

fn render_repair(out: &mut impl Write, report: &RepairReport) -> io::Result<()> {
    if let Some(aside) = &report.moved_aside {
        writeln!(out, "moved corrupt store to {}", aside.display())?;
    }
    writeln!(out, "recovered {} install(s)", report.recovered.len())?;
    for dir in &report.removed_dirs {
        writeln!(out, "removed stale {}", dir.display())?;
    }
    Ok(())
}
