//! ovirtvmbackup CLI - Back up oVirt virtual machines through the engine API.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::error;
use tracing_subscriber::EnvFilter;
use vmbackup_core::{
    BackupEvent, BackupOptions, BackupOrchestrator, BackupPhase, BackupReport, EventCallback,
    GatewayConfig, HttpsProxyChannel, PollPolicy, RestGateway,
};

/// Back up a running oVirt VM: snapshot it, download its disks and OVF, then
/// remove the snapshot.
#[derive(Parser)]
#[command(name = "ovirtvmbackup")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Name of the virtual machine to back up.
    vmname: String,

    /// Directory receiving `<vmname>/<timestamp>/`.
    #[arg(long)]
    backup_dir: PathBuf,

    /// Engine base URL, e.g. https://engine.example.com.
    #[arg(long)]
    engine_url: String,

    /// Engine user including profile, e.g. admin@internal.
    #[arg(long)]
    username: String,

    /// File holding the password. Prompted for when omitted.
    #[arg(long)]
    password_file: Option<PathBuf>,

    /// CA certificate (PEM) used to verify the engine and imageio proxy.
    #[arg(short, long)]
    cafile: Option<PathBuf>,

    /// Number of disks downloaded concurrently (0 = one per CPU).
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Chunk size in megabytes for downloads (1 to 1024).
    #[arg(long, default_value = "64", value_parser = clap::value_parser!(u64).range(1..=1024))]
    chunk_size: u64,

    /// Seconds to wait for the snapshot to become ready.
    #[arg(long, default_value = "3600")]
    snapshot_timeout: u64,

    /// Checksum every image and write a JSON manifest next to the OVF.
    #[arg(long)]
    manifest: bool,

    /// Suppress progress output.
    #[arg(short, long)]
    quiet: bool,

    /// Write debug logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(cli.log_file.as_deref()) {
        eprintln!("Error: {:#}", err);
        return ExitCode::from(2);
    }

    match run_backup(&cli) {
        Ok(report) => {
            if !cli.quiet {
                print_summary(&report);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_status(&err))
        }
    }
}

/// Map a failure onto the process exit status.
fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<vmbackup_core::Error>() {
        Some(err) if err.is_cancelled() => 130,
        Some(err) if err.is_configuration() => 2,
        Some(_) => 1,
        // Failures before the engine is contacted are setup problems.
        None => 2,
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run_backup(cli: &Cli) -> Result<BackupReport> {
    let password = read_password(cli.password_file.as_deref(), &cli.username)?;

    let config = GatewayConfig::new(&cli.engine_url, &cli.username, password)
        .with_ca_file(cli.cafile.clone());
    let gateway = RestGateway::connect(&config)?;
    let proxy = HttpsProxyChannel::new(cli.cafile.as_deref())?;

    let mut options = BackupOptions::new(&cli.backup_dir);
    options.chunk_size = (cli.chunk_size * 1024 * 1024) as usize;
    options.workers = cli.workers;
    options.write_manifest = cli.manifest;
    options.snapshot_policy = PollPolicy::fixed(
        Duration::from_secs(1),
        Duration::from_secs(cli.snapshot_timeout),
    );

    if !cli.quiet {
        println!("VM Backup");
        println!("---------");
        println!("VM:        {}", cli.vmname);
        println!("Engine:    {}", config.api_url());
        println!("Target:    {}", cli.backup_dir.display());
        println!();
    }

    let mut orchestrator = BackupOrchestrator::new(&gateway, &proxy, options);
    if !cli.quiet {
        orchestrator = orchestrator.with_event_callback(progress_callback());
    }

    Ok(orchestrator.run(&cli.vmname)?)
}

/// Read the password from `path`, or prompt for it.
fn read_password(path: Option<&Path>, username: &str) -> Result<String> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read password file {}", path.display()))?;
            Ok(strip_newline(contents))
        }
        None => Password::new()
            .with_prompt(format!("Password for {}", username))
            .interact()
            .context("failed to read password"),
    }
}

/// Drop one trailing line terminator.
fn strip_newline(mut value: String) -> String {
    if value.ends_with('\n') {
        value.pop();
        if value.ends_with('\r') {
            value.pop();
        }
    }
    value
}

/// Build a callback drawing one bar per disk below a phase spinner.
fn progress_callback() -> EventCallback {
    let multi = MultiProgress::new();
    let status = multi.add(ProgressBar::new_spinner());
    status.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    status.enable_steady_tick(Duration::from_millis(120));

    let bar_style = ProgressStyle::default_bar()
        .template("  {msg:24} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");

    let bars: Mutex<HashMap<String, ProgressBar>> = Mutex::new(HashMap::new());

    Box::new(move |event: BackupEvent| match event {
        BackupEvent::Phase(BackupPhase::Complete) => {
            status.finish_with_message("Complete!");
        }
        BackupEvent::Phase(phase) => {
            status.set_message(format!("{}...", capitalize(&phase.to_string())));
        }
        BackupEvent::DiskStarted { index, total, disk } => {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(bar_style.clone());
            bar.set_message(format!("[{}/{}] {}", index + 1, total, disk.alias));
            if let Ok(mut bars) = bars.lock() {
                bars.insert(disk.id, bar);
            }
        }
        BackupEvent::DiskProgress { disk_id, progress } => {
            if let Ok(bars) = bars.lock() {
                if let Some(bar) = bars.get(&disk_id) {
                    bar.set_length(progress.bytes_total);
                    bar.set_position(progress.bytes_received);
                }
            }
        }
        BackupEvent::DiskFinished { disk_id, bytes } => {
            if let Ok(bars) = bars.lock() {
                if let Some(bar) = bars.get(&disk_id) {
                    bar.set_length(bytes);
                    bar.finish();
                }
            }
        }
    })
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn print_summary(report: &BackupReport) {
    println!();
    println!("Backup completed successfully: {}", report.backup_dir.display());
    println!("Snapshot:  {}", report.snapshot_description);
    println!("OVF:       {}", report.ovf_path.display());

    if report.disks.is_empty() {
        println!("Disks:     None");
    } else {
        println!("Disks:");
        for (i, disk) in report.disks.iter().enumerate() {
            println!(
                "  {}. {} - {}",
                i + 1,
                disk.path.display(),
                format_bytes(disk.bytes)
            );
        }
        println!();
        println!("Total size: {}", format_bytes(report.total_bytes()));
    }

    for diagnostic in &report.diagnostics {
        println!("Warning:   {}", diagnostic);
    }
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
