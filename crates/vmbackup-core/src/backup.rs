//! Backup orchestrator for one virtual machine.
//!
//! This module sequences a full backup run:
//! 1. Resolve the VM by exact name
//! 2. Announce the run in the engine's audit log
//! 3. Create `<backup_root>/<vm>/<UTC timestamp>` and save the OVF there
//! 4. Purge stale snapshots, create a fresh one and wait until it is ready
//! 5. Find the snapshot's disk images across all storage domains
//! 6. Download every image through the transfer client
//! 7. Remove the snapshot, even if step 5 or 6 failed
//! 8. Announce completion
//!
//! # Example
//!
//! ```no_run
//! use vmbackup_core::{backup_vm, BackupOptions, GatewayConfig, HttpsProxyChannel, RestGateway};
//!
//! let config = GatewayConfig::new("https://engine.example.com", "admin@internal", "secret");
//! let gateway = RestGateway::connect(&config).unwrap();
//! let proxy = HttpsProxyChannel::new(None).unwrap();
//!
//! let report = backup_vm(&gateway, &proxy, "winxp", BackupOptions::new("/data/backup"), None).unwrap();
//! println!("{} disks saved to {}", report.disks.len(), report.backup_dir.display());
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, EventIdSequence, DEFAULT_ORIGIN};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::model::{sanitize_filename, DiskSnapshot, Snapshot, VirtualMachine};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::poll::PollPolicy;
use crate::proxy::ProxyChannel;
use crate::snapshot::SnapshotController;
use crate::transfer::{DiskBackup, DownloadProgress, TransferClient, DEFAULT_CHUNK_SIZE};

/// Timestamp layout of per-run backup directories.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Options for a backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Directory under which `<vm>/<timestamp>` is created.
    pub backup_root: PathBuf,
    /// Size of chunks read from the proxy (default 64 MiB).
    pub chunk_size: usize,
    /// Number of concurrent disk transfers (0 = one per CPU, 1 = sequential).
    pub workers: usize,
    /// Waiting for the snapshot to become ready.
    pub snapshot_policy: PollPolicy,
    /// Waiting for purged or torn-down snapshots to disappear.
    pub removal_policy: PollPolicy,
    /// Waiting for a transfer session to leave `initializing`.
    pub transfer_init_policy: PollPolicy,
    /// Waiting for a finalized transfer session to disappear.
    pub finalize_policy: PollPolicy,
    /// Checksum every image and write a JSON manifest next to the OVF.
    pub write_manifest: bool,
    /// Origin tag for audit events.
    pub origin: String,
    /// Refuse to back up when several VMs share the requested name.
    pub strict_vm_match: bool,
}

impl BackupOptions {
    /// Default options writing below `backup_root`.
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 1,
            snapshot_policy: PollPolicy::fixed(Duration::from_secs(1), Duration::from_secs(60 * 60)),
            removal_policy: PollPolicy::default(),
            transfer_init_policy: PollPolicy::fixed(Duration::from_secs(1), Duration::from_secs(10 * 60)),
            finalize_policy: PollPolicy::default(),
            write_manifest: false,
            origin: DEFAULT_ORIGIN.to_string(),
            strict_vm_match: false,
        }
    }

    /// Use the same policy for every poll loop.
    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.snapshot_policy = policy.clone();
        self.removal_policy = policy.clone();
        self.transfer_init_policy = policy.clone();
        self.finalize_policy = policy;
        self
    }
}

/// Phase of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    /// Resolving the VM by name.
    LookupVm,
    /// Creating the backup directory and saving the OVF.
    Prepare,
    /// Removing stale snapshots.
    Purge,
    /// Requesting the backup snapshot.
    CreateSnapshot,
    /// Waiting for the snapshot to become ready.
    AwaitSnapshot,
    /// Finding the snapshot's disk images.
    EnumerateDisks,
    /// Downloading disk images.
    Transfer,
    /// Removing the backup snapshot.
    Teardown,
    /// Backup complete.
    Complete,
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupPhase::LookupVm => write!(f, "VM lookup"),
            BackupPhase::Prepare => write!(f, "backup directory preparation"),
            BackupPhase::Purge => write!(f, "snapshot purge"),
            BackupPhase::CreateSnapshot => write!(f, "snapshot creation"),
            BackupPhase::AwaitSnapshot => write!(f, "snapshot readiness wait"),
            BackupPhase::EnumerateDisks => write!(f, "disk enumeration"),
            BackupPhase::Transfer => write!(f, "disk transfer"),
            BackupPhase::Teardown => write!(f, "snapshot teardown"),
            BackupPhase::Complete => write!(f, "completion"),
        }
    }
}

/// Progress notifications emitted during a run.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    /// A new phase started.
    Phase(BackupPhase),
    /// The download of a disk image is about to start.
    DiskStarted {
        /// Zero-based position in the disk list.
        index: usize,
        /// Number of disks in this run.
        total: usize,
        disk: DiskSnapshot,
    },
    /// Bytes of a disk image arrived.
    DiskProgress {
        disk_id: String,
        progress: DownloadProgress,
    },
    /// A disk image is fully on disk.
    DiskFinished { disk_id: String, bytes: u64 },
}

/// Type alias for the progress callback. Called from transfer workers, so it
/// must be thread-safe.
pub type EventCallback = Box<dyn Fn(BackupEvent) + Send + Sync>;

/// Summary of a successful backup run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub vm_id: String,
    pub vm_name: String,
    pub snapshot_id: String,
    pub snapshot_description: String,
    /// UTC timestamp naming the backup directory.
    pub timestamp: String,
    pub backup_dir: PathBuf,
    pub ovf_path: PathBuf,
    pub disks: Vec<DiskBackup>,
    /// Correlation ids of audit events the engine accepted.
    pub audit_events: Vec<i64>,
    /// Ids of stale snapshots removed before the backup.
    pub purged_snapshots: Vec<String>,
    /// Failures that were tolerated during the run.
    pub diagnostics: Vec<String>,
}

impl BackupReport {
    /// Total bytes of all disk images.
    pub fn total_bytes(&self) -> u64 {
        self.disks.iter().map(|disk| disk.bytes).sum()
    }
}

/// Drives backup runs against one engine session and proxy channel.
pub struct BackupOrchestrator<'a, G: Gateway + ?Sized, P: ProxyChannel + ?Sized> {
    gateway: &'a G,
    proxy: &'a P,
    options: BackupOptions,
    ids: EventIdSequence,
    cancel: CancellationToken,
    on_event: Option<EventCallback>,
}

impl<'a, G: Gateway + ?Sized, P: ProxyChannel + ?Sized> BackupOrchestrator<'a, G, P> {
    /// Create an orchestrator with event ids seeded from the clock.
    pub fn new(gateway: &'a G, proxy: &'a P, options: BackupOptions) -> Self {
        Self {
            gateway,
            proxy,
            options,
            ids: EventIdSequence::from_clock(),
            cancel: CancellationToken::new(),
            on_event: None,
        }
    }

    /// Use a specific event id sequence.
    pub fn with_event_ids(mut self, ids: EventIdSequence) -> Self {
        self.ids = ids;
        self
    }

    /// Abort the run when `cancel` fires. Teardown and finalize still run.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receive progress notifications.
    pub fn with_event_callback(mut self, on_event: EventCallback) -> Self {
        self.on_event = Some(on_event);
        self
    }

    /// Back up the VM named `vm_name`.
    pub fn run(&self, vm_name: &str) -> Result<BackupReport> {
        self.emit(BackupEvent::Phase(BackupPhase::LookupVm));
        let vm = self
            .resolve_vm(vm_name)
            .map_err(|e| e.in_phase(BackupPhase::LookupVm))?;
        info!(vm = %vm.name, id = %vm.id, "found virtual machine");

        let description = format!("{}-backup-{}", vm.name, Uuid::new_v4());
        let audit = AuditTrail::new(
            self.gateway,
            &self.ids,
            vm.id.as_str(),
            vm.name.as_str(),
            self.options.origin.as_str(),
        );
        audit.started(&description);

        match self.run_for_vm(&vm, &description) {
            Ok(mut report) => {
                audit.completed(&description);
                report.audit_events = audit.sent();
                report.diagnostics.extend(audit.failures());
                if self.options.write_manifest {
                    if let Err(err) = write_manifest(&vm, &report) {
                        warn!(error = %err, "failed to write backup manifest");
                        report.diagnostics.push(format!("manifest not written: {}", err));
                    }
                }
                self.emit(BackupEvent::Phase(BackupPhase::Complete));
                info!(
                    vm = %vm.name,
                    disks = report.disks.len(),
                    bytes = report.total_bytes(),
                    dir = %report.backup_dir.display(),
                    "backup completed"
                );
                Ok(report)
            }
            Err(err) => {
                audit.failed(&description, &err.to_string());
                Err(err)
            }
        }
    }

    /// Find the VM named `name`. Several VMs with that name resolve to the
    /// first one listed unless `strict_vm_match` is set.
    fn resolve_vm(&self, name: &str) -> Result<VirtualMachine> {
        // The engine's search is a pattern match, so narrow it to exact names.
        let mut matches: Vec<VirtualMachine> = self
            .gateway
            .find_vms_by_name(name)?
            .into_iter()
            .filter(|vm| vm.name == name)
            .collect();

        match matches.len() {
            0 => Err(Error::configuration(format!(
                "virtual machine '{}' not found",
                name
            ))),
            1 => Ok(matches.remove(0)),
            n if self.options.strict_vm_match => Err(Error::configuration(format!(
                "{} virtual machines are named '{}'",
                n, name
            ))),
            n => {
                let ids: Vec<&str> = matches.iter().map(|vm| vm.id.as_str()).collect();
                warn!(vm = name, count = n, ids = ?ids, "several virtual machines share this name, using the first");
                Ok(matches.remove(0))
            }
        }
    }

    fn run_for_vm(&self, vm: &VirtualMachine, description: &str) -> Result<BackupReport> {
        let mut diagnostics = Vec::new();

        self.emit(BackupEvent::Phase(BackupPhase::Prepare));
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let backup_dir = self
            .options
            .backup_root
            .join(sanitize_filename(&vm.name))
            .join(&timestamp);
        fs::create_dir_all(&backup_dir)
            .map_err(|e| Error::io(e, &backup_dir).in_phase(BackupPhase::Prepare))?;
        let ovf_path = write_ovf(vm, &backup_dir).map_err(|e| e.in_phase(BackupPhase::Prepare))?;

        let controller = SnapshotController::new(self.gateway, vm)
            .with_ready_policy(self.options.snapshot_policy.clone())
            .with_removal_policy(self.options.removal_policy.clone())
            .with_cancellation(self.cancel.clone());

        self.emit(BackupEvent::Phase(BackupPhase::Purge));
        let purge = controller.purge_existing();
        diagnostics.extend(purge.diagnostics());

        self.emit(BackupEvent::Phase(BackupPhase::CreateSnapshot));
        let snapshot = self
            .cancel
            .check()
            .and_then(|()| controller.create(description))
            .map_err(|e| e.in_phase(BackupPhase::CreateSnapshot))?;

        // From here on the snapshot exists and must be removed whatever
        // happens, so teardown gets a token that cancellation cannot trip.
        let outcome = self.use_snapshot(&controller, snapshot.clone(), &backup_dir);

        self.emit(BackupEvent::Phase(BackupPhase::Teardown));
        let teardown = SnapshotController::new(self.gateway, vm)
            .with_removal_policy(self.options.removal_policy.clone())
            .teardown(&snapshot);

        let disks = match (outcome, teardown) {
            (Ok(disks), Ok(())) => disks,
            (Ok(_), Err(err)) => return Err(err.in_phase(BackupPhase::Teardown)),
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(teardown_err)) => {
                warn!(
                    snapshot = %snapshot.id,
                    description,
                    error = %teardown_err,
                    "snapshot left behind after failed backup, remove it manually"
                );
                return Err(Error::SnapshotLeftBehind {
                    snapshot_id: snapshot.id.clone(),
                    description: description.to_string(),
                    reason: teardown_err.to_string(),
                    source: Box::new(err),
                });
            }
        };

        diagnostics.extend(disks.iter().filter_map(|disk| {
            disk.finalize_error
                .as_ref()
                .map(|reason| format!("transfer of {} not finalized: {}", disk.disk_snapshot_id, reason))
        }));

        Ok(BackupReport {
            vm_id: vm.id.clone(),
            vm_name: vm.name.clone(),
            snapshot_id: snapshot.id,
            snapshot_description: description.to_string(),
            timestamp,
            backup_dir,
            ovf_path,
            disks,
            audit_events: Vec::new(),
            purged_snapshots: purge.removed,
            diagnostics,
        })
    }

    fn use_snapshot(
        &self,
        controller: &SnapshotController<'_, G>,
        snapshot: Snapshot,
        backup_dir: &Path,
    ) -> Result<Vec<DiskBackup>> {
        self.emit(BackupEvent::Phase(BackupPhase::AwaitSnapshot));
        let snapshot = controller
            .await_ready(snapshot)
            .map_err(|e| e.in_phase(BackupPhase::AwaitSnapshot))?;

        self.emit(BackupEvent::Phase(BackupPhase::EnumerateDisks));
        let disks = snapshot_disks(self.gateway, &snapshot.id)
            .map_err(|e| e.in_phase(BackupPhase::EnumerateDisks))?;
        info!(snapshot = %snapshot.id, disks = disks.len(), "found disk snapshots");

        self.emit(BackupEvent::Phase(BackupPhase::Transfer));
        self.transfer_disks(disks, backup_dir)
            .map_err(|e| e.in_phase(BackupPhase::Transfer))
    }

    fn transfer_disks(&self, disks: Vec<DiskSnapshot>, backup_dir: &Path) -> Result<Vec<DiskBackup>> {
        let pipeline = Pipeline::new(PipelineConfig::new(self.options.workers))?;
        // A failed disk stops the others without cancelling the caller's token.
        let transfer_cancel = self.cancel.child();
        let client = TransferClient::new(self.gateway, self.proxy)
            .with_chunk_size(self.options.chunk_size)
            .with_checksum(self.options.write_manifest)
            .with_init_policy(self.options.transfer_init_policy.clone())
            .with_finalize_policy(self.options.finalize_policy.clone())
            .with_cancellation(transfer_cancel.clone());

        let total = disks.len();
        let results = pipeline.process(disks, |index, disk| {
            transfer_cancel.check()?;
            self.emit(BackupEvent::DiskStarted {
                index,
                total,
                disk: disk.clone(),
            });

            let mut on_progress = |progress: DownloadProgress| {
                self.emit(BackupEvent::DiskProgress {
                    disk_id: disk.id.clone(),
                    progress,
                });
            };

            match client.transfer_disk(&disk, backup_dir, &mut on_progress) {
                Ok(backup) => {
                    self.emit(BackupEvent::DiskFinished {
                        disk_id: disk.id.clone(),
                        bytes: backup.bytes,
                    });
                    Ok(backup)
                }
                Err(err) => {
                    warn!(disk = %disk.id, alias = %disk.alias, error = %err, "disk transfer failed");
                    transfer_cancel.cancel();
                    Err(err)
                }
            }
        });

        let mut backups = Vec::with_capacity(total);
        let mut first_error: Option<Error> = None;
        for result in results {
            match result {
                Ok(backup) => backups.push(backup),
                Err(err) => {
                    // Prefer the failure that caused the cancellation over
                    // the cancellations it triggered.
                    let replace = match &first_error {
                        None => true,
                        Some(current) => current.is_cancelled() && !err.is_cancelled(),
                    };
                    if replace {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(backups),
        }
    }

    fn emit(&self, event: BackupEvent) {
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }
}

/// Back up the VM named `vm_name` with default event ids and no cancellation.
pub fn backup_vm<G: Gateway + ?Sized, P: ProxyChannel + ?Sized>(
    gateway: &G,
    proxy: &P,
    vm_name: &str,
    options: BackupOptions,
    on_event: Option<EventCallback>,
) -> Result<BackupReport> {
    let mut orchestrator = BackupOrchestrator::new(gateway, proxy, options);
    if let Some(on_event) = on_event {
        orchestrator = orchestrator.with_event_callback(on_event);
    }
    orchestrator.run(vm_name)
}

/// Find the disk images of `snapshot_id` across every storage domain.
///
/// The engine offers no per-snapshot query, so every domain's full list is
/// fetched and filtered. Order follows the listings and is not guaranteed.
pub fn snapshot_disks<G: Gateway + ?Sized>(gateway: &G, snapshot_id: &str) -> Result<Vec<DiskSnapshot>> {
    let mut disks = Vec::new();
    for domain in gateway.list_storage_domains()? {
        let matching = gateway
            .list_disk_snapshots(&domain.id)?
            .into_iter()
            .filter(|disk| disk.belongs_to(snapshot_id));
        disks.extend(matching);
    }
    Ok(disks)
}

/// Save the VM's OVF as `<name>-<id>.ovf` in `backup_dir`.
fn write_ovf(vm: &VirtualMachine, backup_dir: &Path) -> Result<PathBuf> {
    let ovf = vm.ovf.as_deref().ok_or_else(|| {
        Error::configuration(format!(
            "virtual machine '{}' carries no OVF configuration",
            vm.name
        ))
    })?;

    let path = backup_dir.join(format!("{}-{}.ovf", sanitize_filename(&vm.name), vm.id));
    fs::write(&path, ovf.as_bytes()).map_err(|e| Error::io(e, &path))?;
    info!(path = %path.display(), "wrote OVF");
    Ok(path)
}

/// Save the report as `<name>-<id>.manifest.json` in the backup directory.
fn write_manifest(vm: &VirtualMachine, report: &BackupReport) -> Result<PathBuf> {
    let path = report
        .backup_dir
        .join(format!("{}-{}.manifest.json", sanitize_filename(&vm.name), vm.id));
    let json = serde_json::to_vec_pretty(report)
        .map_err(|e| Error::io(std::io::Error::other(e), &path))?;
    fs::write(&path, json).map_err(|e| Error::io(e, &path))?;
    Ok(path)
}
