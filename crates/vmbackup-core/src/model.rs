//! Domain types for the resources the backup workflow touches on the engine.

/// A virtual machine as found by name on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachine {
    /// Engine-assigned identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Serialized OVF configuration, only present when the VM was fetched
    /// with all content.
    pub ovf: Option<String>,
}

/// Status of a VM snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Fully created and usable.
    Ok,
    /// Being created or removed.
    Locked,
    /// Previewed by the VM.
    InPreview,
    /// Anything else the engine may report.
    Unknown,
}

impl SnapshotStatus {
    /// Parse the engine's wire spelling.
    pub fn parse(value: &str) -> Self {
        match value {
            "ok" => SnapshotStatus::Ok,
            "locked" => SnapshotStatus::Locked,
            "in_preview" => SnapshotStatus::InPreview,
            _ => SnapshotStatus::Unknown,
        }
    }

    /// The engine's wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Ok => "ok",
            SnapshotStatus::Locked => "locked",
            SnapshotStatus::InPreview => "in_preview",
            SnapshotStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a VM snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    /// The live state of the VM. Listed alongside real snapshots but cannot
    /// be removed.
    Active,
    /// A snapshot taken on request.
    Regular,
    /// A snapshot being previewed.
    Preview,
    /// A snapshot backing a stateless run.
    Stateless,
    /// Anything else the engine may report.
    Unknown,
}

impl SnapshotType {
    /// Parse the engine's wire spelling.
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => SnapshotType::Active,
            "regular" => SnapshotType::Regular,
            "preview" => SnapshotType::Preview,
            "stateless" => SnapshotType::Stateless,
            _ => SnapshotType::Unknown,
        }
    }
}

/// A point-in-time capture of a VM's disks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub description: String,
    pub status: SnapshotStatus,
    pub snapshot_type: SnapshotType,
}

impl Snapshot {
    /// Whether the snapshot is fully created.
    pub fn is_ready(&self) -> bool {
        self.status == SnapshotStatus::Ok
    }
}

/// A storage domain holding disk images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDomain {
    pub id: String,
    pub name: String,
}

/// The image of one disk inside a VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSnapshot {
    pub id: String,
    pub alias: String,
    /// Identifier of the disk this image belongs to.
    pub disk_id: Option<String>,
    /// Identifier of the VM snapshot that owns this image.
    pub snapshot_id: Option<String>,
}

impl DiskSnapshot {
    /// Whether this image belongs to the given VM snapshot.
    pub fn belongs_to(&self, snapshot_id: &str) -> bool {
        self.snapshot_id.as_deref() == Some(snapshot_id)
    }

    /// File name the image is stored under: `<alias>-<id>`.
    pub fn file_name(&self) -> String {
        sanitize_filename(&format!("{}-{}", self.alias, self.id))
    }
}

/// Replace characters that are unsafe in a path component.
///
/// Empty and all-dot names become `_` so the result never names the
/// current or parent directory.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        sanitized
    }
}

/// Direction of an image transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    /// The engine's wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Download => "download",
            TransferDirection::Upload => "upload",
        }
    }
}

/// Phase of an image transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Initializing,
    Transferring,
    Resuming,
    PausedSystem,
    PausedUser,
    Cancelled,
    FinalizingSuccess,
    FinalizingFailure,
    FinishedSuccess,
    FinishedFailure,
    Unknown,
}

impl TransferPhase {
    /// Parse the engine's wire spelling.
    pub fn parse(value: &str) -> Self {
        match value {
            "initializing" => TransferPhase::Initializing,
            "transferring" => TransferPhase::Transferring,
            "resuming" => TransferPhase::Resuming,
            "paused_system" => TransferPhase::PausedSystem,
            "paused_user" => TransferPhase::PausedUser,
            "cancelled" => TransferPhase::Cancelled,
            "finalizing_success" => TransferPhase::FinalizingSuccess,
            "finalizing_failure" => TransferPhase::FinalizingFailure,
            "finished_success" => TransferPhase::FinishedSuccess,
            "finished_failure" => TransferPhase::FinishedFailure,
            _ => TransferPhase::Unknown,
        }
    }

    /// The engine's wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPhase::Initializing => "initializing",
            TransferPhase::Transferring => "transferring",
            TransferPhase::Resuming => "resuming",
            TransferPhase::PausedSystem => "paused_system",
            TransferPhase::PausedUser => "paused_user",
            TransferPhase::Cancelled => "cancelled",
            TransferPhase::FinalizingSuccess => "finalizing_success",
            TransferPhase::FinalizingFailure => "finalizing_failure",
            TransferPhase::FinishedSuccess => "finished_success",
            TransferPhase::FinishedFailure => "finished_failure",
            TransferPhase::Unknown => "unknown",
        }
    }

    /// Whether bytes cannot flow in this phase.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            TransferPhase::PausedSystem
                | TransferPhase::PausedUser
                | TransferPhase::Cancelled
                | TransferPhase::FinalizingFailure
                | TransferPhase::FinishedFailure
        )
    }
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image transfer session as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTransfer {
    pub id: String,
    pub phase: TransferPhase,
    /// Ticket sent as the `Authorization` header to the proxy.
    pub signed_ticket: Option<String>,
    /// Endpoint of the imageio proxy.
    pub proxy_url: Option<String>,
    /// Endpoint of the imageio daemon on the host, used when no proxy is set.
    pub transfer_url: Option<String>,
}

impl ImageTransfer {
    /// The endpoint bytes are fetched from.
    pub fn endpoint(&self) -> Option<&str> {
        self.proxy_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .or(self.transfer_url.as_deref())
    }
}

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Error,
    Alert,
}

impl Severity {
    /// The engine's wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Alert => "alert",
        }
    }
}

/// An external event recorded in the engine's audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub vm_id: String,
    pub origin: String,
    pub severity: Severity,
    /// Caller-chosen correlation id, unique per origin.
    pub custom_id: i64,
    pub description: String,
}
