//! Error types for the backup core library.

use std::path::PathBuf;
use std::time::Duration;

use crate::backup::BackupPhase;

/// Classification of a failed management API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The engine could not be reached or the connection dropped.
    Network,
    /// Credentials were rejected or the user lacks permission.
    Auth,
    /// The addressed resource does not exist (anymore).
    NotFound,
    /// The resource is locked or in a state that forbids the request.
    Conflict,
    /// The engine answered with something we could not decode.
    Protocol,
    /// Any other failure reported by the engine.
    Other,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteErrorKind::Network => write!(f, "network"),
            RemoteErrorKind::Auth => write!(f, "authentication"),
            RemoteErrorKind::NotFound => write!(f, "not found"),
            RemoteErrorKind::Conflict => write!(f, "conflict"),
            RemoteErrorKind::Protocol => write!(f, "protocol"),
            RemoteErrorKind::Other => write!(f, "remote"),
        }
    }
}

/// The main error type for backup operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A management API call failed.
    #[error("remote API error ({kind}) during {operation}: {message}")]
    RemoteApi {
        operation: String,
        kind: RemoteErrorKind,
        message: String,
    },

    /// The snapshot never reached the `ok` status.
    #[error("snapshot '{snapshot_id}' not ready after {waited:?}")]
    SnapshotTimeout { snapshot_id: String, waited: Duration },

    /// A poll loop ran past its deadline.
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },

    /// Moving image bytes through the proxy failed.
    #[error("transfer of disk '{disk}' failed: {message}")]
    Transfer { disk: String, message: String },

    /// Bad arguments or an unusable target VM.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The run was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A fatal error tagged with the backup phase it aborted.
    #[error("backup failed during {phase}: {source}")]
    Phase {
        phase: BackupPhase,
        #[source]
        source: Box<Error>,
    },

    /// A fatal error after which the backup snapshot could not be removed.
    #[error("{source} (snapshot '{description}' ({snapshot_id}) was left behind: {reason})")]
    SnapshotLeftBehind {
        snapshot_id: String,
        description: String,
        /// Why teardown failed.
        reason: String,
        #[source]
        source: Box<Error>,
    },
}

/// A specialized Result type for backup operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a remote API error.
    pub fn remote(
        operation: impl Into<String>,
        kind: RemoteErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::RemoteApi {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a "not found" remote API error.
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::remote(operation, RemoteErrorKind::NotFound, message)
    }

    /// Create a transfer error for the given disk.
    pub fn transfer(disk: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            disk: disk.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a poll timeout error.
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    /// Tag an error with the phase it aborted. Already tagged errors keep
    /// their original phase.
    pub fn in_phase(self, phase: BackupPhase) -> Self {
        match self {
            err @ (Self::Phase { .. } | Self::SnapshotLeftBehind { .. }) => err,
            err => Self::Phase {
                phase,
                source: Box::new(err),
            },
        }
    }

    /// Whether the engine reported the addressed resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Self::RemoteApi {
                kind: RemoteErrorKind::NotFound,
                ..
            }
        )
    }

    /// Whether the error stems from cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Whether the error stems from bad configuration or an unusable target.
    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), Self::Configuration { .. })
    }

    /// The phase this error aborted, if tagged.
    pub fn phase(&self) -> Option<BackupPhase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            Self::SnapshotLeftBehind { source, .. } => source.phase(),
            _ => None,
        }
    }

    /// The error with any phase tag stripped.
    pub fn root(&self) -> &Error {
        match self {
            Self::Phase { source, .. } | Self::SnapshotLeftBehind { source, .. } => source.root(),
            err => err,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/backup/winxp/disk");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/backup/winxp/disk"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
    }

    #[test]
    fn test_remote_error() {
        let err = Error::remote("list snapshots", RemoteErrorKind::Conflict, "VM is locked");
        let msg = err.to_string();
        assert!(msg.contains("conflict"));
        assert!(msg.contains("list snapshots"));
        assert!(msg.contains("VM is locked"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_classification() {
        let err = Error::not_found("get image transfer", "404");
        assert!(err.is_not_found());
        assert!(err.in_phase(BackupPhase::Transfer).is_not_found());
    }

    #[test]
    fn test_transfer_error() {
        let err = Error::transfer("disk1-abc", "peer disconnected");
        assert!(err.to_string().contains("disk1-abc"));
        assert!(err.to_string().contains("peer disconnected"));
    }

    #[test]
    fn test_snapshot_timeout_error() {
        let err = Error::SnapshotTimeout {
            snapshot_id: "snap-1".to_string(),
            waited: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("snap-1"));
    }

    #[test]
    fn test_phase_tagging() {
        let err = Error::configuration("VM 'winxp' not found").in_phase(BackupPhase::LookupVm);
        assert_eq!(err.phase(), Some(BackupPhase::LookupVm));
        assert!(err.is_configuration());
        assert!(err.to_string().contains("VM lookup"));

        // A second tag does not overwrite the first.
        let err = err.in_phase(BackupPhase::Teardown);
        assert_eq!(err.phase(), Some(BackupPhase::LookupVm));
    }

    #[test]
    fn test_snapshot_left_behind_keeps_phase_and_root() {
        let err = Error::SnapshotLeftBehind {
            snapshot_id: "snap-1".to_string(),
            description: "winxp-backup-1".to_string(),
            reason: "snapshot is locked".to_string(),
            source: Box::new(Error::transfer("d1", "short read").in_phase(BackupPhase::Transfer)),
        };
        assert_eq!(err.phase(), Some(BackupPhase::Transfer));
        assert!(matches!(err.root(), Error::Transfer { .. }));

        let message = err.to_string();
        assert!(message.contains("disk transfer"));
        assert!(message.contains("winxp-backup-1"));
        assert!(message.contains("left behind: snapshot is locked"));
    }

    #[test]
    fn test_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::Cancelled.in_phase(BackupPhase::Transfer).is_cancelled());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
