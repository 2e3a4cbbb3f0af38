//! The management API surface the backup workflow drives.

use crate::error::Result;
use crate::model::{
    AuditEvent, DiskSnapshot, ImageTransfer, Snapshot, StorageDomain, TransferDirection,
    VirtualMachine,
};

/// An authenticated session with the virtualization manager.
///
/// Implementations must be usable from several transfer workers at once,
/// hence `Send + Sync` and `&self` receivers. Every call may fail with
/// [`Error::RemoteApi`](crate::Error::RemoteApi); a missing resource is
/// reported with kind `NotFound` so poll loops can detect removal.
pub trait Gateway: Send + Sync {
    /// Searches VMs by name, including their OVF configuration.
    fn find_vms_by_name(&self, name: &str) -> Result<Vec<VirtualMachine>>;

    /// Lists all snapshots of a VM.
    fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>>;

    /// Requests a disk-only snapshot. Returns before the snapshot is ready.
    fn create_snapshot(&self, vm_id: &str, description: &str) -> Result<Snapshot>;

    /// Fetches the current state of a snapshot.
    fn get_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<Snapshot>;

    /// Requests removal of a snapshot. Returns before removal completes.
    fn delete_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()>;

    /// Lists all storage domains.
    fn list_storage_domains(&self) -> Result<Vec<StorageDomain>>;

    /// Lists every disk snapshot held by a storage domain.
    fn list_disk_snapshots(&self, storage_domain_id: &str) -> Result<Vec<DiskSnapshot>>;

    /// Starts an image transfer for a disk snapshot.
    fn create_image_transfer(
        &self,
        disk_snapshot_id: &str,
        direction: TransferDirection,
    ) -> Result<ImageTransfer>;

    /// Fetches the current state of an image transfer.
    fn get_image_transfer(&self, transfer_id: &str) -> Result<ImageTransfer>;

    /// Requests finalization of an image transfer.
    fn finalize_image_transfer(&self, transfer_id: &str) -> Result<()>;

    /// Records an event in the audit log.
    fn add_event(&self, event: &AuditEvent) -> Result<()>;
}
