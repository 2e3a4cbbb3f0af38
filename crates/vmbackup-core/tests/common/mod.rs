//! In-memory engine and imageio proxy shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use url::Url;
use vmbackup_core::model::{
    AuditEvent, DiskSnapshot, ImageTransfer, Snapshot, SnapshotStatus, SnapshotType,
    StorageDomain, TransferDirection, TransferPhase, VirtualMachine,
};
use vmbackup_core::{
    Error, Gateway, PollPolicy, ProxyChannel, ProxyResponse, RemoteErrorKind, Result,
};

/// Poll policy that never sleeps but still gives up eventually.
pub fn fast_policy() -> PollPolicy {
    PollPolicy::fixed(Duration::ZERO, Duration::from_secs(5))
}

pub fn vm(id: &str, name: &str) -> VirtualMachine {
    VirtualMachine {
        id: id.to_string(),
        name: name.to_string(),
        ovf: Some(format!("<ovf:Envelope><Name>{}</Name></ovf:Envelope>", name)),
    }
}

pub fn snapshot(id: &str, description: &str, snapshot_type: SnapshotType) -> Snapshot {
    Snapshot {
        id: id.to_string(),
        description: description.to_string(),
        status: SnapshotStatus::Ok,
        snapshot_type,
    }
}

pub fn disk(id: &str, alias: &str, snapshot_id: &str) -> DiskSnapshot {
    DiskSnapshot {
        id: id.to_string(),
        alias: alias.to_string(),
        disk_id: Some(format!("disk-{}", id)),
        snapshot_id: Some(snapshot_id.to_string()),
    }
}

/// Deterministic image contents of `len` bytes.
pub fn image(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

struct FakeSnapshot {
    snapshot: Snapshot,
    locked_gets: u32,
    delete_requested: bool,
    gets_until_gone: u32,
}

struct FakeTransfer {
    transfer: ImageTransfer,
    initializing_gets: u32,
    finalized: bool,
    gets_until_gone: u32,
}

#[derive(Default)]
struct State {
    vms: Vec<VirtualMachine>,
    snapshots: HashMap<String, Vec<FakeSnapshot>>,
    domains: Vec<StorageDomain>,
    disks: HashMap<String, Vec<DiskSnapshot>>,
    /// Disk images attached to the next created snapshot: (domain, id, alias).
    pending_disks: Vec<(String, String, String)>,
    transfers: HashMap<String, FakeTransfer>,
    events: Vec<AuditEvent>,
    calls: Vec<String>,
    next_snapshot: u32,
}

/// In-memory engine.
///
/// Asynchronous operations complete after a configurable number of polls:
/// new snapshots stay `locked` for `locked_gets` reads, deleted snapshots
/// linger for `removal_gets` reads, new transfers stay `initializing` for
/// `initializing_gets` reads and finalized transfers linger for
/// `finalize_gets` reads.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<State>,
    pub locked_gets: u32,
    /// Status reported while a new snapshot is not ready; `locked` if unset.
    pub pending_status: Option<SnapshotStatus>,
    pub removal_gets: u32,
    pub initializing_gets: u32,
    /// Phase new transfers settle in instead of `transferring`.
    pub settled_phase: Option<TransferPhase>,
    pub finalize_gets: u32,
    pub fail_finalize: bool,
    pub fail_list_snapshots: bool,
    pub fail_events: bool,
    pub undeletable: HashSet<String>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vm(&self, vm: VirtualMachine) {
        self.state.lock().unwrap().vms.push(vm);
    }

    pub fn add_snapshot(&self, vm_id: &str, snapshot: Snapshot) {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .entry(vm_id.to_string())
            .or_default()
            .push(FakeSnapshot {
                snapshot,
                locked_gets: 0,
                delete_requested: false,
                gets_until_gone: 0,
            });
    }

    pub fn add_domain(&self, id: &str) {
        self.state.lock().unwrap().domains.push(StorageDomain {
            id: id.to_string(),
            name: format!("domain-{}", id),
        });
    }

    pub fn add_disk(&self, domain_id: &str, disk: DiskSnapshot) {
        self.state
            .lock()
            .unwrap()
            .disks
            .entry(domain_id.to_string())
            .or_default()
            .push(disk);
    }

    /// Attach a disk image to the snapshot the next `create_snapshot` makes.
    pub fn add_pending_disk(&self, domain_id: &str, id: &str, alias: &str) {
        self.state.lock().unwrap().pending_disks.push((
            domain_id.to_string(),
            id.to_string(),
            alias.to_string(),
        ));
    }

    pub fn snapshot_ids(&self, vm_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .get(vm_id)
            .map(|list| list.iter().map(|s| s.snapshot.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls whose name is `name`.
    pub fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.split(':').next() == Some(name))
            .count()
    }

    pub fn open_transfers(&self) -> usize {
        self.state.lock().unwrap().transfers.len()
    }

    fn record(state: &mut State, call: String) {
        state.calls.push(call);
    }

    fn pending(&self) -> SnapshotStatus {
        self.pending_status.unwrap_or(SnapshotStatus::Locked)
    }

    fn settled(&self) -> TransferPhase {
        self.settled_phase.unwrap_or(TransferPhase::Transferring)
    }
}

fn not_found(operation: &str, id: &str) -> Error {
    Error::not_found(operation, format!("entity '{}' not found", id))
}

impl Gateway for FakeGateway {
    fn find_vms_by_name(&self, name: &str) -> Result<Vec<VirtualMachine>> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("find_vms_by_name:{}", name));
        // Mimics the engine's pattern search.
        Ok(state
            .vms
            .iter()
            .filter(|vm| vm.name.contains(name))
            .cloned()
            .collect())
    }

    fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("list_snapshots:{}", vm_id));
        if self.fail_list_snapshots {
            return Err(Error::remote(
                "list snapshots",
                RemoteErrorKind::Other,
                "HTTP 500 Internal Server Error",
            ));
        }
        Ok(state
            .snapshots
            .get(vm_id)
            .map(|list| list.iter().map(|s| s.snapshot.clone()).collect())
            .unwrap_or_default())
    }

    fn create_snapshot(&self, vm_id: &str, description: &str) -> Result<Snapshot> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("create_snapshot:{}", description));

        state.next_snapshot += 1;
        let id = format!("backup-snap-{}", state.next_snapshot);
        let status = if self.locked_gets > 0 {
            self.pending()
        } else {
            SnapshotStatus::Ok
        };
        let created = Snapshot {
            id: id.clone(),
            description: description.to_string(),
            status,
            snapshot_type: SnapshotType::Regular,
        };

        for (domain, disk_id, alias) in std::mem::take(&mut state.pending_disks) {
            state
                .disks
                .entry(domain)
                .or_default()
                .push(disk(&disk_id, &alias, &id));
        }

        state
            .snapshots
            .entry(vm_id.to_string())
            .or_default()
            .push(FakeSnapshot {
                snapshot: created.clone(),
                locked_gets: self.locked_gets,
                delete_requested: false,
                gets_until_gone: 0,
            });
        Ok(created)
    }

    fn get_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("get_snapshot:{}", snapshot_id));

        let list = state
            .snapshots
            .get_mut(vm_id)
            .ok_or_else(|| not_found("get snapshot", snapshot_id))?;
        let index = list
            .iter()
            .position(|s| s.snapshot.id == snapshot_id)
            .ok_or_else(|| not_found("get snapshot", snapshot_id))?;

        let entry = &mut list[index];
        if entry.delete_requested {
            if entry.gets_until_gone == 0 {
                list.remove(index);
                return Err(not_found("get snapshot", snapshot_id));
            }
            entry.gets_until_gone -= 1;
            let mut current = entry.snapshot.clone();
            current.status = SnapshotStatus::Locked;
            return Ok(current);
        }

        if entry.locked_gets > 0 {
            entry.locked_gets = entry.locked_gets.saturating_sub(1);
            let mut current = entry.snapshot.clone();
            current.status = self.pending();
            return Ok(current);
        }

        entry.snapshot.status = SnapshotStatus::Ok;
        Ok(entry.snapshot.clone())
    }

    fn delete_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("delete_snapshot:{}", snapshot_id));

        if self.undeletable.contains(snapshot_id) {
            return Err(Error::remote(
                "delete snapshot",
                RemoteErrorKind::Conflict,
                "snapshot is locked by another operation",
            ));
        }

        let entry = state
            .snapshots
            .get_mut(vm_id)
            .and_then(|list| list.iter_mut().find(|s| s.snapshot.id == snapshot_id))
            .ok_or_else(|| not_found("delete snapshot", snapshot_id))?;
        if entry.snapshot.snapshot_type == SnapshotType::Active {
            return Err(Error::remote(
                "delete snapshot",
                RemoteErrorKind::Conflict,
                "cannot remove the active snapshot",
            ));
        }
        entry.delete_requested = true;
        entry.gets_until_gone = self.removal_gets;
        Ok(())
    }

    fn list_storage_domains(&self) -> Result<Vec<StorageDomain>> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "list_storage_domains".to_string());
        Ok(state.domains.clone())
    }

    fn list_disk_snapshots(&self, storage_domain_id: &str) -> Result<Vec<DiskSnapshot>> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("list_disk_snapshots:{}", storage_domain_id));
        Ok(state.disks.get(storage_domain_id).cloned().unwrap_or_default())
    }

    fn create_image_transfer(
        &self,
        disk_snapshot_id: &str,
        direction: TransferDirection,
    ) -> Result<ImageTransfer> {
        let mut state = self.state.lock().unwrap();
        Self::record(
            &mut state,
            format!("create_image_transfer:{}:{}", disk_snapshot_id, direction.as_str()),
        );

        let id = format!("transfer-{}", disk_snapshot_id);
        let transfer = ImageTransfer {
            id: id.clone(),
            phase: if self.initializing_gets > 0 {
                TransferPhase::Initializing
            } else {
                self.settled()
            },
            signed_ticket: Some(format!("ticket-{}", disk_snapshot_id)),
            proxy_url: Some(format!("https://proxy.example.com:54323/images/{}", id)),
            transfer_url: Some(format!("https://host.example.com:54322/images/{}", id)),
        };
        state.transfers.insert(
            id,
            FakeTransfer {
                transfer: transfer.clone(),
                initializing_gets: self.initializing_gets,
                finalized: false,
                gets_until_gone: 0,
            },
        );
        Ok(transfer)
    }

    fn get_image_transfer(&self, transfer_id: &str) -> Result<ImageTransfer> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("get_image_transfer:{}", transfer_id));

        let entry = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| not_found("get image transfer", transfer_id))?;

        if entry.finalized {
            if entry.gets_until_gone == 0 {
                state.transfers.remove(transfer_id);
                return Err(not_found("get image transfer", transfer_id));
            }
            entry.gets_until_gone -= 1;
            entry.transfer.phase = TransferPhase::FinalizingSuccess;
        } else if entry.initializing_gets > 0 {
            entry.initializing_gets -= 1;
            entry.transfer.phase = TransferPhase::Initializing;
        } else {
            entry.transfer.phase = self.settled();
        }
        Ok(entry.transfer.clone())
    }

    fn finalize_image_transfer(&self, transfer_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("finalize_image_transfer:{}", transfer_id));
        if self.fail_finalize {
            return Err(Error::remote(
                "finalize image transfer",
                RemoteErrorKind::Conflict,
                "transfer is being finalized by another request",
            ));
        }

        let entry = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| not_found("finalize image transfer", transfer_id))?;
        entry.finalized = true;
        entry.gets_until_gone = self.finalize_gets;
        Ok(())
    }

    fn add_event(&self, event: &AuditEvent) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("add_event:{}", event.custom_id));
        if self.fail_events {
            return Err(Error::remote(
                "add event",
                RemoteErrorKind::Other,
                "event log unavailable",
            ));
        }
        state.events.push(event.clone());
        Ok(())
    }
}

/// What the proxy serves for one ticket.
#[derive(Clone)]
pub struct FakeImage {
    pub status: u16,
    /// Advertised `Content-Length`.
    pub content_length: Option<u64>,
    /// Bytes actually sent before the connection closes.
    pub body: Vec<u8>,
}

impl FakeImage {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_length: Some(body.len() as u64),
            body,
        }
    }

    /// Advertise `body` but hang up after `sent` bytes.
    pub fn truncated(body: Vec<u8>, sent: usize) -> Self {
        Self {
            status: 200,
            content_length: Some(body.len() as u64),
            body: body[..sent].to_vec(),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_length: Some(message.len() as u64),
            body: message.as_bytes().to_vec(),
        }
    }
}

/// In-memory imageio proxy serving images by disk snapshot id.
#[derive(Default)]
pub struct FakeProxy {
    images: Mutex<HashMap<String, FakeImage>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, disk_snapshot_id: &str, image: FakeImage) {
        self.images
            .lock()
            .unwrap()
            .insert(format!("ticket-{}", disk_snapshot_id), image);
    }

    /// `(url, ticket)` pairs in request order.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

impl ProxyChannel for FakeProxy {
    fn get(&self, url: &Url, ticket: &str) -> Result<ProxyResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), ticket.to_string()));

        let image = self
            .images
            .lock()
            .unwrap()
            .get(ticket)
            .cloned()
            .unwrap_or_else(|| FakeImage::error(401, "invalid ticket"));

        Ok(ProxyResponse {
            status: image.status,
            content_length: image.content_length,
            body: Box::new(Cursor::new(image.body)),
        })
    }
}
