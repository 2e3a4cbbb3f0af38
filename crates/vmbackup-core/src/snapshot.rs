//! Lifecycle of the temporary backup snapshot.
//!
//! A snapshot moves `absent → creating → ready → deleting → absent`. Only
//! `creating → ready` is observed by polling; every other transition is an
//! explicit call on [`SnapshotController`].

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::model::{Snapshot, SnapshotType, VirtualMachine};
use crate::poll::{poll_until, PollPolicy};

/// Outcome of a best-effort purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Snapshots confirmed gone.
    pub removed: Vec<String>,
    /// Snapshots that could not be removed, with the reason.
    pub failures: Vec<(String, String)>,
    /// Set when the VM's snapshots could not be listed at all.
    pub listing_error: Option<String>,
}

impl PurgeReport {
    /// Whether every snapshot was removed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.listing_error.is_none()
    }

    /// One human-readable line per suppressed failure.
    pub fn diagnostics(&self) -> Vec<String> {
        let listing = self
            .listing_error
            .iter()
            .map(|reason| format!("snapshots not listed for purge: {}", reason));
        let removals = self
            .failures
            .iter()
            .map(|(id, reason)| format!("snapshot {} not purged: {}", id, reason));
        listing.chain(removals).collect()
    }
}

/// Creates, awaits and removes snapshots of one VM.
pub struct SnapshotController<'a, G: Gateway + ?Sized> {
    gateway: &'a G,
    vm: &'a VirtualMachine,
    ready_policy: PollPolicy,
    removal_policy: PollPolicy,
    cancel: CancellationToken,
}

impl<'a, G: Gateway + ?Sized> SnapshotController<'a, G> {
    /// Create a controller for `vm`.
    pub fn new(gateway: &'a G, vm: &'a VirtualMachine) -> Self {
        Self {
            gateway,
            vm,
            ready_policy: PollPolicy::default(),
            removal_policy: PollPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the policy for waiting on snapshot readiness.
    pub fn with_ready_policy(mut self, policy: PollPolicy) -> Self {
        self.ready_policy = policy;
        self
    }

    /// Set the policy for waiting on snapshot removal.
    pub fn with_removal_policy(mut self, policy: PollPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Set the cancellation token checked by the poll loops.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Remove every existing snapshot of the VM so the next one is a full
    /// baseline.
    ///
    /// Failures are logged and collected in the report, never returned. The
    /// VM's active pseudo-snapshot is skipped.
    pub fn purge_existing(&self) -> PurgeReport {
        let mut report = PurgeReport::default();

        let snapshots = match self.gateway.list_snapshots(&self.vm.id) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(vm = %self.vm.name, error = %err, "could not list snapshots to purge");
                report.listing_error = Some(err.to_string());
                return report;
            }
        };

        for snapshot in snapshots {
            if snapshot.snapshot_type == SnapshotType::Active {
                continue;
            }
            match self.remove(&snapshot) {
                Ok(()) => {
                    info!(vm = %self.vm.name, snapshot = %snapshot.id, "removed stale snapshot");
                    report.removed.push(snapshot.id);
                }
                Err(err) => {
                    warn!(
                        vm = %self.vm.name,
                        snapshot = %snapshot.id,
                        error = %err,
                        "could not remove stale snapshot"
                    );
                    report.failures.push((snapshot.id, err.to_string()));
                }
            }
        }

        report
    }

    /// Request a disk-only snapshot. The returned snapshot is usually not
    /// ready yet.
    pub fn create(&self, description: &str) -> Result<Snapshot> {
        let snapshot = self.gateway.create_snapshot(&self.vm.id, description)?;
        info!(
            vm = %self.vm.name,
            snapshot = %snapshot.id,
            description,
            "sent request to create snapshot"
        );
        Ok(snapshot)
    }

    /// Wait until the snapshot status is `ok`.
    ///
    /// Any other status, however final it may look, keeps the wait going.
    pub fn await_ready(&self, snapshot: Snapshot) -> Result<Snapshot> {
        if snapshot.is_ready() {
            return Ok(snapshot);
        }

        let snapshot_id = snapshot.id.clone();
        let result = poll_until("snapshot readiness", &self.ready_policy, &self.cancel, |attempt| {
            // The creation response already told us the first status.
            if attempt == 1 {
                debug!(snapshot = %snapshot_id, status = %snapshot.status, "waiting for snapshot");
                return Ok(None);
            }
            let current = self.gateway.get_snapshot(&self.vm.id, &snapshot_id)?;
            if current.is_ready() {
                Ok(Some(current))
            } else {
                debug!(snapshot = %snapshot_id, status = %current.status, "waiting for snapshot");
                Ok(None)
            }
        });

        match result {
            Ok(ready) => {
                info!(vm = %self.vm.name, snapshot = %ready.id, "snapshot is complete");
                Ok(ready)
            }
            Err(Error::Timeout { waited, .. }) => Err(Error::SnapshotTimeout {
                snapshot_id,
                waited,
            }),
            Err(err) => Err(err),
        }
    }

    /// Delete the snapshot and wait until it is gone.
    pub fn teardown(&self, snapshot: &Snapshot) -> Result<()> {
        self.remove(snapshot)?;
        info!(vm = %self.vm.name, snapshot = %snapshot.id, description = %snapshot.description, "removed the snapshot");
        Ok(())
    }

    fn remove(&self, snapshot: &Snapshot) -> Result<()> {
        match self.gateway.delete_snapshot(&self.vm.id, &snapshot.id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }

        poll_until("snapshot removal", &self.removal_policy, &self.cancel, |_| {
            match self.gateway.get_snapshot(&self.vm.id, &snapshot.id) {
                Ok(_) => Ok(None),
                Err(err) if err.is_not_found() => Ok(Some(())),
                Err(err) => Err(err),
            }
        })
    }
}
