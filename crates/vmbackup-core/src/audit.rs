//! Audit events announcing backup runs in the engine's event log.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::gateway::Gateway;
use crate::model::{AuditEvent, Severity};

/// Origin tag attached to every event this tool sends.
pub const DEFAULT_ORIGIN: &str = "ovirtvmbackup";

/// Monotonic source of event correlation ids.
///
/// Seeded from the UNIX time in seconds so ids stay unique across runs
/// without external state.
#[derive(Debug)]
pub struct EventIdSequence {
    next: AtomicI64,
}

impl EventIdSequence {
    /// Start counting at `first`.
    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    /// Start counting at the current UNIX time in seconds.
    pub fn from_clock() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Self::starting_at(seconds)
    }

    /// Take the next id.
    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for EventIdSequence {
    fn default() -> Self {
        Self::from_clock()
    }
}

/// Sends backup lifecycle events for one VM.
///
/// Delivery is fire-and-forget: a rejected event is logged and remembered
/// in [`AuditTrail::failures`], never returned as an error.
pub struct AuditTrail<'a, G: Gateway + ?Sized> {
    gateway: &'a G,
    vm_id: String,
    vm_name: String,
    origin: String,
    ids: &'a EventIdSequence,
    sent: Mutex<Vec<i64>>,
    failures: Mutex<Vec<String>>,
}

impl<'a, G: Gateway + ?Sized> AuditTrail<'a, G> {
    /// Create a trail for the given VM.
    pub fn new(
        gateway: &'a G,
        ids: &'a EventIdSequence,
        vm_id: impl Into<String>,
        vm_name: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            vm_id: vm_id.into(),
            vm_name: vm_name.into(),
            origin: origin.into(),
            ids,
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Announce that the backup using `snapshot` is starting.
    pub fn started(&self, snapshot: &str) -> i64 {
        self.send(
            Severity::Normal,
            format!(
                "Backup of virtual machine '{}' using snapshot '{}' is starting.",
                self.vm_name, snapshot
            ),
        )
    }

    /// Announce that the backup using `snapshot` completed.
    pub fn completed(&self, snapshot: &str) -> i64 {
        self.send(
            Severity::Normal,
            format!(
                "Backup of virtual machine '{}' using snapshot '{}' is completed.",
                self.vm_name, snapshot
            ),
        )
    }

    /// Announce that the backup using `snapshot` failed.
    pub fn failed(&self, snapshot: &str, reason: &str) -> i64 {
        self.send(
            Severity::Error,
            format!(
                "Backup of virtual machine '{}' using snapshot '{}' failed: {}",
                self.vm_name, snapshot, reason
            ),
        )
    }

    /// Ids of events the engine accepted, in sending order.
    pub fn sent(&self) -> Vec<i64> {
        self.sent.lock().map(|ids| ids.clone()).unwrap_or_default()
    }

    /// Events that could not be delivered.
    pub fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }

    fn send(&self, severity: Severity, description: String) -> i64 {
        let event = AuditEvent {
            vm_id: self.vm_id.clone(),
            origin: self.origin.clone(),
            severity,
            custom_id: self.ids.next_id(),
            description,
        };

        match self.gateway.add_event(&event) {
            Ok(()) => {
                info!(id = event.custom_id, severity = severity.as_str(), "{}", event.description);
                if let Ok(mut sent) = self.sent.lock() {
                    sent.push(event.custom_id);
                }
            }
            Err(err) => {
                warn!(id = event.custom_id, error = %err, "failed to record audit event");
                if let Ok(mut failures) = self.failures.lock() {
                    failures.push(format!("audit event {}: {}", event.custom_id, err));
                }
            }
        }

        event.custom_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let ids = EventIdSequence::starting_at(100);
        assert_eq!(ids.next_id(), 100);
        assert_eq!(ids.next_id(), 101);
        assert_eq!(ids.next_id(), 102);
    }

    #[test]
    fn test_sequence_from_clock_is_recent() {
        let ids = EventIdSequence::from_clock();
        // 2017-01-01T00:00:00Z
        assert!(ids.next_id() > 1_483_228_800);
    }
}
