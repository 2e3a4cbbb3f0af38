//! [`Gateway`] implementation speaking the engine's REST API (JSON flavour).

use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::error::{Error, RemoteErrorKind, Result};
use crate::gateway::Gateway;
use crate::model::{
    AuditEvent, DiskSnapshot, ImageTransfer, Snapshot, SnapshotStatus, SnapshotType,
    StorageDomain, TransferDirection, TransferPhase, VirtualMachine,
};
use crate::proxy::load_ca_certificate;

/// Path of the API root below the engine URL.
pub const API_PATH: &str = "/ovirt-engine/api";

/// Connection settings for the engine.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Engine base URL, e.g. `https://engine.example.com`.
    pub engine_url: String,
    /// User name including profile, e.g. `admin@internal`.
    pub username: String,
    pub password: String,
    /// PEM bundle used to verify the engine's certificate.
    pub ca_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Timeout for a single API request.
    pub request_timeout: Duration,
}

impl GatewayConfig {
    /// Create a configuration with default timeouts.
    pub fn new(
        engine_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            engine_url: engine_url.into(),
            username: username.into(),
            password: password.into(),
            ca_file: None,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(180),
        }
    }

    /// Verify the engine against this CA bundle.
    pub fn with_ca_file(mut self, ca_file: Option<PathBuf>) -> Self {
        self.ca_file = ca_file;
        self
    }

    /// The API root URL.
    pub fn api_url(&self) -> String {
        format!("{}{}", self.engine_url.trim_end_matches('/'), API_PATH)
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("engine_url", &self.engine_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ca_file", &self.ca_file)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// An authenticated session against the engine REST API.
#[derive(Clone)]
pub struct RestGateway {
    client: Client,
    api_url: String,
    username: String,
    password: String,
}

impl RestGateway {
    /// Build the HTTP client and check the credentials against the API root.
    pub fn connect(config: &GatewayConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        if let Some(path) = &config.ca_file {
            builder = builder.add_root_certificate(load_ca_certificate(path)?);
        }

        let client = builder.build().map_err(|e| {
            Error::configuration(format!("failed to build engine HTTP client: {}", e))
        })?;

        let gateway = Self {
            client,
            api_url: config.api_url(),
            username: config.username.clone(),
            password: config.password.clone(),
        };

        gateway.execute("connect", gateway.request(Method::GET, ""))?;
        info!(url = %gateway.api_url, user = %gateway.username, "connected to engine");

        Ok(gateway)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.api_url, path);
        debug!(%method, %url, "engine request");
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, "application/json")
            .header("Version", "4")
    }

    fn execute(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .map_err(|e| Error::remote(operation, RemoteErrorKind::Network, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();
        trace!(operation, status = status.as_u16(), %body, "engine error body");
        let message = fault_message(&body).unwrap_or_else(|| format!("HTTP {}", status));
        Err(Error::remote(operation, kind_for_status(status.as_u16()), message))
    }

    fn fetch<T: DeserializeOwned>(&self, operation: &str, request: RequestBuilder) -> Result<T> {
        let response = self.execute(operation, request)?;
        response
            .json::<T>()
            .map_err(|e| Error::remote(operation, RemoteErrorKind::Protocol, e.to_string()))
    }

    fn get<T: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<T> {
        self.fetch(operation, self.request(Method::GET, path))
    }

    fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.fetch(operation, self.request(Method::POST, path).json(body))
    }
}

/// Map an HTTP status to an error kind.
pub fn kind_for_status(status: u16) -> RemoteErrorKind {
    match status {
        401 | 403 => RemoteErrorKind::Auth,
        404 => RemoteErrorKind::NotFound,
        409 => RemoteErrorKind::Conflict,
        _ => RemoteErrorKind::Other,
    }
}

/// Extract `reason: detail` from an engine fault body.
fn fault_message(body: &str) -> Option<String> {
    let fault: WireFault = serde_json::from_str(body).ok()?;
    match (fault.reason, fault.detail) {
        (Some(reason), Some(detail)) => Some(format!("{}: {}", reason, detail)),
        (Some(reason), None) => Some(reason),
        (None, Some(detail)) => Some(detail),
        (None, None) => None,
    }
}

impl Gateway for RestGateway {
    fn find_vms_by_name(&self, name: &str) -> Result<Vec<VirtualMachine>> {
        let search = format!("name={}", name);
        let request = self
            .request(Method::GET, "/vms")
            .query(&[("search", search.as_str()), ("all_content", "true")]);
        let list: WireVms = self.fetch("find VM", request)?;
        Ok(list.vm.into_iter().map(Into::into).collect())
    }

    fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        let list: WireSnapshots = self.get("list snapshots", &format!("/vms/{}/snapshots", vm_id))?;
        Ok(list.snapshot.into_iter().map(Into::into).collect())
    }

    fn create_snapshot(&self, vm_id: &str, description: &str) -> Result<Snapshot> {
        let body = NewSnapshot {
            description,
            persist_memorystate: false,
        };
        let created: WireSnapshot = self.post(
            "create snapshot",
            &format!("/vms/{}/snapshots", vm_id),
            &body,
        )?;
        Ok(created.into())
    }

    fn get_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        let snapshot: WireSnapshot = self.get(
            "get snapshot",
            &format!("/vms/{}/snapshots/{}", vm_id, snapshot_id),
        )?;
        Ok(snapshot.into())
    }

    fn delete_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()> {
        let path = format!("/vms/{}/snapshots/{}", vm_id, snapshot_id);
        self.execute("delete snapshot", self.request(Method::DELETE, &path))?;
        Ok(())
    }

    fn list_storage_domains(&self) -> Result<Vec<StorageDomain>> {
        let list: WireStorageDomains = self.get("list storage domains", "/storagedomains")?;
        Ok(list.storage_domain.into_iter().map(Into::into).collect())
    }

    fn list_disk_snapshots(&self, storage_domain_id: &str) -> Result<Vec<DiskSnapshot>> {
        let list: WireDiskSnapshots = self.get(
            "list disk snapshots",
            &format!("/storagedomains/{}/disksnapshots", storage_domain_id),
        )?;
        Ok(list.disk_snapshot.into_iter().map(Into::into).collect())
    }

    fn create_image_transfer(
        &self,
        disk_snapshot_id: &str,
        direction: TransferDirection,
    ) -> Result<ImageTransfer> {
        let body = NewImageTransfer {
            snapshot: IdRef {
                id: disk_snapshot_id.to_string(),
            },
            direction: direction.as_str(),
        };
        let created: WireImageTransfer = self.post("create image transfer", "/imagetransfers", &body)?;
        Ok(created.into())
    }

    fn get_image_transfer(&self, transfer_id: &str) -> Result<ImageTransfer> {
        let transfer: WireImageTransfer = self.get(
            "get image transfer",
            &format!("/imagetransfers/{}", transfer_id),
        )?;
        Ok(transfer.into())
    }

    fn finalize_image_transfer(&self, transfer_id: &str) -> Result<()> {
        let path = format!("/imagetransfers/{}/finalize", transfer_id);
        let request = self
            .request(Method::POST, &path)
            .json(&serde_json::json!({}));
        self.execute("finalize image transfer", request)?;
        Ok(())
    }

    fn add_event(&self, event: &AuditEvent) -> Result<()> {
        let body = NewEvent {
            vm: IdRef {
                id: event.vm_id.clone(),
            },
            origin: &event.origin,
            severity: event.severity.as_str(),
            custom_id: event.custom_id,
            description: &event.description,
        };
        self.execute("add event", self.request(Method::POST, "/events").json(&body))?;
        Ok(())
    }
}

// Wire representations. Collections come back as `{"<type>": [...]}` and
// the key is left out entirely when the collection is empty.

#[derive(Debug, Deserialize)]
struct WireFault {
    reason: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize, Default)]
struct WireVms {
    #[serde(default)]
    vm: Vec<WireVm>,
}

#[derive(Debug, Deserialize)]
struct WireVm {
    id: String,
    #[serde(default)]
    name: String,
    initialization: Option<WireInitialization>,
}

#[derive(Debug, Deserialize)]
struct WireInitialization {
    configuration: Option<WireConfiguration>,
}

#[derive(Debug, Deserialize)]
struct WireConfiguration {
    data: Option<String>,
}

impl From<WireVm> for VirtualMachine {
    fn from(vm: WireVm) -> Self {
        let ovf = vm
            .initialization
            .and_then(|init| init.configuration)
            .and_then(|config| config.data);
        Self {
            id: vm.id,
            name: vm.name,
            ovf,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct WireSnapshots {
    #[serde(default)]
    snapshot: Vec<WireSnapshot>,
}

#[derive(Debug, Deserialize)]
struct WireSnapshot {
    id: String,
    #[serde(default)]
    description: String,
    snapshot_status: Option<String>,
    snapshot_type: Option<String>,
}

impl From<WireSnapshot> for Snapshot {
    fn from(snapshot: WireSnapshot) -> Self {
        Self {
            id: snapshot.id,
            description: snapshot.description,
            status: snapshot
                .snapshot_status
                .as_deref()
                .map_or(SnapshotStatus::Unknown, SnapshotStatus::parse),
            snapshot_type: snapshot
                .snapshot_type
                .as_deref()
                .map_or(SnapshotType::Unknown, SnapshotType::parse),
        }
    }
}

#[derive(Debug, Serialize)]
struct NewSnapshot<'a> {
    description: &'a str,
    persist_memorystate: bool,
}

#[derive(Debug, Deserialize, Default)]
struct WireStorageDomains {
    #[serde(default)]
    storage_domain: Vec<WireStorageDomain>,
}

#[derive(Debug, Deserialize)]
struct WireStorageDomain {
    id: String,
    #[serde(default)]
    name: String,
}

impl From<WireStorageDomain> for StorageDomain {
    fn from(domain: WireStorageDomain) -> Self {
        Self {
            id: domain.id,
            name: domain.name,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct WireDiskSnapshots {
    #[serde(default)]
    disk_snapshot: Vec<WireDiskSnapshot>,
}

#[derive(Debug, Deserialize)]
struct WireDiskSnapshot {
    id: String,
    #[serde(default)]
    alias: String,
    disk: Option<IdRef>,
    snapshot: Option<IdRef>,
}

impl From<WireDiskSnapshot> for DiskSnapshot {
    fn from(disk: WireDiskSnapshot) -> Self {
        Self {
            id: disk.id,
            alias: disk.alias,
            disk_id: disk.disk.map(|r| r.id),
            snapshot_id: disk.snapshot.map(|r| r.id),
        }
    }
}

#[derive(Debug, Serialize)]
struct NewImageTransfer {
    snapshot: IdRef,
    direction: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireImageTransfer {
    id: String,
    phase: Option<String>,
    signed_ticket: Option<String>,
    proxy_url: Option<String>,
    transfer_url: Option<String>,
}

impl From<WireImageTransfer> for ImageTransfer {
    fn from(transfer: WireImageTransfer) -> Self {
        Self {
            id: transfer.id,
            phase: transfer
                .phase
                .as_deref()
                .map_or(TransferPhase::Unknown, TransferPhase::parse),
            signed_ticket: transfer.signed_ticket,
            proxy_url: transfer.proxy_url,
            transfer_url: transfer.transfer_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct NewEvent<'a> {
    vm: IdRef,
    origin: &'a str,
    severity: &'static str,
    custom_id: i64,
    description: &'a str,
}
