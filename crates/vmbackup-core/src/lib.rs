//! oVirt VM Backup Core Library
//!
//! This crate backs up oVirt/RHV virtual machines through the engine's REST
//! API and imageio proxy.
//!
//! # Overview
//!
//! A backup run snapshots a running VM, downloads the raw image of every disk
//! in that snapshot together with the VM's OVF configuration, and removes the
//! snapshot again. The main entry point is the [`backup_vm`] function which
//! handles the full run.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`model`] - Engine resources (VMs, snapshots, disks, transfers, events)
//! - [`gateway`] - Engine API abstraction
//! - [`rest`] - REST implementation of the gateway
//! - [`proxy`] - HTTPS channel to the imageio proxy
//! - [`poll`] - Bounded polling for asynchronous engine operations
//! - [`cancel`] - Cooperative cancellation
//! - [`snapshot`] - Snapshot purge, creation, readiness and teardown
//! - [`transfer`] - Image transfer sessions and chunked downloads
//! - [`pipeline`] - Parallel processing of per-disk transfers
//! - [`audit`] - Audit events in the engine's event log
//! - [`backup`] - Backup orchestrator coordinating the full run
//!
//! # Quick Start
//!
//! ```no_run
//! use vmbackup_core::{backup_vm, BackupOptions, GatewayConfig, HttpsProxyChannel, RestGateway};
//!
//! let config = GatewayConfig::new("https://engine.example.com", "admin@internal", "secret");
//! let gateway = RestGateway::connect(&config).unwrap();
//! let proxy = HttpsProxyChannel::new(None).unwrap();
//!
//! backup_vm(&gateway, &proxy, "winxp", BackupOptions::new("/data/backup"), None).unwrap();
//! ```

pub mod audit;
pub mod backup;
pub mod cancel;
pub mod error;
pub mod gateway;
pub mod model;
pub mod pipeline;
pub mod poll;
pub mod proxy;
pub mod rest;
pub mod snapshot;
pub mod transfer;

pub use error::{Error, RemoteErrorKind, Result};

// Re-export main backup functionality for convenience
pub use backup::{
    backup_vm, snapshot_disks, BackupEvent, BackupOptions, BackupOrchestrator, BackupPhase,
    BackupReport, EventCallback,
};

pub use audit::{EventIdSequence, DEFAULT_ORIGIN};
pub use cancel::CancellationToken;
pub use gateway::Gateway;
pub use poll::PollPolicy;
pub use proxy::{HttpsProxyChannel, ProxyChannel, ProxyResponse};
pub use rest::{GatewayConfig, RestGateway};
pub use transfer::{DiskBackup, DownloadProgress, DEFAULT_CHUNK_SIZE};
