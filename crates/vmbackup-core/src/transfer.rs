//! Downloading disk snapshot images through the imageio proxy.
//!
//! Every image goes through the same three steps:
//! 1. [`TransferClient::open_session`] asks the engine for a download
//!    session and waits for it to leave `initializing`
//! 2. [`TransferClient::download`] streams the image body from the proxy
//!    into a local file in bounded chunks
//! 3. [`TransferClient::finalize`] releases the session, whatever happened
//!    in step 2
//!
//! [`TransferClient::transfer_disk`] runs all three and guarantees step 3.

use std::cmp;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::model::{DiskSnapshot, ImageTransfer, TransferDirection, TransferPhase};
use crate::poll::{poll_until, PollPolicy};
use crate::proxy::ProxyChannel;

/// Default chunk size for reading image bodies (64 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Longest error body quoted back from the proxy.
const MAX_ERROR_BODY: u64 = 4096;

/// A live download session for one disk snapshot.
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Engine identifier of the image transfer.
    pub transfer_id: String,
    /// The disk snapshot being transferred.
    pub disk: DiskSnapshot,
    /// Ticket for the proxy's `Authorization` header.
    pub signed_ticket: String,
    /// Where the image is served.
    pub url: Url,
}

impl TransferSession {
    fn from_transfer(disk: &DiskSnapshot, transfer: ImageTransfer) -> Result<Self> {
        let signed_ticket = transfer
            .signed_ticket
            .clone()
            .ok_or_else(|| Error::transfer(disk.file_name(), "transfer carries no signed ticket"))?;
        let endpoint = transfer
            .endpoint()
            .ok_or_else(|| Error::transfer(disk.file_name(), "transfer carries no proxy URL"))?;
        let url = Url::parse(endpoint).map_err(|e| {
            Error::transfer(
                disk.file_name(),
                format!("invalid proxy URL '{}': {}", endpoint, e),
            )
        })?;

        Ok(Self {
            transfer_id: transfer.id,
            disk: disk.clone(),
            signed_ticket,
            url,
        })
    }
}

/// Progress of a single image download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes written to the destination so far.
    pub bytes_received: u64,
    /// Bytes announced by `Content-Length`.
    pub bytes_total: u64,
    /// Chunks read so far.
    pub chunks: u64,
}

impl DownloadProgress {
    /// Completed fraction in `[0, 1]`.
    ///
    /// Derived from the announced total rather than summed per chunk, so the
    /// last chunk lands on exactly 1.0.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 1.0;
        }
        let remaining = self.bytes_total - self.bytes_received;
        1.0 - (remaining as f64 / self.bytes_total as f64)
    }
}

/// Result of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks: u64,
    /// Hex SHA-256 of the image, when checksumming was enabled.
    pub sha256: Option<String>,
}

/// Result of releasing a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// How many times the transfer was still present while waiting.
    pub polls: u32,
}

/// One backed-up disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskBackup {
    pub disk_snapshot_id: String,
    pub alias: String,
    pub path: PathBuf,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Why the transfer session could not be finalized, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalize_error: Option<String>,
}

/// Downloads disk snapshot images through the engine's imageio proxy.
pub struct TransferClient<'a, G: Gateway + ?Sized, P: ProxyChannel + ?Sized> {
    gateway: &'a G,
    proxy: &'a P,
    chunk_size: usize,
    checksum: bool,
    init_policy: PollPolicy,
    finalize_policy: PollPolicy,
    cancel: CancellationToken,
}

impl<'a, G: Gateway + ?Sized, P: ProxyChannel + ?Sized> TransferClient<'a, G, P> {
    /// Create a client with default chunk size and poll policies.
    pub fn new(gateway: &'a G, proxy: &'a P) -> Self {
        Self {
            gateway,
            proxy,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum: false,
            init_policy: PollPolicy::default(),
            finalize_policy: PollPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the read chunk size. Zero falls back to the default.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    /// Compute a SHA-256 digest of every image while streaming.
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// Set the policy for waiting on session initialization.
    pub fn with_init_policy(mut self, policy: PollPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    /// Set the policy for waiting on session finalization.
    pub fn with_finalize_policy(mut self, policy: PollPolicy) -> Self {
        self.finalize_policy = policy;
        self
    }

    /// Set the token that aborts session setup and downloads.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start a download session for `disk` and wait until it is usable.
    ///
    /// If the session was created but never became usable it is finalized
    /// before the error is returned.
    pub fn open_session(&self, disk: &DiskSnapshot) -> Result<TransferSession> {
        let transfer = self
            .gateway
            .create_image_transfer(&disk.id, TransferDirection::Download)?;
        debug!(disk = %disk.id, transfer = %transfer.id, phase = %transfer.phase, "created image transfer");

        let transfer_id = transfer.id.clone();
        let opened = self
            .await_initialized(disk, transfer)
            .and_then(|ready| TransferSession::from_transfer(disk, ready));

        if let Err(err) = &opened {
            warn!(disk = %disk.id, transfer = %transfer_id, error = %err, "image transfer never became usable");
            if let Err(finalize_err) = self.finalize_transfer(&transfer_id) {
                warn!(transfer = %transfer_id, error = %finalize_err, "failed to finalize unusable transfer");
            }
        }

        opened
    }

    fn await_initialized(&self, disk: &DiskSnapshot, created: ImageTransfer) -> Result<ImageTransfer> {
        let transfer_id = created.id.clone();
        let mut first = Some(created);
        let ready = poll_until("image transfer initialization", &self.init_policy, &self.cancel, |_| {
            let transfer = match first.take() {
                Some(transfer) => transfer,
                None => self.gateway.get_image_transfer(&transfer_id)?,
            };
            Ok((transfer.phase != TransferPhase::Initializing).then_some(transfer))
        })?;

        if ready.phase.is_failed() {
            return Err(Error::transfer(
                disk.file_name(),
                format!("transfer entered phase '{}'", ready.phase),
            ));
        }
        Ok(ready)
    }

    /// Stream the session's image into `destination`.
    ///
    /// Reads at most one chunk at a time and reports progress after each.
    /// An empty read before `Content-Length` bytes arrived means the peer
    /// went away. A partially written file is removed on failure.
    pub fn download(
        &self,
        session: &TransferSession,
        destination: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<Download> {
        let result = self.stream_to_file(session, destination, on_progress);
        if result.is_err() && destination.exists() {
            if let Err(err) = fs::remove_file(destination) {
                warn!(path = %destination.display(), error = %err, "failed to remove partial image");
            }
        }
        result
    }

    fn stream_to_file(
        &self,
        session: &TransferSession,
        destination: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<Download> {
        let label = session.disk.file_name();
        let mut response = self
            .proxy
            .get(&session.url, &session.signed_ticket)
            .map_err(|e| Error::transfer(&label, e.to_string()))?;

        if response.status >= 300 {
            let mut body = String::new();
            // Best effort: the status alone already decides the outcome.
            let _ = (&mut response.body)
                .take(MAX_ERROR_BODY)
                .read_to_string(&mut body);
            return Err(Error::transfer(
                &label,
                format!("proxy returned HTTP {}: {}", response.status, body.trim()),
            ));
        }

        let total = response
            .content_length
            .ok_or_else(|| Error::transfer(&label, "proxy response has no Content-Length"))?;
        info!(disk = %session.disk.id, bytes = total, "downloading disk snapshot");

        let mut file = File::create(destination).map_err(|e| Error::io(e, destination))?;
        let mut hasher = self.checksum.then(Sha256::new);
        let mut buffer = Vec::with_capacity(cmp::min(total, self.chunk_size as u64) as usize);
        let mut remaining = total;
        let mut chunks = 0u64;

        while remaining > 0 {
            self.cancel.check()?;

            let to_read = cmp::min(remaining, self.chunk_size as u64);
            buffer.clear();
            let read = (&mut response.body)
                .take(to_read)
                .read_to_end(&mut buffer)
                .map_err(|e| Error::transfer(&label, format!("read failed: {}", e)))?;

            if read == 0 {
                return Err(Error::transfer(
                    &label,
                    format!(
                        "peer disconnected with {} of {} bytes outstanding",
                        remaining, total
                    ),
                ));
            }

            file.write_all(&buffer)
                .map_err(|e| Error::io(e, destination))?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer);
            }

            remaining -= read as u64;
            chunks += 1;

            let progress = DownloadProgress {
                bytes_received: total - remaining,
                bytes_total: total,
                chunks,
            };
            debug!(disk = %session.disk.id, completed = %format!("{:.0}%", progress.fraction() * 100.0), "chunk written");
            on_progress(progress);
        }

        if total == 0 {
            on_progress(DownloadProgress {
                bytes_received: 0,
                bytes_total: 0,
                chunks: 0,
            });
        }

        file.sync_all().map_err(|e| Error::io(e, destination))?;

        Ok(Download {
            path: destination.to_path_buf(),
            bytes: total,
            chunks,
            sha256: hasher.map(|h| format!("{:x}", h.finalize())),
        })
    }

    /// Release the session and wait until the engine drops it.
    ///
    /// Runs to completion even after cancellation; only the finalize
    /// policy's deadline bounds it.
    pub fn finalize(&self, session: &TransferSession) -> Result<FinalizeOutcome> {
        let outcome = self.finalize_transfer(&session.transfer_id)?;
        debug!(disk = %session.disk.id, transfer = %session.transfer_id, polls = outcome.polls, "finalized image transfer");
        Ok(outcome)
    }

    fn finalize_transfer(&self, transfer_id: &str) -> Result<FinalizeOutcome> {
        match self.gateway.finalize_image_transfer(transfer_id) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(FinalizeOutcome { polls: 0 }),
            Err(err) => return Err(err),
        }

        let mut polls = 0u32;
        poll_until(
            "image transfer finalization",
            &self.finalize_policy,
            &CancellationToken::new(),
            |_| match self.gateway.get_image_transfer(transfer_id) {
                Ok(transfer) if transfer.phase == TransferPhase::FinishedFailure => {
                    Err(Error::transfer(
                        transfer_id,
                        "engine reports the transfer finished with failure",
                    ))
                }
                Ok(_) => {
                    polls += 1;
                    Ok(None)
                }
                Err(err) if err.is_not_found() => Ok(Some(())),
                Err(err) => Err(err),
            },
        )?;

        Ok(FinalizeOutcome { polls })
    }

    /// Back up one disk image into `directory` as `<alias>-<id>`.
    ///
    /// Finalization always runs once a session exists. Its failure is logged
    /// and recorded on the result; the bytes on disk decide success.
    pub fn transfer_disk(
        &self,
        disk: &DiskSnapshot,
        directory: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<DiskBackup> {
        info!(disk = %disk.id, alias = %disk.alias, "downloading disk snapshot");

        let session = self.open_session(disk)?;
        let destination = directory.join(disk.file_name());

        let downloaded = self.download(&session, &destination, on_progress);
        let finalized = self.finalize(&session);

        let finalize_error = match finalized {
            Ok(_) => None,
            Err(err) => {
                warn!(disk = %disk.id, transfer = %session.transfer_id, error = %err, "failed to finalize image transfer");
                Some(err.to_string())
            }
        };

        let download = downloaded?;
        Ok(DiskBackup {
            disk_snapshot_id: disk.id.clone(),
            alias: disk.alias.clone(),
            path: download.path,
            bytes: download.bytes,
            sha256: download.sha256,
            finalize_error,
        })
    }
}
