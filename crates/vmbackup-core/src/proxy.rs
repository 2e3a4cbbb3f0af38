//! The byte channel to the imageio proxy.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::Certificate;
use tracing::debug;
use url::Url;

use crate::error::{Error, RemoteErrorKind, Result};

/// Default timeout for establishing a proxy connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response head plus a streaming body.
pub struct ProxyResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value of the `Content-Length` header, if present and numeric.
    pub content_length: Option<u64>,
    /// The response body, read lazily.
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Something that can issue a ticket-authorized GET against a proxy URL.
pub trait ProxyChannel: Send + Sync {
    /// Send `GET url` with `Authorization: <ticket>` and return the response
    /// without reading its body.
    fn get(&self, url: &Url, ticket: &str) -> Result<ProxyResponse>;
}

/// Load a PEM CA bundle for verifying engine and proxy certificates.
pub fn load_ca_certificate(path: &Path) -> Result<Certificate> {
    let pem = fs::read(path).map_err(|e| Error::io(e, path))?;
    Certificate::from_pem(&pem).map_err(|e| {
        Error::configuration(format!(
            "invalid CA certificate '{}': {}",
            path.display(),
            e
        ))
    })
}

/// HTTPS proxy channel backed by a blocking reqwest client.
#[derive(Debug, Clone)]
pub struct HttpsProxyChannel {
    client: Client,
}

impl HttpsProxyChannel {
    /// Build a channel trusting the system roots plus `ca_file`, if given.
    pub fn new(ca_file: Option<&Path>) -> Result<Self> {
        Self::with_connect_timeout(ca_file, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Build a channel with an explicit connect timeout.
    pub fn with_connect_timeout(ca_file: Option<&Path>, connect_timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(connect_timeout)
            // Image bodies can take hours; only the connect phase is bounded.
            .timeout(None::<Duration>);

        if let Some(path) = ca_file {
            builder = builder.add_root_certificate(load_ca_certificate(path)?);
        }

        let client = builder.build().map_err(|e| {
            Error::configuration(format!("failed to build proxy HTTP client: {}", e))
        })?;

        Ok(Self { client })
    }
}

impl ProxyChannel for HttpsProxyChannel {
    fn get(&self, url: &Url, ticket: &str) -> Result<ProxyResponse> {
        debug!(%url, "requesting image from proxy");

        let response = self
            .client
            .get(url.clone())
            .header(AUTHORIZATION, ticket)
            .send()
            .map_err(|e| Error::remote("proxy GET", RemoteErrorKind::Network, e.to_string()))?;

        let status = response.status().as_u16();
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        debug!(%url, status, ?content_length, "proxy responded");

        Ok(ProxyResponse {
            status,
            content_length,
            body: Box::new(response),
        })
    }
}
