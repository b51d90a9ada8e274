//! Public Address Lookup
//!
//! Asks a plain-text "what is my IP" endpoint which address the world sees.
//! Only used to enrich the "kill switch opened" notification, so every
//! failure collapses to `None` and never delays gating beyond the timeout.
//!
//! Uses hyper over rustls on a caller-provided tokio runtime handle. The
//! governor loop is synchronous, so [`PublicAddressResolver::resolve`]
//! blocks on that handle; it must not be called from inside the runtime.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Request, Uri};
use rustls::ClientConfig;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Largest body accepted from the endpoint
const MAX_BODY_SIZE: usize = 256;

/// Lookup errors
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Response is not an IP address: {0:?}")]
    NotAnAddress(String),

    #[error("Request timeout")]
    Timeout,
}

/// Resolves the host's public-facing address
pub trait PublicAddressResolver: Send {
    /// Best-effort lookup; `None` on any failure
    fn resolve(&self, timeout: Duration) -> Option<IpAddr>;
}

/// HTTPS (or HTTP) lookup against a plain-text endpoint
pub struct HttpAddressResolver {
    handle: Handle,
    url: String,
    user_agent: String,
}

impl HttpAddressResolver {
    pub fn new(handle: Handle, url: impl Into<String>) -> Self {
        Self {
            handle,
            url: url.into(),
            user_agent: format!("tunlock/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Perform one lookup
    pub async fn lookup(&self) -> Result<IpAddr, LookupError> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| LookupError::InvalidUrl(e.to_string()))?;

        let host = uri
            .host()
            .ok_or_else(|| LookupError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let is_https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let request = Request::builder()
            .uri(&uri)
            .header(USER_AGENT, &self.user_agent)
            .header(HOST, &host)
            .body(Empty::<Bytes>::new())
            .map_err(|e| LookupError::HttpError(e.to_string()))?;

        let stream = tokio::net::TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| LookupError::ConnectionFailed(e.to_string()))?;

        let response = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| LookupError::TlsError("Invalid server name".to_string()))?;

            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| LookupError::TlsError(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| LookupError::HttpError(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Address lookup connection error: {}", e);
                }
            });

            sender.send_request(request).await
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| LookupError::HttpError(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Address lookup connection error: {}", e);
                }
            });

            sender.send_request(request).await
        }
        .map_err(|e| LookupError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| LookupError::HttpError(e.to_string()))?
            .to_bytes();

        if body.len() > MAX_BODY_SIZE {
            return Err(LookupError::NotAnAddress(format!("{} byte body", body.len())));
        }

        parse_address_body(&String::from_utf8_lossy(&body))
    }
}

impl PublicAddressResolver for HttpAddressResolver {
    fn resolve(&self, timeout: Duration) -> Option<IpAddr> {
        let result = self
            .handle
            .block_on(async { tokio::time::timeout(timeout, self.lookup()).await });

        match result {
            Ok(Ok(addr)) => {
                debug!("Public address: {}", addr);
                Some(addr)
            }
            Ok(Err(e)) => {
                warn!("Public address lookup failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Public address lookup failed: {}", LookupError::Timeout);
                None
            }
        }
    }
}

/// Parse a plain-text body such as `"203.0.113.7\n"`
pub fn parse_address_body(body: &str) -> Result<IpAddr, LookupError> {
    let trimmed = body.trim();
    trimmed
        .parse()
        .map_err(|_| LookupError::NotAnAddress(trimmed.to_string()))
}
