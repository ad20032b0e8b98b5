//! File retrieval for accepted transfer offers.
//!
//! - SOCKS5 bytestreams: stream hosts are tried in listed order until one
//!   completes the handshake; the payload follows the CONNECT reply on the
//!   same socket.
//! - Out-of-band: the offered URL is fetched over HTTP(S), subject to the
//!   configured [`OobPolicy`].
//!
//! Data is written to a temporary file inside the download directory and
//! moved to its final name only once the transfer has ended, so a partially
//! received file never appears under the final name.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use presence_core::{DomainError, OobTransfer, Socks5Transfer, StreamHost, Transfer};
use presence_protocol::socks5::{self, Socks5Error};

use crate::config::{Config, OobPolicy};

/// Socket read size while receiving a file
const READ_CHUNK_SIZE: usize = 8192;

/// Timeouts and policy applied to every retrieval.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub connect_timeout: Duration,

    /// Upper bound on a single read
    pub read_timeout: Duration,

    pub oob: OobPolicy,
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.transfer_timeout(),
            oob: config.oob.clone(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A completed retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    /// Final location of the file
    pub path: PathBuf,

    /// Bytes written, at most the announced size
    pub bytes: u64,

    /// Jid of the stream host that delivered a SOCKS5 transfer
    pub streamhost: Option<String>,
}

/// Retrieves the file offered by `transfer` into `download_dir`.
///
/// # Errors
///
/// Returns `TransferError` if the offer is incomplete, unsafe to fetch, or
/// no source delivered the file.
pub async fn retrieve(
    transfer: &Transfer,
    download_dir: &Path,
    settings: &TransferSettings,
) -> Result<Retrieved, TransferError> {
    transfer.validate()?;
    let destination = download_dir.join(transfer.local_file_name()?);

    match transfer {
        Transfer::Socks5(offer) => retrieve_socks5(offer, download_dir, &destination, settings).await,
        Transfer::Oob(offer) => retrieve_oob(offer, download_dir, &destination, settings).await,
    }
}

// ============================================================================
// SOCKS5 bytestreams
// ============================================================================

async fn retrieve_socks5(
    offer: &Socks5Transfer,
    download_dir: &Path,
    destination: &Path,
    settings: &TransferSettings,
) -> Result<Retrieved, TransferError> {
    let sid = offer.sid.as_deref().unwrap_or_default();
    let iq_id = offer.iq_id.as_deref().unwrap_or_default();
    let filesize = offer.info.filesize.unwrap_or_default();

    for host in &offer.streamhosts {
        debug!(host = %host.host, port = host.port, jid = %host.jid, "Connecting to stream host");
        let temp = new_temp_file(download_dir)?;
        match fetch_from_streamhost(host, sid, iq_id, filesize, &temp, settings).await {
            Ok(bytes) => {
                let path = persist(temp, destination)?;
                info!(path = %path.display(), bytes, "Download complete");
                return Ok(Retrieved {
                    path,
                    bytes,
                    streamhost: Some(host.jid.clone()),
                });
            }
            Err(e) => {
                warn!(host = %host.host, port = host.port, error = %e, "Stream host failed");
            }
        }
    }

    Err(TransferError::NoStreamHost {
        tried: offer.streamhosts.len(),
    })
}

/// Runs the handshake against one stream host and receives the payload.
async fn fetch_from_streamhost(
    host: &StreamHost,
    sid: &str,
    iq_id: &str,
    filesize: u64,
    temp: &NamedTempFile,
    settings: &TransferSettings,
) -> Result<u64, TransferError> {
    let mut stream = timeout(
        settings.connect_timeout,
        TcpStream::connect((host.host.as_str(), host.port)),
    )
    .await
    .map_err(|_| TransferError::Timeout)??;

    stream.write_all(&socks5::METHOD_SELECTION).await?;
    let mut method = [0u8; 2];
    timeout(settings.read_timeout, stream.read_exact(&mut method))
        .await
        .map_err(|_| TransferError::Timeout)??;
    socks5::check_method_reply(&method)?;

    let digest = socks5::destination_digest(sid, iq_id, &host.jid);
    stream.write_all(&socks5::connect_request(&digest)).await?;

    let mut file = File::from_std(temp.as_file().try_clone()?);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut reply = Vec::new();

    // The payload may arrive in the same segment as the reply.
    let payload_start = loop {
        let n = read_some(&mut stream, &mut buf, settings.read_timeout).await?;
        if n == 0 {
            return Err(TransferError::Io("Stream host closed during handshake".to_string()));
        }
        reply.extend_from_slice(buf.get(..n).unwrap_or_default());
        if let Some(offset) = socks5::parse_connect_reply(&reply)? {
            break offset;
        }
    };

    let mut written = 0u64;
    let leading = reply.get(payload_start..).unwrap_or_default();
    written += write_capped(&mut file, leading, filesize - written).await?;

    while written < filesize {
        let n = read_some(&mut stream, &mut buf, settings.read_timeout).await?;
        if n == 0 {
            debug!(written, filesize, "Stream host closed early, keeping truncated file");
            break;
        }
        written += write_capped(&mut file, buf.get(..n).unwrap_or_default(), filesize - written).await?;
    }
    file.flush().await?;
    debug!(written, filesize, "Read {}/{} bytes", written, filesize);
    Ok(written)
}

async fn read_some(
    stream: &mut TcpStream,
    buf: &mut [u8],
    read_timeout: Duration,
) -> Result<usize, TransferError> {
    timeout(read_timeout, stream.read(buf))
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(TransferError::from)
}

/// Writes at most `remaining` bytes of `data`, returning how many were written.
async fn write_capped(file: &mut File, data: &[u8], remaining: u64) -> Result<u64, TransferError> {
    let take = usize::try_from(remaining).map_or(data.len(), |r| r.min(data.len()));
    let part = data.get(..take).unwrap_or_default();
    file.write_all(part).await?;
    Ok(part.len() as u64)
}

// ============================================================================
// Out-of-band (HTTP)
// ============================================================================

async fn retrieve_oob(
    offer: &OobTransfer,
    download_dir: &Path,
    destination: &Path,
    settings: &TransferSettings,
) -> Result<Retrieved, TransferError> {
    let url = offer.info.filename.as_deref().unwrap_or_default();
    let filesize = offer.info.filesize.unwrap_or_default();
    let vetted = check_url(url, &settings.oob).await?;
    debug!(url = %vetted.url, addrs = ?vetted.addrs, filesize, "Retrieving file");

    let client = http_client(settings, &vetted)?;
    let mut response = client
        .get(vetted.url.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| TransferError::Http(e.to_string()))?;

    let temp = new_temp_file(download_dir)?;
    let mut file = File::from_std(temp.as_file().try_clone()?);
    let mut written = 0u64;

    while written < filesize {
        let chunk = timeout(settings.read_timeout, response.chunk())
            .await
            .map_err(|_| TransferError::Timeout)?
            .map_err(|e| TransferError::Http(e.to_string()))?;
        let Some(chunk) = chunk else {
            debug!(written, filesize, "Body ended early, keeping truncated file");
            break;
        };
        written += write_capped(&mut file, &chunk, filesize - written).await?;
    }
    file.flush().await?;
    drop(file);

    let path = persist(temp, destination)?;
    info!(path = %path.display(), bytes = written, "Download complete");
    Ok(Retrieved {
        path,
        bytes: written,
        streamhost: None,
    })
}

/// An offered URL and the addresses its host resolved to when checked.
#[derive(Debug, Clone)]
struct VettedUrl {
    url: reqwest::Url,
    addrs: Vec<SocketAddr>,
}

/// Applies the OOB policy to an offered URL.
async fn check_url(raw: &str, policy: &OobPolicy) -> Result<VettedUrl, TransferError> {
    let rejected = |reason: &str| TransferError::UrlRejected {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = reqwest::Url::parse(raw).map_err(|e| rejected(&e.to_string()))?;
    if !policy
        .allowed_schemes
        .iter()
        .any(|s| s.eq_ignore_ascii_case(url.scheme()))
    {
        return Err(rejected("scheme not allowed"));
    }
    let host = url.host_str().ok_or_else(|| rejected("no host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_or_known_default().unwrap_or(80);

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| rejected(&e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(rejected("host does not resolve"));
    }
    if !policy.allow_private_hosts && addrs.iter().any(|addr| is_private(addr.ip())) {
        return Err(rejected("private address"));
    }
    Ok(VettedUrl { url, addrs })
}

/// HTTP client that connects only to the addresses `vetted` was checked
/// against; the host name is never resolved a second time.
fn http_client(settings: &TransferSettings, vetted: &VettedUrl) -> Result<reqwest::Client, TransferError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .redirect(reqwest::redirect::Policy::none());
    if let Some(domain) = vetted.url.domain() {
        builder = builder.resolve_to_addrs(domain, &vetted.addrs);
    }
    builder.build().map_err(|e| TransferError::Http(e.to_string()))
}

/// Addresses that are not globally reachable unicast: loopback, private,
/// shared (CGNAT), link-local, benchmarking, documentation, multicast,
/// reserved, unspecified and broadcast.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || a == 0
                || a >= 240
                || (a == 100 && (b & 0xc0) == 64)
                || (a == 198 && (b & 0xfe) == 18)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private(IpAddr::V4(v4));
            }
            let segments = v6.segments();
            let first = segments.first().copied().unwrap_or_default();
            let second = segments.get(1).copied().unwrap_or_default();
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || (first == 0x2001 && second == 0x0db8)
        }
    }
}

// ============================================================================
// Files
// ============================================================================

fn new_temp_file(download_dir: &Path) -> Result<NamedTempFile, TransferError> {
    NamedTempFile::new_in(download_dir).map_err(|e| TransferError::Storage {
        path: download_dir.to_path_buf(),
        error: e.to_string(),
    })
}

fn persist(temp: NamedTempFile, destination: &Path) -> Result<PathBuf, TransferError> {
    temp.persist(destination).map_err(|e| TransferError::Storage {
        path: destination.to_path_buf(),
        error: e.error.to_string(),
    })?;
    Ok(destination.to_path_buf())
}

/// Errors that can occur while retrieving a file.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Offer(#[from] DomainError),

    #[error("SOCKS5 handshake failed: {0}")]
    Handshake(#[from] Socks5Error),

    #[error("No stream host delivered the file ({tried} tried)")]
    NoStreamHost { tried: usize },

    #[error("Refusing to fetch {url}: {reason}")]
    UrlRejected { url: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Timed out")]
    Timeout,

    #[error("Failed to store file at {path}: {error}")]
    Storage { path: PathBuf, error: String },
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
