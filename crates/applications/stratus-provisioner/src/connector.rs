//! SSH reachability connector
//!
//! Opens a TCP connection to the worker's SSH port and reads the server's
//! identification line (RFC 4253 section 4.2). Lines sent before the banner
//! are skipped. Anything that answers but is not SSH 2 is a fatal error;
//! refused, reset or silent connections are retryable because sshd may still
//! be starting.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use stratus_core::{Channel, ConnectError, Connector, Credentials};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Time allowed for the banner once the TCP connection is up
pub const DEFAULT_BANNER_TIMEOUT_SECS: u64 = 10;

/// Lines a server may send before its identification string
const MAX_PREAMBLE_LINES: usize = 5;

/// Identification sent back to the server
const CLIENT_IDENT: &str = concat!("SSH-2.0-stratus_", env!("CARGO_PKG_VERSION"), "\r\n");

/// Established connection to a worker's SSH daemon
#[derive(Debug)]
pub struct SshChannel {
    peer: String,
    remote_id: String,
    username: String,
    stream: TcpStream,
}

impl SshChannel {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Channel for SshChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }
}

/// Connector that validates the SSH banner
#[derive(Debug, Clone)]
pub struct SshProbeConnector {
    banner_timeout: Duration,
}

impl Default for SshProbeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SshProbeConnector {
    pub fn new() -> Self {
        Self {
            banner_timeout: Duration::from_secs(DEFAULT_BANNER_TIMEOUT_SECS),
        }
    }

    pub fn with_banner_timeout(mut self, timeout: Duration) -> Self {
        self.banner_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for SshProbeConnector {
    async fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn Channel>, ConnectError> {
        if let Some(key) = &credentials.private_key_path {
            if !tokio::fs::try_exists(key).await.unwrap_or(false) {
                return Err(ConnectError::fatal(format!(
                    "private key {} not found",
                    key.display()
                )));
            }
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ConnectError::retryable(format!("{}: {}", address, e)))?;
        let mut reader = BufReader::new(stream);

        let banner = tokio::time::timeout(self.banner_timeout, read_banner(&mut reader))
            .await
            .map_err(|_| {
                ConnectError::retryable(format!(
                    "{}: no SSH banner within {:?}",
                    address, self.banner_timeout
                ))
            })??;

        let mut stream = reader.into_inner();
        stream
            .write_all(CLIENT_IDENT.as_bytes())
            .await
            .map_err(|e| ConnectError::retryable(format!("{}: {}", address, e)))?;

        debug!(%address, %banner, user = %credentials.username, "SSH banner received");

        Ok(Box::new(SshChannel {
            peer: address.to_string(),
            remote_id: banner,
            username: credentials.username.clone(),
            stream,
        }))
    }
}

async fn read_banner<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ConnectError> {
    for _ in 0..MAX_PREAMBLE_LINES {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await.map_err(|e| match e.kind() {
            ErrorKind::InvalidData => ConnectError::fatal("peer sent non-text data"),
            _ => ConnectError::retryable(e.to_string()),
        })?;
        if read == 0 {
            return Err(ConnectError::retryable("connection closed before SSH banner"));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.starts_with("SSH-") {
            if line.starts_with("SSH-2.0-") || line.starts_with("SSH-1.99-") {
                return Ok(line.to_string());
            }
            return Err(ConnectError::fatal(format!("unsupported SSH version: {}", line)));
        }
    }

    Err(ConnectError::fatal("peer did not identify as an SSH server"))
}
