//! Unix domain socket transport.
//!
//! [`UnixSocketServer`] listens on a socket file and wraps each accepted
//! connection in a [`NetSocket`]. [`connect`] does the same for the client
//! side and runs the handshake. Both sides use the same read/write tasks:
//!
//! - Read task: stream bytes → `Endpoint::socket_data_ingest`
//! - Write task: socket's outbound queue → stream

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use super::NetSocket;
use crate::address::Address;
use crate::constants::{ACCEPT_RETRY_DELAY, MAX_SOCKET_PATH, READ_BUFFER_SIZE};
use crate::endpoint::Endpoint;
use crate::error::NetResult;

const TRANSPORT: &str = "unix";

/// Accepts client connections for a hub endpoint.
#[derive(Debug)]
pub struct UnixSocketServer {
    /// Path to the socket file (for cleanup).
    socket_path: PathBuf,
    /// Handle to the accept loop task.
    accept_handle: JoinHandle<()>,
}

impl UnixSocketServer {
    /// Start listening at `socket_path` and route connections to `endpoint`.
    ///
    /// Removes any stale socket file, binds the listener, sets permissions
    /// to 0600, and spawns the accept loop. Accepted sockets become clients
    /// of `endpoint` on their first packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long or the socket cannot be bound.
    pub fn start(socket_path: PathBuf, endpoint: Endpoint) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            bail!(
                "Socket path too long ({path_len} bytes, max {}): {}\n\
                 Consider setting URNET_SOCKET_PATH to a shorter value.",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove stale socket: {}", socket_path.display())
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[Socket] {} listening on {}", endpoint.name(), socket_path.display());

        let accept_handle = tokio::spawn(Self::accept_loop(listener, endpoint, socket_path.clone()));

        Ok(Self {
            socket_path,
            accept_handle,
        })
    }

    async fn accept_loop(listener: UnixListener, endpoint: Endpoint, socket_path: PathBuf) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let socket = spawn_connection(stream, &endpoint);
                    log::info!("[Socket] Client connected: {}", socket.label());
                }
                Err(e) => {
                    if !socket_path.exists() {
                        log::info!("[Socket] Socket file removed, stopping accept loop");
                        break;
                    }
                    log::error!("[Socket] Accept error: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Stop accepting and remove the socket file. Open connections stay up.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!("[Socket] cleanup {}: {e}", self.socket_path.display());
        }
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Connect `endpoint` as a client of the hub listening at `path`.
///
/// Runs the handshake and declares the endpoint's networked messages. On
/// failure the connection is closed.
pub async fn connect(path: &Path, endpoint: &Endpoint, auth: Option<Value>) -> NetResult<Address> {
    let stream = UnixStream::connect(path).await?;
    let socket = spawn_connection(stream, endpoint);
    let result = async {
        let addr = endpoint.connect_as_client(socket.clone(), auth).await?;
        endpoint.register_messages().await?;
        Ok(addr)
    }
    .await;
    if result.is_err() {
        endpoint.abandon_gateway(&socket);
    }
    result
}

/// Wrap a connected stream in a socket and start its read/write tasks.
pub fn spawn_connection(stream: UnixStream, endpoint: &Endpoint) -> NetSocket {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let socket = NetSocket::new(TRANSPORT, tx);

    tokio::spawn(write_loop(socket.label(), write_half, rx));
    tokio::spawn(read_loop(socket.clone(), read_half, endpoint.clone()));
    socket
}

async fn read_loop(socket: NetSocket, mut reader: OwnedReadHalf, endpoint: Endpoint) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Socket] Peer disconnected: {}", socket.label());
                break;
            }
            Ok(n) => {
                endpoint.socket_data_ingest(&socket, &buf[..n]);
                if socket.is_closed() {
                    break;
                }
            }
            Err(e) => {
                log::error!("[Socket] Read error for {}: {e}", socket.label());
                break;
            }
        }
    }
    endpoint.socket_closed(&socket);
}

async fn write_loop(label: String, mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Socket] Write error for {label}: {e}");
            return;
        }
    }
    // queue closed: let the peer see EOF
    if let Err(e) = writer.shutdown().await {
        log::debug!("[Socket] Shutdown for {label}: {e}");
    }
}
