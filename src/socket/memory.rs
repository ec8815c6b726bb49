//! In-process transport.
//!
//! [`link`] joins two endpoints with a pair of byte queues. Each side gets a
//! [`NetSocket`] and a pump task that feeds the other side's frames into its
//! endpoint. Closing either socket ends both pumps and both endpoints see
//! `socket_closed`.

use std::fmt;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use super::NetSocket;
use crate::address::Address;
use crate::endpoint::Endpoint;
use crate::error::NetResult;

const TRANSPORT: &str = "memory";

/// Two sockets joined in memory.
pub struct MemoryLink {
    /// Server side's handle to the client.
    pub server_socket: NetSocket,
    /// Client side's handle to the server (its gateway).
    pub client_socket: NetSocket,
    pumps: Vec<JoinHandle<()>>,
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("server_socket", &self.server_socket)
            .field("client_socket", &self.client_socket)
            .finish_non_exhaustive()
    }
}

impl MemoryLink {
    /// Close the link from the client side. Both endpoints are notified.
    pub fn disconnect(&self) {
        self.client_socket.close();
    }

    /// `true` once both pumps have stopped.
    pub fn is_finished(&self) -> bool {
        self.pumps.iter().all(JoinHandle::is_finished)
    }
}

/// Join `server` and `client` without a handshake.
pub fn link(server: &Endpoint, client: &Endpoint) -> MemoryLink {
    let (to_client, from_server) = mpsc::unbounded_channel();
    let (to_server, from_client) = mpsc::unbounded_channel();

    let server_socket = NetSocket::new(TRANSPORT, to_client);
    let client_socket = NetSocket::new(TRANSPORT, to_server);

    let pumps = vec![
        tokio::spawn(pump(server.clone(), server_socket.clone(), from_client)),
        tokio::spawn(pump(client.clone(), client_socket.clone(), from_server)),
    ];

    MemoryLink {
        server_socket,
        client_socket,
        pumps,
    }
}

/// Link, handshake, and declare the client's networked messages. On failure
/// the link is torn down.
pub async fn connect(
    server: &Endpoint,
    client: &Endpoint,
    auth: Option<Value>,
) -> NetResult<(MemoryLink, Address)> {
    let link = link(server, client);
    let result = async {
        let addr = client
            .connect_as_client(link.client_socket.clone(), auth)
            .await?;
        client.register_messages().await?;
        Ok(addr)
    }
    .await;
    match result {
        Ok(addr) => Ok((link, addr)),
        Err(e) => {
            client.abandon_gateway(&link.client_socket);
            Err(e)
        }
    }
}

async fn pump(endpoint: Endpoint, socket: NetSocket, mut rx: UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        endpoint.socket_data_ingest(&socket, &bytes);
    }
    log::debug!("[Socket] {} peer went away", socket.label());
    endpoint.socket_closed(&socket);
}
