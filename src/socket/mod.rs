//! Transport-agnostic peer handles.
//!
//! A [`NetSocket`] is what an [`Endpoint`](crate::endpoint::Endpoint) sees of
//! one remote peer: a queue of outbound frame bytes and a decoder for inbound
//! ones. Transports own the actual I/O and hand bytes to
//! `Endpoint::socket_data_ingest`.
//!
//! # Architecture
//!
//! ```text
//!   Endpoint (hub)                         Endpoint (client)
//!  ┌──────────────────┐                   ┌──────────────────┐
//!  │ NetSocket UR_002 │◄── frames over ──►│ NetSocket SRV001 │
//!  │ NetSocket UR_003 │    memory or      │   (gateway)      │
//!  └──────────────────┘    Unix socket    └──────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 LE length][u8 type][payload]`
//!
//! See [`framing`] for frame types and codec.

pub mod framing;
pub mod memory;
pub mod unix;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;

use crate::address::Address;
use crate::error::{NetError, NetResult};
use crate::packet::Packet;
use framing::{Frame, FrameDecoder};

/// Process-unique socket identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SocketInner {
    id: SocketId,
    transport: &'static str,
    outbound: Mutex<Option<UnboundedSender<Vec<u8>>>>,
    uaddr: Mutex<Option<Address>>,
    decoder: Mutex<FrameDecoder>,
}

/// Handle to one remote peer.
///
/// Cheap to clone; clones share state. Two handles are equal when they refer
/// to the same connection.
#[derive(Clone)]
pub struct NetSocket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for NetSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetSocket")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport)
            .field("uaddr", &self.uaddr())
            .finish_non_exhaustive()
    }
}

impl PartialEq for NetSocket {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for NetSocket {}

impl NetSocket {
    /// Wrap an outbound byte queue. The transport drains the receiving end.
    pub fn new(transport: &'static str, outbound: UnboundedSender<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id: SocketId::next(),
                transport,
                outbound: Mutex::new(Some(outbound)),
                uaddr: Mutex::new(None),
                decoder: Mutex::new(FrameDecoder::new()),
            }),
        }
    }

    /// Socket identity.
    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    /// `"{transport}#{id}"`, used in logs before an address is bound.
    pub fn label(&self) -> String {
        format!("{}#{}", self.inner.transport, self.inner.id)
    }

    /// Address of the peer, once bound.
    pub fn uaddr(&self) -> Option<Address> {
        self.inner
            .uaddr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind the peer address. Only the first call takes effect.
    ///
    /// Returns `false` if the socket was already bound.
    pub fn bind(&self, addr: Address) -> bool {
        let mut slot = self.inner.uaddr.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(addr);
        true
    }

    /// `true` once an address is bound.
    pub fn is_bound(&self) -> bool {
        self.inner
            .uaddr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Queue pre-encoded frame bytes.
    pub fn send_bytes(&self, bytes: Vec<u8>) -> NetResult<()> {
        let guard = self.inner.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) if tx.send(bytes).is_ok() => Ok(()),
            _ => Err(NetError::SocketClosed(self.label())),
        }
    }

    /// Frame and queue a packet.
    pub fn send_packet(&self, packet: &Packet) -> NetResult<()> {
        let frame = Frame::from_packet(packet)?;
        self.send_bytes(frame.encode())
    }

    /// Run inbound bytes through this socket's frame decoder.
    pub fn feed(&self, bytes: &[u8]) -> NetResult<Vec<Frame>> {
        self.inner
            .decoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feed(bytes)
    }

    /// Drop the outbound queue. The transport's writer ends once drained.
    pub fn close(&self) {
        let tx = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tx.is_some() {
            log::debug!("[Socket] {} closed", self.label());
        }
    }

    /// `true` once [`close`](Self::close) ran or the transport went away.
    pub fn is_closed(&self) -> bool {
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(UnboundedSender::is_closed)
    }
}
