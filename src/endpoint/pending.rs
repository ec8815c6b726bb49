//! Calls awaiting a response packet.
//!
//! Entries are keyed by packet hash and the socket the request went out on,
//! so the same forwarded request can wait on several peers at once.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{NetError, NetResult};
use crate::socket::SocketId;

type Reply = NetResult<Option<Value>>;

#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    waiters: Mutex<HashMap<(String, SocketId), oneshot::Sender<Reply>>>,
}

impl PendingCalls {
    pub(crate) fn register(&self, hash: String, socket: SocketId) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if waiters.insert((hash.clone(), socket), tx).is_some() {
            log::warn!("[Endpoint] replaced pending call {hash} on socket {socket}");
        }
        rx
    }

    /// Deliver a reply. Returns `false` if nobody was waiting.
    pub(crate) fn resolve(&self, hash: &str, socket: SocketId, reply: Reply) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(hash.to_string(), socket));
        match waiter {
            Some(tx) => {
                // receiver gone means the caller already timed out
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel(&self, hash: &str, socket: SocketId) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(hash.to_string(), socket));
    }

    /// Fail every call waiting on `socket`. Returns how many were failed.
    pub(crate) fn fail_socket(&self, socket: SocketId, err: &NetError) -> usize {
        let failed: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<_> = waiters
                .keys()
                .filter(|(_, sock)| *sock == socket)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| waiters.remove(&key))
                .collect()
        };
        let count = failed.len();
        for tx in failed {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Await a registered reply, bounded by `timeout`.
///
/// The caller must [`cancel`](PendingCalls::cancel) the entry when this
/// returns [`NetError::Timeout`].
pub(crate) async fn wait_reply(
    rx: oneshot::Receiver<Reply>,
    msg: &str,
    timeout: Duration,
) -> Reply {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => Err(NetError::PeerDisconnected(msg.to_string())),
        Err(_) => Err(NetError::Timeout {
            msg: msg.to_string(),
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
