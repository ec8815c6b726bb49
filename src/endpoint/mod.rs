//! Addressable message endpoints.
//!
//! An [`Endpoint`] owns a handler table and, depending on its role, either a
//! set of client sockets (hub) or one gateway socket (client).
//!
//! # Roles
//!
//! ```text
//!                  config_as_server()
//!  Unconfigured ──────────────────────► Server  (many sockets, routes)
//!        │
//!        │ connect_as_client()
//!        ▼
//!      Client  (one gateway socket to a Server)
//! ```
//!
//! `LOCAL` messages never leave the process regardless of role. Networked
//! messages (`NET`, `SRV`, `SYNC`) are routed by the hub: a client hands
//! every networked packet to its gateway and the hub fans it out to its own
//! handlers and to clients that declared the message.
//!
//! # Calling conventions
//!
//! | Operation | Reply | Origin re-invoked |
//! |-----------|-------|-------------------|
//! | `signal`  | no    | yes, exactly once (hub echo) |
//! | `send`    | no    | never |
//! | `call`    | yes   | never |

pub mod handlers;
mod pending;
mod routing;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};

use crate::address::{Address, AddressAllocator, AddressPrefix, AllocateOptions};
use crate::constants::DEFAULT_CALL_TIMEOUT;
use crate::error::{NetError, NetResult};
use crate::message::{decode_message, format_message, normalize_message, normalize_payload};
use crate::packet::{Delivery, Packet, PacketType, SpecialType};
use crate::socket::NetSocket;

pub use handlers::{HandlerFuture, MessageHandler};
use handlers::HandlerTable;
use pending::PendingCalls;

/// Tunables for an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// How long a networked `call` waits for its reply.
    pub call_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// What part an endpoint plays on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Neither hub nor client yet. Only `LOCAL` messages work.
    Unconfigured,
    /// Hub: accepts clients and routes between them.
    Server,
    /// Client: talks to one hub through its gateway socket.
    Client,
}

#[derive(Debug)]
struct PeerEntry {
    socket: NetSocket,
    name: Option<String>,
    declared: BTreeSet<String>,
}

#[derive(Debug)]
struct EndpointState {
    uaddr: Option<Address>,
    role: Role,
    handlers: HandlerTable,
    /// Server role: connected clients by assigned address.
    clients: BTreeMap<Address, PeerEntry>,
    /// Client role: socket to the hub.
    gateway: Option<NetSocket>,
    /// Client role: the hub's address.
    srv_addr: Option<Address>,
}

struct EndpointInner {
    name: String,
    allocator: Arc<AddressAllocator>,
    config: EndpointConfig,
    next_pkt_id: AtomicU64,
    state: Mutex<EndpointState>,
    pending: PendingCalls,
}

/// An addressable node on the message network.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("uaddr", &state.uaddr)
            .field("role", &state.role)
            .field("clients", &state.clients.len())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Create an unconfigured endpoint with default settings.
    pub fn new(name: impl Into<String>, allocator: Arc<AddressAllocator>) -> Self {
        Self::with_config(name, allocator, EndpointConfig::default())
    }

    /// Create an unconfigured endpoint.
    pub fn with_config(
        name: impl Into<String>,
        allocator: Arc<AddressAllocator>,
        config: EndpointConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                name: name.into(),
                allocator,
                config,
                next_pkt_id: AtomicU64::new(1),
                state: Mutex::new(EndpointState {
                    uaddr: None,
                    role: Role::Unconfigured,
                    handlers: HandlerTable::default(),
                    clients: BTreeMap::new(),
                    gateway: None,
                    srv_addr: None,
                }),
                pending: PendingCalls::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_pkt_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Source address for outgoing packets.
    fn src_addr(&self) -> Address {
        self.uaddr().unwrap_or_else(Address::unroutable)
    }

    // ---- accessors ----

    /// Endpoint name, sent to the hub on registration.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Own address, once configured or assigned.
    pub fn uaddr(&self) -> Option<Address> {
        self.state().uaddr.clone()
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.state().role
    }

    /// Client role: the hub's address.
    pub fn srv_addr(&self) -> Option<Address> {
        self.state().srv_addr.clone()
    }

    /// Settings this endpoint was built with.
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Allocator shared with the rest of the process.
    pub fn allocator(&self) -> &Arc<AddressAllocator> {
        &self.inner.allocator
    }

    /// Calls still waiting on a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ---- handlers ----

    /// Append a handler for `msg`.
    pub fn add_message_handler(&self, msg: &str, handler: MessageHandler) -> NetResult<()> {
        let msg = normalize_message(msg)?;
        log::debug!("[Endpoint] {} handles {msg}", self.inner.name);
        self.state().handlers.add(msg, handler);
        Ok(())
    }

    /// Remove `handler` from `msg`. Every registration of that handler goes.
    ///
    /// Returns `false` if it was not registered.
    pub fn delete_message_handler(&self, msg: &str, handler: &MessageHandler) -> NetResult<bool> {
        let msg = normalize_message(msg)?;
        Ok(self.state().handlers.remove(&msg, handler) > 0)
    }

    /// `true` if at least one local handler is registered for `msg`.
    pub fn has_handler(&self, msg: &str) -> bool {
        normalize_message(msg).is_ok_and(|msg| self.state().handlers.has(&msg))
    }

    /// Normalized names with local handlers, sorted.
    pub fn handled_messages(&self) -> Vec<String> {
        self.state().handlers.names()
    }

    /// Add a handler and, on a connected client, declare it to the hub.
    pub async fn register_message(&self, msg: &str, handler: MessageHandler) -> NetResult<()> {
        self.add_message_handler(msg, handler)?;
        let (channel, _) = decode_message(msg)?;
        let connected = {
            let state = self.state();
            state.role == Role::Client && state.gateway.is_some()
        };
        if connected && channel.is_networked() {
            self.register_messages().await?;
        }
        Ok(())
    }

    /// Declare every `NET`/`SYNC` handler to the hub.
    ///
    /// Returns the names the hub accepted. A declaration replaces the
    /// previous one.
    pub async fn register_messages(&self) -> NetResult<Vec<String>> {
        let (gateway, msg_list) = {
            let state = self.state();
            let gateway = match (state.role, &state.gateway) {
                (Role::Client, Some(gw)) => gw.clone(),
                _ => return Err(NetError::NotConnected(self.inner.name.clone())),
            };
            (gateway, state.handlers.declarable())
        };
        let packet = Packet::special(
            self.next_id(),
            SpecialType::Decl,
            json!({ "msg_list": msg_list }),
            self.src_addr(),
        );
        let reply: routing::DeclReply = routing::parse_reply(self.request(&gateway, &packet).await?)?;
        log::info!(
            "[Endpoint] {} declared {} message(s)",
            self.inner.name,
            reply.msg_list.len()
        );
        Ok(reply.msg_list)
    }

    // ---- roles ----

    /// Become a hub at `addr_hint`, or at a generated `SRV` address.
    ///
    /// # Errors
    ///
    /// - [`NetError::Rejected`] if the endpoint already has a role
    /// - allocation errors for the hint
    pub fn config_as_server(&self, addr_hint: Option<&str>) -> NetResult<Address> {
        if self.role() != Role::Unconfigured {
            return Err(NetError::Rejected(format!(
                "{} is already configured",
                self.inner.name
            )));
        }
        let opts = match addr_hint {
            Some(hint) => AllocateOptions::with_addr(hint),
            None => AllocateOptions::with_prefix(AddressPrefix::Srv),
        };
        let addr = self.inner.allocator.allocate(opts)?;

        let mut state = self.state();
        state.uaddr = Some(addr.clone());
        state.role = Role::Server;
        log::info!("[Endpoint] {} serving as {addr}", self.inner.name);
        Ok(addr)
    }

    /// Become a client of the hub at the other end of `socket`.
    ///
    /// Runs the `_auth` then `_reg` handshake and returns the address the hub
    /// assigned. `socket` is closed if the handshake fails. Messages are not
    /// declared; call
    /// [`register_messages`](Self::register_messages) for that.
    pub async fn connect_as_client(
        &self,
        socket: NetSocket,
        auth: Option<Value>,
    ) -> NetResult<Address> {
        {
            let mut state = self.state();
            if state.role != Role::Unconfigured {
                socket.close();
                return Err(NetError::Rejected(format!(
                    "{} is already configured",
                    self.inner.name
                )));
            }
            state.role = Role::Client;
            state.gateway = Some(socket.clone());
        }

        match self.handshake(&socket, auth).await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                log::warn!("[Endpoint] {} handshake failed: {e}", self.inner.name);
                self.abandon_gateway(&socket);
                Err(e)
            }
        }
    }

    /// Close `socket` and, if it is this endpoint's gateway, return to the
    /// unconfigured state so the endpoint can connect again.
    pub(crate) fn abandon_gateway(&self, socket: &NetSocket) {
        socket.close();
        {
            let mut state = self.state();
            if state.gateway.as_ref() == Some(socket) {
                state.role = Role::Unconfigured;
                state.gateway = None;
                state.uaddr = None;
                state.srv_addr = None;
            }
        }
        let err = NetError::disconnected(socket.uaddr().as_ref(), &socket.label());
        self.inner.pending.fail_socket(socket.id(), &err);
    }

    async fn handshake(&self, socket: &NetSocket, auth: Option<Value>) -> NetResult<Address> {
        let token = match auth {
            Some(token) => json!({ "token": token }),
            None => json!({}),
        };
        let packet = Packet::special(self.next_id(), SpecialType::Auth, token, Address::unroutable());
        let reply: routing::AuthReply = routing::parse_reply(self.request(socket, &packet).await?)?;

        {
            let mut state = self.state();
            state.uaddr = Some(reply.uaddr.clone());
            state.srv_addr = Some(reply.srv_addr.clone());
        }
        socket.bind(reply.srv_addr.clone());

        let packet = Packet::special(
            self.next_id(),
            SpecialType::Reg,
            json!({ "name": self.inner.name }),
            reply.uaddr.clone(),
        );
        self.request(socket, &packet).await?;

        log::info!(
            "[Endpoint] {} connected to {} as {}",
            self.inner.name,
            reply.srv_addr,
            reply.uaddr
        );
        Ok(reply.uaddr)
    }

    // ---- messaging ----

    /// Broadcast to every handler of `msg`, including the caller's own.
    pub async fn signal(&self, msg: &str, data: Option<Value>) -> NetResult<()> {
        self.dispatch(Delivery::Signal, msg, data, None).await.map(drop)
    }

    /// Deliver to every handler of `msg` except the caller's own.
    pub async fn send(&self, msg: &str, data: Option<Value>) -> NetResult<()> {
        self.dispatch(Delivery::Send, msg, data, None).await.map(drop)
    }

    /// Like [`send`](Self::send), narrowed to the endpoint at `dst`.
    pub async fn send_to(&self, dst: &Address, msg: &str, data: Option<Value>) -> NetResult<()> {
        self.dispatch(Delivery::Send, msg, data, Some(dst.clone()))
            .await
            .map(drop)
    }

    /// Invoke every handler of `msg` and collect the results.
    ///
    /// Results arrive in handler order (local first, then remote peers by
    /// address) and are normalized, so a single handler's value comes back
    /// unwrapped.
    ///
    /// # Errors
    ///
    /// - [`NetError::NoHandler`] if nothing handles `msg`
    /// - [`NetError::Handler`] if a handler failed
    /// - [`NetError::PeerDisconnected`] if a peer closed mid-call
    /// - [`NetError::Timeout`] after [`EndpointConfig::call_timeout`]
    pub async fn call(&self, msg: &str, data: Option<Value>) -> NetResult<Option<Value>> {
        self.dispatch(Delivery::Call, msg, data, None).await
    }

    /// Addresses that would receive `msg`.
    pub async fn ping(&self, msg: &str) -> NetResult<Vec<Address>> {
        let (channel, name) = decode_message(msg)?;
        let msg = format_message(channel, &name);
        if !channel.is_networked() || self.role() != Role::Client {
            return Ok(self.ping_local(&msg));
        }
        let gateway = self.gateway()?;
        let packet = Packet::request(
            self.next_id(),
            PacketType::Ping,
            channel,
            name,
            None,
            self.src_addr(),
        );
        let reply: routing::PingReply = routing::parse_reply(self.request(&gateway, &packet).await?)?;
        Ok(reply.addrs)
    }

    async fn dispatch(
        &self,
        delivery: Delivery,
        msg: &str,
        data: Option<Value>,
        dst: Option<Address>,
    ) -> NetResult<Option<Value>> {
        let (channel, name) = decode_message(msg)?;
        let msg = format_message(channel, &name);
        let data = normalize_payload(data);

        if !channel.is_networked() {
            return self.deliver_local(delivery, &msg, data).await;
        }

        let mut packet = Packet::request(
            self.next_id(),
            delivery.into(),
            channel,
            name,
            data,
            self.src_addr(),
        );
        packet.dst_addr = dst;

        match self.role() {
            Role::Server => self.hub_deliver(&packet, delivery).await,
            Role::Client => {
                let gateway = self.gateway()?;
                if delivery == Delivery::Call {
                    self.request(&gateway, &packet).await
                } else {
                    if let Err(e) = gateway.send_packet(&packet) {
                        log::debug!("[Endpoint] {} gateway send failed: {e}", self.inner.name);
                        return Err(routing::send_failure(&gateway, e));
                    }
                    Ok(None)
                }
            }
            Role::Unconfigured => Err(NetError::NotConnected(self.inner.name.clone())),
        }
    }

    fn gateway(&self) -> NetResult<NetSocket> {
        self.state()
            .gateway
            .clone()
            .ok_or_else(|| NetError::NotConnected(self.inner.name.clone()))
    }

    // ---- peers ----

    /// `true` until the socket has been bound to an address.
    pub fn is_new_socket(&self, socket: &NetSocket) -> bool {
        !socket.is_bound()
    }

    /// Assign a fresh `UR_` address to a client socket and start routing to
    /// it.
    pub fn add_client(&self, socket: &NetSocket) -> NetResult<Address> {
        if self.role() != Role::Server {
            return Err(NetError::Rejected(format!("{} is not a hub", self.inner.name)));
        }
        if let Some(addr) = socket.uaddr() {
            return Ok(addr);
        }
        let addr = self
            .inner
            .allocator
            .allocate(AllocateOptions::with_prefix(AddressPrefix::Ur))?;
        socket.bind(addr.clone());
        self.state().clients.insert(
            addr.clone(),
            PeerEntry {
                socket: socket.clone(),
                name: None,
                declared: BTreeSet::new(),
            },
        );
        log::info!(
            "[Endpoint] {} added client {addr} ({})",
            self.inner.name,
            socket.label()
        );
        Ok(addr)
    }

    /// Stop routing to a client socket and fail calls waiting on it.
    ///
    /// Returns the address the socket had, if it was a client.
    pub fn remove_client(&self, socket: &NetSocket) -> Option<Address> {
        let addr = socket.uaddr()?;
        let removed = {
            let mut state = self.state();
            match state.clients.get(&addr) {
                Some(entry) if entry.socket == *socket => state.clients.remove(&addr),
                _ => None,
            }
        };
        let failed = self
            .inner
            .pending
            .fail_socket(socket.id(), &NetError::PeerDisconnected(addr.to_string()));

        let entry = removed?;
        log::info!(
            "[Endpoint] {} removed client {addr} ({}), failed {failed} pending call(s)",
            self.inner.name,
            entry.name.as_deref().unwrap_or("unnamed")
        );
        Some(addr)
    }

    /// Transport notification that `socket` is gone.
    pub fn socket_closed(&self, socket: &NetSocket) {
        socket.close();
        if self.role() == Role::Server {
            self.remove_client(socket);
            return;
        }

        let lost_gateway = {
            let mut state = self.state();
            if state.gateway.as_ref() == Some(socket) {
                state.gateway = None;
                true
            } else {
                false
            }
        };
        if lost_gateway {
            log::warn!("[Endpoint] {} lost its gateway", self.inner.name);
        }
        let err = NetError::disconnected(socket.uaddr().as_ref(), &socket.label());
        self.inner.pending.fail_socket(socket.id(), &err);
    }

    /// Server role: addresses of connected clients, sorted.
    pub fn client_addresses(&self) -> Vec<Address> {
        self.state().clients.keys().cloned().collect()
    }

    /// Server role: name a client registered with, if any.
    pub fn client_name(&self, addr: &Address) -> Option<String> {
        self.state().clients.get(addr).and_then(|peer| peer.name.clone())
    }

    /// Server role: clients that declared `msg`, sorted by address.
    pub fn remote_subscribers(&self, msg: &str) -> NetResult<Vec<Address>> {
        let msg = normalize_message(msg)?;
        Ok(self
            .state()
            .clients
            .iter()
            .filter(|(_, peer)| peer.declared.contains(&msg))
            .map(|(addr, _)| addr.clone())
            .collect())
    }

    fn ping_local(&self, msg: &str) -> Vec<Address> {
        let state = self.state();
        let mut addrs = Vec::new();
        if state.handlers.has(msg) {
            addrs.extend(state.uaddr.clone());
        }
        if state.role == Role::Server {
            addrs.extend(
                state
                    .clients
                    .iter()
                    .filter(|(_, peer)| peer.declared.contains(msg))
                    .map(|(addr, _)| addr.clone()),
            );
        }
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(name, Arc::new(AddressAllocator::new()))
    }

    #[tokio::test]
    async fn test_local_call_aggregates_in_order() {
        let ep = endpoint("local");
        ep.add_message_handler("SUM", MessageHandler::from_fn(|_| Ok(json!(1))))
            .unwrap();
        ep.add_message_handler(":SUM", MessageHandler::from_fn(|_| Ok(json!(2))))
            .unwrap();

        let out = ep.call("LOCAL:SUM", None).await.unwrap();
        assert_eq!(out, Some(json!([1, 2])));
        assert_eq!(ep.handled_messages(), vec![":SUM"]);
    }

    #[tokio::test]
    async fn test_local_call_without_handler() {
        let ep = endpoint("local");
        assert_eq!(
            ep.call("NOBODY", None).await.unwrap_err(),
            NetError::NoHandler(":NOBODY".into())
        );
        // fire-and-forget is quiet about it
        ep.send("NOBODY", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let ep = endpoint("local");
        ep.add_message_handler("FAIL", MessageHandler::new(|_| async { anyhow::bail!("boom") }))
            .unwrap();
        assert_eq!(
            ep.call("FAIL", None).await.unwrap_err(),
            NetError::Handler { msg: ":FAIL".into(), message: "boom".into() }
        );
    }

    #[tokio::test]
    async fn test_delete_handler() {
        let ep = endpoint("local");
        let h = MessageHandler::from_fn(|_| Ok(Value::Null));
        ep.add_message_handler("X", h.clone()).unwrap();
        assert!(ep.has_handler("LOCAL:X"));
        assert!(ep.delete_message_handler(":X", &h).unwrap());
        assert!(!ep.delete_message_handler(":X", &h).unwrap());
        assert!(!ep.has_handler("X"));
    }

    #[tokio::test]
    async fn test_networked_requires_role() {
        let ep = endpoint("lonely");
        assert_eq!(
            ep.signal("NET:HELLO", None).await.unwrap_err(),
            NetError::NotConnected("lonely".into())
        );
        assert!(matches!(
            ep.call("net:hello", None).await,
            Err(NetError::MalformedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_config_as_server_once() {
        let alloc = Arc::new(AddressAllocator::new());
        let hub = Endpoint::new("hub", Arc::clone(&alloc));
        assert_eq!(hub.config_as_server(Some("SRV001")).unwrap().as_str(), "SRV001");
        assert_eq!(hub.role(), Role::Server);
        assert!(matches!(hub.config_as_server(None), Err(NetError::Rejected(_))));

        let other = Endpoint::new("other", alloc);
        assert_eq!(
            other.config_as_server(Some("SRV001")).unwrap_err(),
            NetError::AddressInUse("SRV001".into())
        );
        assert_eq!(other.role(), Role::Unconfigured);
    }

    #[tokio::test]
    async fn test_hub_call_skips_own_handlers() {
        let hub = endpoint("hub");
        hub.config_as_server(None).unwrap();
        hub.add_message_handler("NET:ECHO", MessageHandler::from_fn(|p| Ok(p.unwrap_or_default())))
            .unwrap();
        assert_eq!(
            hub.call("NET:ECHO", Some(json!(1))).await.unwrap_err(),
            NetError::NoHandler("NET:ECHO".into())
        );
        assert_eq!(hub.ping("NET:ECHO").await.unwrap(), vec![hub.uaddr().unwrap()]);
    }

    #[tokio::test]
    async fn test_payload_is_normalized_before_delivery() {
        let ep = endpoint("local");
        ep.add_message_handler("SEE", MessageHandler::from_fn(|p| Ok(json!({ "saw": p }))))
            .unwrap();
        assert_eq!(
            ep.call("SEE", Some(json!([]))).await.unwrap(),
            Some(json!({"saw": null}))
        );
        assert_eq!(
            ep.call("SEE", Some(json!([4]))).await.unwrap(),
            Some(json!({"saw": 4}))
        );
    }
}
