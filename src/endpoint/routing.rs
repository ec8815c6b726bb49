//! Ingest and delivery paths.
//!
//! Bytes from a transport enter through [`Endpoint::socket_data_ingest`].
//! Responses resolve pending calls inline; handshake and ping requests are
//! answered inline; message requests are dispatched on their own task so a
//! handler that calls back across the network never stalls the read path.

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Endpoint, MessageHandler, Role};
use crate::address::Address;
use crate::error::{NetError, NetResult};
use crate::message::{decode_message, format_message, normalize_payload, Channel};
use crate::packet::{Delivery, Packet, PacketType, Route, SpecialType};
use crate::socket::framing::Frame;
use crate::socket::NetSocket;

#[derive(Debug, Deserialize)]
pub(super) struct AuthReply {
    pub(super) uaddr: Address,
    pub(super) srv_addr: Address,
}

#[derive(Debug, Deserialize)]
pub(super) struct DeclReply {
    pub(super) msg_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct PingReply {
    pub(super) addrs: Vec<Address>,
}

#[derive(Debug, Deserialize)]
struct RegRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeclRequest {
    msg_list: Vec<String>,
}

pub(super) fn parse_reply<T: DeserializeOwned>(payload: Option<Value>) -> NetResult<T> {
    Ok(serde_json::from_value(payload.unwrap_or_default())?)
}

/// Run handlers one after another, keeping every outcome.
async fn run_handlers(
    msg: &str,
    handlers: Vec<MessageHandler>,
    payload: Option<Value>,
) -> Vec<NetResult<Value>> {
    let mut results = Vec::with_capacity(handlers.len());
    for handler in handlers {
        let outcome = handler.invoke(payload.clone()).await.map_err(|e| NetError::Handler {
            msg: msg.to_string(),
            message: format!("{e:#}"),
        });
        results.push(outcome);
    }
    results
}

/// Fold per-target outcomes into one call result. The first error wins.
fn collect_results(outcomes: Vec<NetResult<Value>>) -> NetResult<Option<Value>> {
    let mut values = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        values.push(outcome?);
    }
    Ok(normalize_payload(Some(Value::Array(values))))
}

/// A closed queue means the peer is gone; anything else (an oversized
/// packet) is the caller's own error and leaves the socket up.
pub(super) fn send_failure(socket: &NetSocket, err: NetError) -> NetError {
    match err {
        NetError::SocketClosed(_) => NetError::disconnected(socket.uaddr().as_ref(), &socket.label()),
        other => other,
    }
}

impl Endpoint {
    /// Feed bytes that arrived on `socket`.
    ///
    /// A corrupt length header closes the socket. A packet that fails to
    /// decode or validate is logged and dropped.
    pub fn socket_data_ingest(&self, socket: &NetSocket, bytes: &[u8]) {
        let frames = match socket.feed(bytes) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!(
                    "[Endpoint] {} framing error on {}: {e}",
                    self.inner.name,
                    socket.label()
                );
                self.socket_closed(socket);
                return;
            }
        };

        for frame in frames {
            match frame {
                Frame::Packet(bytes) => match Packet::from_slice(&bytes) {
                    Ok(packet) => self.ingest_packet(socket, packet),
                    Err(e) => log::warn!(
                        "[Endpoint] {} dropped packet from {}: {e}",
                        self.inner.name,
                        socket.label()
                    ),
                },
                Frame::Unknown { frame_type, .. } => log::warn!(
                    "[Endpoint] {} ignored frame type 0x{frame_type:02x} from {}",
                    self.inner.name,
                    socket.label()
                ),
            }
        }
    }

    fn ingest_packet(&self, socket: &NetSocket, packet: Packet) {
        let role = self.role();

        if role == Role::Server && self.is_new_socket(socket) {
            if let Err(e) = self.add_client(socket) {
                log::warn!("[Endpoint] {} could not add {}: {e}", self.inner.name, socket.label());
                return;
            }
        }

        if packet.is_response() {
            let hash = packet.hash();
            if !self.inner.pending.resolve(&hash, socket.id(), packet.into_result()) {
                log::debug!("[Endpoint] {} unmatched response {hash}", self.inner.name);
            }
            return;
        }

        if role == Role::Server
            && packet.typ != PacketType::Auth
            && socket.uaddr().as_ref() != Some(&packet.src_addr)
        {
            log::warn!(
                "[Endpoint] {} dropped {} from {}: src_addr {} does not match",
                self.inner.name,
                packet.typ,
                socket.label(),
                packet.src_addr
            );
            return;
        }

        if packet.typ.skips_origin() && self.uaddr().as_ref() == Some(&packet.src_addr) {
            log::debug!("[Endpoint] {} skipped own {} {}", self.inner.name, packet.typ, packet.hash());
            return;
        }

        if !packet.channel.is_networked() {
            log::warn!(
                "[Endpoint] {} dropped {} {} from {}: local messages stay in-process",
                self.inner.name,
                packet.typ,
                packet.msg(),
                packet.src_addr
            );
            return;
        }

        match packet.typ.route() {
            Route::Special(kind) => self.handle_special(socket, &packet, kind),
            Route::Ping => {
                let addrs = self.ping_local(&packet.msg());
                self.respond(socket, packet.reply(Some(json!({ "addrs": addrs }))));
            }
            Route::Message(delivery) => self.spawn_dispatch(socket.clone(), packet, delivery),
        }
    }

    fn respond(&self, socket: &NetSocket, reply: Packet) {
        let result = match socket.send_packet(&reply) {
            // a reply too large to frame still owes the caller an answer
            Err(e @ NetError::Codec(_)) => socket.send_packet(&reply.reply_error(&e)),
            other => other,
        };
        if let Err(e) = result {
            log::warn!(
                "[Endpoint] {} could not answer {}: {e}",
                self.inner.name,
                reply.hash()
            );
        }
    }

    fn handle_special(&self, socket: &NetSocket, packet: &Packet, kind: SpecialType) {
        if self.role() != Role::Server {
            let err = NetError::Rejected(format!("{} is not a hub", self.inner.name));
            self.respond(socket, packet.reply_error(&err));
            return;
        }
        let reply = match kind {
            SpecialType::Auth => self.handle_auth(socket, packet),
            SpecialType::Reg => self.handle_reg(socket, packet),
            SpecialType::Decl => self.handle_decl(socket, packet),
        };
        let reply = match reply {
            Ok(payload) => packet.reply(Some(payload)),
            Err(e) => packet.reply_error(&e),
        };
        self.respond(socket, reply);
    }

    fn handle_auth(&self, socket: &NetSocket, packet: &Packet) -> NetResult<Value> {
        // tokens are accepted as-is; there is no credential store
        if packet.payload.as_ref().is_some_and(|p| p.get("token").is_some()) {
            log::debug!("[Endpoint] {} auth token from {}", self.inner.name, socket.label());
        }
        let uaddr = socket
            .uaddr()
            .ok_or_else(|| NetError::Rejected("socket has no address".into()))?;
        Ok(json!({ "uaddr": uaddr, "srv_addr": self.uaddr() }))
    }

    fn handle_reg(&self, socket: &NetSocket, packet: &Packet) -> NetResult<Value> {
        let req: RegRequest = parse_reply(packet.payload.clone())
            .map_err(|e| NetError::Rejected(format!("bad registration: {e}")))?;
        let addr = packet.src_addr.clone();
        {
            let mut state = self.state();
            let peer = state
                .clients
                .get_mut(&addr)
                .filter(|peer| peer.socket == *socket)
                .ok_or_else(|| NetError::Rejected(format!("{addr} is not connected")))?;
            peer.name = Some(req.name.clone());
        }
        log::info!("[Endpoint] {} registered {addr} as '{}'", self.inner.name, req.name);
        Ok(json!({ "ok": true }))
    }

    fn handle_decl(&self, socket: &NetSocket, packet: &Packet) -> NetResult<Value> {
        let req: DeclRequest = parse_reply(packet.payload.clone())
            .map_err(|e| NetError::Rejected(format!("bad declaration: {e}")))?;

        let accepted: Vec<String> = req
            .msg_list
            .iter()
            .filter_map(|msg| match decode_message(msg) {
                Ok((channel, name)) if channel.is_networked() && channel != Channel::Srv => {
                    Some(format_message(channel, &name))
                }
                Ok(_) => {
                    log::debug!("[Endpoint] {} refused declaration of {msg}", self.inner.name);
                    None
                }
                Err(e) => {
                    log::warn!("[Endpoint] {} bad declaration: {e}", self.inner.name);
                    None
                }
            })
            .collect();

        let addr = packet.src_addr.clone();
        {
            let mut state = self.state();
            let peer = state
                .clients
                .get_mut(&addr)
                .filter(|peer| peer.socket == *socket)
                .ok_or_else(|| NetError::Rejected(format!("{addr} is not connected")))?;
            peer.declared = accepted.iter().cloned().collect();
        }
        log::info!(
            "[Endpoint] {} {addr} declared {}",
            self.inner.name,
            accepted.join(", ")
        );
        Ok(json!({ "msg_list": accepted }))
    }

    fn spawn_dispatch(&self, socket: NetSocket, packet: Packet, delivery: Delivery) {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let msg = packet.msg();
            let result = match endpoint.role() {
                Role::Server => endpoint.hub_deliver(&packet, delivery).await,
                Role::Client | Role::Unconfigured => {
                    endpoint
                        .deliver_local(delivery, &msg, packet.payload.clone())
                        .await
                }
            };

            match (delivery, result) {
                (Delivery::Call, Ok(payload)) => endpoint.respond(&socket, packet.reply(payload)),
                (Delivery::Call, Err(e)) => endpoint.respond(&socket, packet.reply_error(&e)),
                (_, Ok(_)) => {}
                (_, Err(e)) => log::warn!(
                    "[Endpoint] {} {} {msg} from {}: {e}",
                    endpoint.inner.name,
                    packet.typ,
                    packet.src_addr
                ),
            }
        });
    }

    /// Invoke local handlers only.
    pub(super) async fn deliver_local(
        &self,
        delivery: Delivery,
        msg: &str,
        payload: Option<Value>,
    ) -> NetResult<Option<Value>> {
        let handlers = self.state().handlers.get(msg);
        if delivery == Delivery::Call && handlers.is_empty() {
            return Err(NetError::NoHandler(msg.to_string()));
        }

        let outcomes = run_handlers(msg, handlers, payload).await;
        if delivery == Delivery::Call {
            return collect_results(outcomes);
        }
        for e in outcomes.into_iter().filter_map(Result::err) {
            log::warn!("[Endpoint] {} {e}", self.inner.name);
        }
        Ok(None)
    }

    /// Server role: deliver a networked packet to own handlers and clients.
    ///
    /// The packet keeps its origin `src_addr` and `id` on every hop.
    pub(super) async fn hub_deliver(
        &self,
        packet: &Packet,
        delivery: Delivery,
    ) -> NetResult<Option<Value>> {
        let msg = packet.msg();

        let (local, remote) = {
            let state = self.state();
            let own = state.uaddr.as_ref();
            let from_self = own == Some(&packet.src_addr);
            let to_self = packet.dst_addr.as_ref().is_none_or(|dst| Some(dst) == own);

            let local = if to_self && !(from_self && packet.typ.skips_origin()) {
                state.handlers.get(&msg)
            } else {
                Vec::new()
            };

            let remote: Vec<NetSocket> = state
                .clients
                .iter()
                .filter(|(addr, _)| packet.dst_addr.as_ref().is_none_or(|dst| dst == *addr))
                .filter(|(addr, peer)| {
                    if **addr == packet.src_addr {
                        // signal echoes so the origin sees it exactly once
                        delivery == Delivery::Signal
                    } else {
                        peer.declared.contains(&msg)
                    }
                })
                .map(|(_, peer)| peer.socket.clone())
                .collect();

            (local, remote)
        };

        log::debug!(
            "[Endpoint] {} {} {msg} from {}: {} local, {} remote",
            self.inner.name,
            packet.typ,
            packet.src_addr,
            local.len(),
            remote.len()
        );

        if delivery != Delivery::Call {
            for socket in &remote {
                if let Err(e) = socket.send_packet(packet) {
                    log::warn!("[Endpoint] {} forward to {}: {e}", self.inner.name, socket.label());
                }
            }
            for e in run_handlers(&msg, local, packet.payload.clone())
                .await
                .into_iter()
                .filter_map(Result::err)
            {
                log::warn!("[Endpoint] {} {e}", self.inner.name);
            }
            return Ok(None);
        }

        if local.is_empty() && remote.is_empty() {
            return Err(NetError::NoHandler(msg));
        }

        let (mut outcomes, replies) = tokio::join!(
            run_handlers(&msg, local, packet.payload.clone()),
            join_all(remote.iter().map(|socket| self.request(socket, packet)))
        );
        outcomes.extend(
            replies
                .into_iter()
                .map(|reply| reply.map(Option::unwrap_or_default)),
        );
        collect_results(outcomes)
    }

    /// Send a request on `socket` and wait for the matching response.
    pub(super) async fn request(&self, socket: &NetSocket, packet: &Packet) -> NetResult<Option<Value>> {
        let hash = packet.hash();
        let rx = self.inner.pending.register(hash.clone(), socket.id());

        if let Err(e) = socket.send_packet(packet) {
            self.inner.pending.cancel(&hash, socket.id());
            log::debug!("[Endpoint] {} request {hash} not sent: {e}", self.inner.name);
            return Err(send_failure(socket, e));
        }

        let result = super::pending::wait_reply(rx, &packet.msg(), self.inner.config.call_timeout).await;
        if matches!(result, Err(NetError::Timeout { .. })) {
            self.inner.pending.cancel(&hash, socket.id());
        }
        result
    }
}
