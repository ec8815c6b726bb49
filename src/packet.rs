//! Packet model: one enveloped message exchange.
//!
//! Packets travel as JSON objects inside [`Frame::Packet`] frames:
//!
//! ```json
//! {"id": 7, "type": "call", "channel": "NET", "name": "PING",
//!  "payload": {}, "src_addr": "UR_002", "dir": "req"}
//! ```
//!
//! A response reuses the request's `id` and `src_addr`, so `"{src_addr}:{id}"`
//! identifies the whole exchange on every hop.
//!
//! [`Frame::Packet`]: crate::socket::framing::Frame::Packet

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::error::{NetError, NetResult};
use crate::message::{decode_message, format_message, Channel};

/// Packet type as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Address discovery.
    #[serde(rename = "ping")]
    Ping,
    /// Broadcast, echoed to the origin.
    #[serde(rename = "signal")]
    Signal,
    /// Fire-and-forget delivery, never echoed.
    #[serde(rename = "send")]
    Send,
    /// Request/response.
    #[serde(rename = "call")]
    Call,
    /// Handshake: address assignment.
    #[serde(rename = "_auth")]
    Auth,
    /// Handshake: endpoint name registration.
    #[serde(rename = "_reg")]
    Reg,
    /// Handshake: message declaration.
    #[serde(rename = "_decl")]
    Decl,
}

/// Protocol-internal packet kinds. Never reach user handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialType {
    /// `_auth`
    Auth,
    /// `_reg`
    Reg,
    /// `_decl`
    Decl,
}

/// User-visible delivery conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// `signal`
    Signal,
    /// `send`
    Send,
    /// `call`
    Call,
}

/// Where a request packet is dispatched on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handshake handlers.
    Special(SpecialType),
    /// Address listing.
    Ping,
    /// User message handlers.
    Message(Delivery),
}

impl PacketType {
    /// Wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Signal => "signal",
            Self::Send => "send",
            Self::Call => "call",
            Self::Auth => "_auth",
            Self::Reg => "_reg",
            Self::Decl => "_decl",
        }
    }

    /// `true` for the underscore handshake types.
    pub fn is_special(self) -> bool {
        matches!(self.route(), Route::Special(_))
    }

    /// `true` for types that are never re-invoked on their origin.
    pub fn skips_origin(self) -> bool {
        matches!(self, Self::Call | Self::Send)
    }

    /// Dispatch class of this type.
    pub fn route(self) -> Route {
        match self {
            Self::Ping => Route::Ping,
            Self::Signal => Route::Message(Delivery::Signal),
            Self::Send => Route::Message(Delivery::Send),
            Self::Call => Route::Message(Delivery::Call),
            Self::Auth => Route::Special(SpecialType::Auth),
            Self::Reg => Route::Special(SpecialType::Reg),
            Self::Decl => Route::Special(SpecialType::Decl),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PacketType {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(Self::Ping),
            "signal" => Ok(Self::Signal),
            "send" => Ok(Self::Send),
            "call" => Ok(Self::Call),
            "_auth" => Ok(Self::Auth),
            "_reg" => Ok(Self::Reg),
            "_decl" => Ok(Self::Decl),
            other => Err(NetError::InvalidPacketType(other.to_string())),
        }
    }
}

impl From<Delivery> for PacketType {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Signal => Self::Signal,
            Delivery::Send => Self::Send,
            Delivery::Call => Self::Call,
        }
    }
}

impl From<SpecialType> for PacketType {
    fn from(special: SpecialType) -> Self {
        match special {
            SpecialType::Auth => Self::Auth,
            SpecialType::Reg => Self::Reg,
            SpecialType::Decl => Self::Decl,
        }
    }
}

impl SpecialType {
    /// Message name carried by handshake packets (always on `SRV`).
    pub fn message_name(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::Reg => "REG",
            Self::Decl => "DECL",
        }
    }
}

/// Request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketDir {
    /// Request (default when absent).
    #[default]
    Req,
    /// Response.
    Res,
}

/// Failure carried by a response packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum PacketError {
    /// Nobody handles the message.
    NoHandler {
        /// Message name.
        msg: String,
    },
    /// A handler returned an error.
    Handler {
        /// Message name.
        msg: String,
        /// Handler error text.
        message: String,
    },
    /// A downstream peer closed before replying.
    PeerDisconnected {
        /// Address or label of the peer.
        peer: String,
    },
    /// A downstream call timed out.
    Timeout {
        /// Message name.
        msg: String,
        /// Timeout that elapsed.
        millis: u64,
    },
    /// The hub refused the request.
    Rejected {
        /// Reason text.
        reason: String,
    },
}

impl From<PacketError> for NetError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::NoHandler { msg } => Self::NoHandler(msg),
            PacketError::Handler { msg, message } => Self::Handler { msg, message },
            PacketError::PeerDisconnected { peer } => Self::PeerDisconnected(peer),
            PacketError::Timeout { msg, millis } => Self::Timeout { msg, millis },
            PacketError::Rejected { reason } => Self::Rejected(reason),
        }
    }
}

impl From<&NetError> for PacketError {
    fn from(err: &NetError) -> Self {
        match err {
            NetError::NoHandler(msg) => Self::NoHandler { msg: msg.clone() },
            NetError::Handler { msg, message } => Self::Handler {
                msg: msg.clone(),
                message: message.clone(),
            },
            NetError::PeerDisconnected(peer) => Self::PeerDisconnected { peer: peer.clone() },
            NetError::Timeout { msg, millis } => Self::Timeout {
                msg: msg.clone(),
                millis: *millis,
            },
            NetError::Rejected(reason) => Self::Rejected {
                reason: reason.clone(),
            },
            other => Self::Rejected {
                reason: other.to_string(),
            },
        }
    }
}

/// One message exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Sequence number, unique per origin.
    pub id: u64,
    /// Packet type.
    #[serde(rename = "type")]
    pub typ: PacketType,
    /// Routing scope.
    pub channel: Channel,
    /// Message name without the channel.
    pub name: String,
    /// Payload, absent when the sender passed nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Origin endpoint.
    pub src_addr: Address,
    /// Narrows delivery to one endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_addr: Option<Address>,
    /// Request or response.
    #[serde(default)]
    pub dir: PacketDir,
    /// Set on failed responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PacketError>,
}

impl Packet {
    /// Build a request packet.
    pub fn request(
        id: u64,
        typ: PacketType,
        channel: Channel,
        name: impl Into<String>,
        payload: Option<Value>,
        src_addr: Address,
    ) -> Self {
        Self {
            id,
            typ,
            channel,
            name: name.into(),
            payload,
            src_addr,
            dst_addr: None,
            dir: PacketDir::Req,
            error: None,
        }
    }

    /// Build a handshake request on the `SRV` channel.
    pub fn special(id: u64, kind: SpecialType, payload: Value, src_addr: Address) -> Self {
        Self::request(
            id,
            kind.into(),
            Channel::Srv,
            kind.message_name(),
            Some(payload),
            src_addr,
        )
    }

    /// Narrow delivery to `dst`.
    pub fn with_dst(mut self, dst: Address) -> Self {
        self.dst_addr = Some(dst);
        self
    }

    /// Successful response to this request.
    pub fn reply(&self, payload: Option<Value>) -> Self {
        Self {
            id: self.id,
            typ: self.typ,
            channel: self.channel,
            name: self.name.clone(),
            payload,
            src_addr: self.src_addr.clone(),
            dst_addr: None,
            dir: PacketDir::Res,
            error: None,
        }
    }

    /// Failed response to this request.
    pub fn reply_error(&self, err: &NetError) -> Self {
        let mut res = self.reply(None);
        res.error = Some(err.into());
        res
    }

    /// Exchange identity, `"{src_addr}:{id}"`.
    pub fn hash(&self) -> String {
        format!("{}:{}", self.src_addr, self.id)
    }

    /// Canonical message string.
    pub fn msg(&self) -> String {
        format_message(self.channel, &self.name)
    }

    /// `true` for responses.
    pub fn is_response(&self) -> bool {
        self.dir == PacketDir::Res
    }

    /// Unwrap a response into its payload or error.
    pub fn into_result(self) -> NetResult<Option<Value>> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.payload),
        }
    }

    /// Validate and decode a packet from its JSON value.
    ///
    /// Type, channel and source address are checked first so the error names
    /// the field that is wrong; the message name must satisfy the grammar.
    pub fn decode(value: Value) -> NetResult<Self> {
        let field = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default();

        field("type").parse::<PacketType>()?;
        field("channel").parse::<Channel>()?;
        field("src_addr").parse::<Address>()?;

        let packet: Packet = serde_json::from_value(value)?;
        decode_message(&packet.msg())?;
        Ok(packet)
    }

    /// Decode from the raw bytes of a packet frame.
    pub fn from_slice(bytes: &[u8]) -> NetResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::decode(value)
    }

    /// Serialize to JSON bytes.
    pub fn to_vec(&self) -> NetResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_hash_identity() {
        let a = Packet::request(4, PacketType::Call, Channel::Net, "PING", None, addr("UR_001"));
        let b = Packet::request(4, PacketType::Send, Channel::Srv, "OTHER", Some(json!(1)), addr("UR_001"));
        let c = Packet::request(5, PacketType::Call, Channel::Net, "PING", None, addr("UR_001"));
        assert_eq!(a.hash(), "UR_001:4");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_reply_keeps_identity() {
        let req = Packet::request(9, PacketType::Call, Channel::Net, "PING", Some(json!({})), addr("UR_003"))
            .with_dst(addr("SRV001"));
        let res = req.reply(Some(json!("pong")));
        assert_eq!(res.hash(), req.hash());
        assert!(res.is_response());
        assert_eq!(res.dst_addr, None);
        assert_eq!(res.into_result().unwrap(), Some(json!("pong")));
    }

    #[test]
    fn test_reply_error_round_trips_through_json() {
        let req = Packet::request(1, PacketType::Call, Channel::Net, "NOPE", None, addr("UR_001"));
        let res = req.reply_error(&NetError::NoHandler("NET:NOPE".into()));
        let bytes = res.to_vec().unwrap();
        let back = Packet::from_slice(&bytes).unwrap();
        assert_eq!(
            back.into_result().unwrap_err(),
            NetError::NoHandler("NET:NOPE".into())
        );
    }

    #[test]
    fn test_wire_field_names() {
        let pkt = Packet::special(2, SpecialType::Auth, json!({}), Address::unroutable());
        let value = serde_json::to_value(&pkt).unwrap();
        assert_eq!(value["type"], "_auth");
        assert_eq!(value["channel"], "SRV");
        assert_eq!(value["name"], "AUTH");
        assert_eq!(value["src_addr"], "???000");
        assert_eq!(value["dir"], "req");
        assert!(value.get("dst_addr").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_decode_names_the_bad_field() {
        let base = json!({
            "id": 1, "type": "call", "channel": "NET", "name": "PING", "src_addr": "UR_001"
        });
        assert!(Packet::decode(base.clone()).is_ok());

        let mut bad = base.clone();
        bad["type"] = json!("CALL");
        assert_eq!(
            Packet::decode(bad).unwrap_err(),
            NetError::InvalidPacketType("CALL".into())
        );

        let mut bad = base.clone();
        bad["channel"] = json!("WEB");
        assert_eq!(
            Packet::decode(bad).unwrap_err(),
            NetError::InvalidChannel("WEB".into())
        );

        let mut bad = base.clone();
        bad["src_addr"] = json!("HOST1");
        assert_eq!(
            Packet::decode(bad).unwrap_err(),
            NetError::InvalidAddress("HOST1".into())
        );

        let mut bad = base;
        bad["name"] = json!("ping");
        assert!(matches!(
            Packet::decode(bad),
            Err(NetError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn test_route_is_closed() {
        assert_eq!(PacketType::Auth.route(), Route::Special(SpecialType::Auth));
        assert_eq!(PacketType::Ping.route(), Route::Ping);
        assert_eq!(PacketType::Call.route(), Route::Message(Delivery::Call));
        assert!(PacketType::Decl.is_special());
        assert!(!PacketType::Signal.is_special());
        assert!(PacketType::Send.skips_origin());
        assert!(!PacketType::Ping.skips_origin());
    }

    #[test]
    fn test_local_channel_serializes_as_local() {
        let pkt = Packet::request(1, PacketType::Signal, Channel::Local, "X", None, addr("UA001"));
        assert_eq!(pkt.msg(), ":X");
        assert_eq!(serde_json::to_value(&pkt).unwrap()["channel"], "LOCAL");
    }
}
