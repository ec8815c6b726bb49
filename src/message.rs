//! Message grammar: `CHANNEL:NAME` strings and payload shapes.
//!
//! A message name is either `CHANNEL:NAME` or a bare `NAME`, which belongs to
//! the implicit `LOCAL` channel. The whole string must be upper-case, must not
//! end with `_`, and may contain at most one `:`.
//!
//! ```text
//! NET:PING      -> (Net,   "PING")
//! :HELLO        -> (Local, "HELLO")
//! HELLO         -> (Local, "HELLO")
//! SYNC:SRV_DATA -> (Sync,  "SRV_DATA")
//! ```
//!
//! All functions here are pure. Decoding fails fast with
//! [`NetError::MalformedMessage`]; nothing returns a partial result.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::error::{NetError, NetResult};
use crate::packet::PacketType;

/// Routing scope of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    /// Hub-to-client data synchronization (server scoped).
    Sync,
    /// General networked messages.
    Net,
    /// Services implemented by the hub itself (server scoped).
    Srv,
    /// In-process only. The empty channel prefix also means `LOCAL`.
    #[serde(alias = "")]
    Local,
}

/// Every channel a message may name.
pub const VALID_CHANNELS: [&str; 5] = ["SYNC", "NET", "SRV", "LOCAL", ""];

impl Channel {
    /// Wire form of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Net => "NET",
            Self::Srv => "SRV",
            Self::Local => "LOCAL",
        }
    }

    /// `true` for channels that cross the network.
    pub fn is_networked(self) -> bool {
        matches!(self, Self::Net | Self::Srv | Self::Sync)
    }

    /// `true` for channels reserved for the hub's own services.
    pub fn is_server_scoped(self) -> bool {
        matches!(self, Self::Srv | Self::Sync)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNC" => Ok(Self::Sync),
            "NET" => Ok(Self::Net),
            "SRV" => Ok(Self::Srv),
            "LOCAL" | "" => Ok(Self::Local),
            other => Err(NetError::InvalidChannel(other.to_string())),
        }
    }
}

/// Split a message into its channel and name.
///
/// # Errors
///
/// Returns [`NetError::MalformedMessage`] when the string is not upper-case,
/// ends with `_`, has more than one `:`, has an empty name, or names an
/// unknown channel.
pub fn decode_message(msg: &str) -> NetResult<(Channel, String)> {
    if msg.is_empty() {
        return Err(NetError::malformed(msg, "invalid empty message"));
    }
    if msg != msg.to_uppercase() {
        return Err(NetError::malformed(msg, "message must be uppercase"));
    }
    if msg.ends_with('_') {
        return Err(NetError::malformed(msg, "message can not end with _"));
    }

    let bits: Vec<&str> = msg.split(':').collect();
    let (chan, name) = match bits.as_slice() {
        [name] => ("LOCAL", *name),
        [chan, name] => (*chan, *name),
        _ => return Err(NetError::malformed(msg, "invalid channel:message format")),
    };
    if name.is_empty() {
        return Err(NetError::malformed(msg, "message name is empty"));
    }

    let Ok(channel) = chan.parse::<Channel>() else {
        return Err(NetError::malformed(
            msg,
            format!("prefix must be one of SYNC NET SRV LOCAL, not {chan}"),
        ));
    };

    Ok((channel, name.to_string()))
}

/// Non-failing form of [`decode_message`] for predicates and filters.
pub fn is_valid_message(msg: &str) -> Option<(Channel, String)> {
    match decode_message(msg) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            log::debug!("[Message] {e}");
            None
        }
    }
}

/// Re-serialize a message in canonical form.
///
/// Networked messages keep their prefix; local messages become `:NAME`.
///
/// # Errors
///
/// Same as [`decode_message`].
pub fn normalize_message(msg: &str) -> NetResult<String> {
    let (channel, name) = decode_message(msg)?;
    Ok(format_message(channel, &name))
}

/// Build the canonical message string from its parts.
pub fn format_message(channel: Channel, name: &str) -> String {
    match channel {
        Channel::Local => format!(":{name}"),
        other => format!("{}:{name}", other.as_str()),
    }
}

/// `true` if the message stays in-process.
///
/// # Errors
///
/// Same as [`decode_message`].
pub fn is_local_message(msg: &str) -> NetResult<bool> {
    Ok(decode_message(msg)?.0 == Channel::Local)
}

/// `true` if the message is routable across the network.
///
/// # Errors
///
/// Same as [`decode_message`].
pub fn is_net_message(msg: &str) -> NetResult<bool> {
    Ok(decode_message(msg)?.0.is_networked())
}

/// `true` if the message is implemented by the hub endpoint.
///
/// # Errors
///
/// Same as [`decode_message`].
pub fn is_server_message(msg: &str) -> NetResult<bool> {
    Ok(decode_message(msg)?.0.is_server_scoped())
}

/// Collapse degenerate arrays.
///
/// - non-arrays pass through
/// - `[]` becomes `None`
/// - `null` slots become `{}`
/// - `[x]` becomes `x`
/// - longer arrays pass through with their `null` slots replaced
pub fn normalize_payload(data: Option<Value>) -> Option<Value> {
    match data {
        Some(Value::Array(mut items)) => {
            if items.is_empty() {
                return None;
            }
            for item in &mut items {
                if item.is_null() {
                    *item = Value::Object(serde_json::Map::new());
                }
            }
            if items.len() == 1 {
                items.pop()
            } else {
                Some(Value::Array(items))
            }
        }
        other => other,
    }
}

/// `true` if `msg_type` names a packet type.
pub fn is_valid_type(msg_type: &str) -> bool {
    msg_type.parse::<PacketType>().is_ok()
}

/// `true` if `msg_type` is one of the protocol-internal packet types.
pub fn is_special_type(msg_type: &str) -> bool {
    msg_type
        .parse::<PacketType>()
        .is_ok_and(PacketType::is_special)
}

/// `true` if packets of this type must never be re-invoked on their origin.
pub fn skips_origin(msg_type: &str) -> bool {
    msg_type
        .parse::<PacketType>()
        .is_ok_and(PacketType::skips_origin)
}

/// `true` if `chan` is one of the message channels (including the empty one).
pub fn is_valid_channel(chan: &str) -> bool {
    VALID_CHANNELS.contains(&chan)
}

/// `true` if `addr` has a known prefix followed by a numeric ordinal.
pub fn is_valid_address(addr: &str) -> bool {
    addr.parse::<Address>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_channel_and_name() {
        assert_eq!(
            decode_message("NET:PING").unwrap(),
            (Channel::Net, "PING".to_string())
        );
        assert_eq!(
            decode_message("SYNC:SRV_DATA").unwrap(),
            (Channel::Sync, "SRV_DATA".to_string())
        );
        assert_eq!(
            decode_message(":HELLO").unwrap(),
            (Channel::Local, "HELLO".to_string())
        );
        assert_eq!(
            decode_message("HELLO").unwrap(),
            (Channel::Local, "HELLO".to_string())
        );
        assert_eq!(
            decode_message("LOCAL:HELLO").unwrap(),
            (Channel::Local, "HELLO".to_string())
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for bad in [
            "net:ping",
            "NET:Ping",
            "NET:PING_",
            "NET:PING:EXTRA",
            "FOO:PING",
            "NET:",
            "",
            "_",
        ] {
            match decode_message(bad) {
                Err(NetError::MalformedMessage { msg, .. }) => assert_eq!(msg, bad),
                other => panic!("expected MalformedMessage for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for msg in ["NET:PING", "SRV:REG", "SYNC:DATA", ":LOCAL_THING", "BARE", "LOCAL:X"] {
            let first = decode_message(msg).unwrap();
            let normalized = normalize_message(msg).unwrap();
            assert_eq!(decode_message(&normalized).unwrap(), first);
            assert_eq!(normalize_message(&normalized).unwrap(), normalized);
        }
    }

    #[test]
    fn test_normalize_local_uses_empty_prefix() {
        assert_eq!(normalize_message("LOCAL:HELLO").unwrap(), ":HELLO");
        assert_eq!(normalize_message("HELLO").unwrap(), ":HELLO");
        assert_eq!(normalize_message("NET:HELLO").unwrap(), "NET:HELLO");
    }

    #[test]
    fn test_channel_predicates() {
        assert!(is_local_message("HELLO").unwrap());
        assert!(!is_local_message("NET:HELLO").unwrap());
        assert!(is_net_message("NET:HELLO").unwrap());
        assert!(is_net_message("SYNC:HELLO").unwrap());
        assert!(!is_net_message(":HELLO").unwrap());
        assert!(is_server_message("SRV:HELLO").unwrap());
        assert!(is_server_message("SYNC:HELLO").unwrap());
        assert!(!is_server_message("NET:HELLO").unwrap());
        assert!(is_net_message("bad").is_err());
    }

    #[test]
    fn test_normalize_payload_rules() {
        assert_eq!(normalize_payload(Some(json!([]))), None);
        assert_eq!(normalize_payload(Some(json!([5]))), Some(json!(5)));
        assert_eq!(normalize_payload(Some(json!([1, 2]))), Some(json!([1, 2])));
        assert_eq!(normalize_payload(Some(json!([null]))), Some(json!({})));
        assert_eq!(
            normalize_payload(Some(json!([null, 2]))),
            Some(json!([{}, 2]))
        );
        assert_eq!(normalize_payload(Some(json!({"a": 1}))), Some(json!({"a": 1})));
        assert_eq!(normalize_payload(None), None);
    }

    #[test]
    fn test_structural_predicates() {
        assert!(is_valid_type("call"));
        assert!(is_valid_type("_decl"));
        assert!(!is_valid_type("CALL"));
        assert!(is_special_type("_auth"));
        assert!(!is_special_type("send"));
        assert!(skips_origin("call"));
        assert!(skips_origin("send"));
        assert!(!skips_origin("signal"));
        assert!(is_valid_channel(""));
        assert!(is_valid_channel("SYNC"));
        assert!(!is_valid_channel("WEB"));
        assert!(is_valid_address("UR_001"));
        assert!(is_valid_address("???000"));
        assert!(!is_valid_address("XX_001"));
        assert!(!is_valid_address("UR_abc"));
    }

    #[test]
    fn test_channel_serde_accepts_empty_alias() {
        let chan: Channel = serde_json::from_str("\"\"").unwrap();
        assert_eq!(chan, Channel::Local);
        assert_eq!(serde_json::to_string(&Channel::Net).unwrap(), "\"NET\"");
    }
}
