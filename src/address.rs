//! Endpoint addresses and the allocator that issues them.
//!
//! An address is a short prefix naming the kind of peer followed by a
//! zero-padded ordinal:
//!
//! ```text
//! UR_001   client assigned by a hub
//! SRV001   hub endpoint
//! UA007    default prefix for generated addresses
//! ???000   unroutable (client before the hub assigned one)
//! ```
//!
//! Issued addresses are never released. A reconnecting peer always receives a
//! fresh ordinal, so stale routing entries can never alias a new peer.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_ADDR_DIGITS, MAX_ADDR_DIGITS};
use crate::error::{NetError, NetResult};

/// Address kind prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressPrefix {
    /// Generic endpoint (default for generated addresses).
    #[default]
    Ua,
    /// Client assigned by a hub.
    Ur,
    /// Hub/server endpoint.
    Srv,
    /// WebSocket peer.
    Wss,
    /// Unix domain socket peer.
    Uds,
    /// MQTT peer.
    Mqt,
    /// Unroutable placeholder.
    Unroutable,
}

impl AddressPrefix {
    /// All known prefixes. None is a prefix of another.
    pub const ALL: [AddressPrefix; 7] = [
        Self::Ua,
        Self::Ur,
        Self::Srv,
        Self::Wss,
        Self::Uds,
        Self::Mqt,
        Self::Unroutable,
    ];

    /// Literal text of the prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ua => "UA",
            Self::Ur => "UR_",
            Self::Srv => "SRV",
            Self::Wss => "WSS",
            Self::Uds => "UDS",
            Self::Mqt => "MQT",
            Self::Unroutable => "???",
        }
    }
}

/// A validated endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// The unroutable address with the default ordinal width (`???000`).
    pub fn unroutable() -> Self {
        Self(format!(
            "{}{}",
            AddressPrefix::Unroutable.as_str(),
            "0".repeat(DEFAULT_ADDR_DIGITS)
        ))
    }

    /// `true` for the `???` placeholder prefix.
    pub fn is_unroutable(&self) -> bool {
        self.0.starts_with(AddressPrefix::Unroutable.as_str())
    }

    /// Prefix of this address.
    pub fn prefix(&self) -> AddressPrefix {
        AddressPrefix::ALL
            .into_iter()
            .find(|p| self.0.starts_with(p.as_str()))
            .unwrap_or_default()
    }

    /// Numeric ordinal following the prefix. Parsing caps the digit count, so
    /// this never overflows.
    pub fn ordinal(&self) -> u64 {
        let digits = &self.0[self.prefix().as_str().len()..];
        digits.parse().unwrap_or(0)
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(prefix) = AddressPrefix::ALL
            .into_iter()
            .find(|p| s.starts_with(p.as_str()))
        else {
            return Err(NetError::InvalidAddress(s.to_string()));
        };
        let digits = &s[prefix.as_str().len()..];
        if digits.is_empty()
            || digits.len() > MAX_ADDR_DIGITS
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(NetError::InvalidAddress(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Address {
    type Error = NetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Options for [`AddressAllocator::allocate`].
#[derive(Debug, Clone, Default)]
pub struct AllocateOptions {
    /// Prefix for a generated address. Ignored when `addr` is set.
    pub prefix: Option<AddressPrefix>,
    /// Manually chosen address.
    pub addr: Option<String>,
}

impl AllocateOptions {
    /// Generate an address with the given prefix.
    pub fn with_prefix(prefix: AddressPrefix) -> Self {
        Self {
            prefix: Some(prefix),
            addr: None,
        }
    }

    /// Reserve a specific address.
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            prefix: None,
            addr: Some(addr.into()),
        }
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    /// Highest ordinal generated so far (shared across prefixes).
    max_id: u64,
    /// Every address issued, generated or manual.
    used: HashSet<Address>,
}

/// Issues unique addresses for the lifetime of the allocator.
///
/// One allocator is shared (via `Arc`) by all endpoints of a process. Tests
/// create their own to start from a clean counter.
#[derive(Debug)]
pub struct AddressAllocator {
    digits: usize,
    state: Mutex<AllocatorState>,
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressAllocator {
    /// Allocator producing the default ordinal width.
    pub fn new() -> Self {
        Self::with_digits(DEFAULT_ADDR_DIGITS)
    }

    /// Allocator producing `digits`-wide ordinals, clamped to
    /// `1..=MAX_ADDR_DIGITS`.
    pub fn with_digits(digits: usize) -> Self {
        Self {
            digits: digits.clamp(1, MAX_ADDR_DIGITS),
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Issue an address.
    ///
    /// # Errors
    ///
    /// - [`NetError::InvalidAddress`] if a manual address does not parse
    /// - [`NetError::AddressInUse`] if a manual address was already issued
    pub fn allocate(&self, opts: AllocateOptions) -> NetResult<Address> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let addr = match opts.addr {
            Some(manual) => {
                let addr: Address = manual.parse()?;
                if state.used.contains(&addr) {
                    return Err(NetError::AddressInUse(addr.to_string()));
                }
                addr
            }
            None => {
                let prefix = opts.prefix.unwrap_or_default();
                // Skip ordinals a manual reservation already claimed.
                loop {
                    state.max_id += 1;
                    let candidate = Address(format!(
                        "{}{:0width$}",
                        prefix.as_str(),
                        state.max_id,
                        width = self.digits
                    ));
                    if !state.used.contains(&candidate) {
                        break candidate;
                    }
                }
            }
        };

        state.used.insert(addr.clone());
        log::debug!("[Address] allocated {addr}");
        Ok(addr)
    }

    /// `true` if the address has been issued.
    pub fn is_allocated(&self, addr: &Address) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .used
            .contains(addr)
    }

    /// Number of addresses issued so far.
    pub fn allocated_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .used
            .len()
    }

    /// Ordinal width used for generated addresses.
    pub fn digits(&self) -> usize {
        self.digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_addresses_are_distinct_and_increasing() {
        let alloc = AddressAllocator::new();
        let addrs: Vec<Address> = (0..25)
            .map(|_| alloc.allocate(AllocateOptions::default()).unwrap())
            .collect();

        assert_eq!(addrs[0].as_str(), "UA001");
        assert_eq!(addrs[24].as_str(), "UA025");
        for pair in addrs.windows(2) {
            assert!(pair[1].ordinal() > pair[0].ordinal());
        }
        let unique: HashSet<_> = addrs.iter().collect();
        assert_eq!(unique.len(), 25);
    }

    #[test]
    fn test_counter_is_shared_across_prefixes() {
        let alloc = AddressAllocator::new();
        let a = alloc.allocate(AllocateOptions::with_prefix(AddressPrefix::Ur)).unwrap();
        let b = alloc.allocate(AllocateOptions::with_prefix(AddressPrefix::Uds)).unwrap();
        assert_eq!(a.as_str(), "UR_001");
        assert_eq!(b.as_str(), "UDS002");
    }

    #[test]
    fn test_manual_address_collision() {
        let alloc = AddressAllocator::new();
        alloc.allocate(AllocateOptions::with_addr("SRV001")).unwrap();
        let err = alloc
            .allocate(AllocateOptions::with_addr("SRV001"))
            .unwrap_err();
        assert_eq!(err, NetError::AddressInUse("SRV001".into()));
    }

    #[test]
    fn test_manual_address_must_be_valid() {
        let alloc = AddressAllocator::new();
        let err = alloc
            .allocate(AllocateOptions::with_addr("HUB01"))
            .unwrap_err();
        assert_eq!(err, NetError::InvalidAddress("HUB01".into()));
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn test_generated_skips_manual_reservation() {
        let alloc = AddressAllocator::new();
        alloc.allocate(AllocateOptions::with_addr("UA001")).unwrap();
        let next = alloc.allocate(AllocateOptions::default()).unwrap();
        assert_eq!(next.as_str(), "UA002");
    }

    #[test]
    fn test_custom_width() {
        let alloc = AddressAllocator::with_digits(5);
        let addr = alloc.allocate(AllocateOptions::with_prefix(AddressPrefix::Srv)).unwrap();
        assert_eq!(addr.as_str(), "SRV00001");
        assert_eq!(addr.ordinal(), 1);
    }

    #[test]
    fn test_address_parsing() {
        assert!("UR_001".parse::<Address>().is_ok());
        assert!("???000".parse::<Address>().is_ok());
        assert!("UA12".parse::<Address>().is_ok());
        assert!("UR_".parse::<Address>().is_err());
        assert!("UR_01a".parse::<Address>().is_err());
        assert!("ZZZ001".parse::<Address>().is_err());
        assert!(Address::unroutable().is_unroutable());
        assert_eq!(Address::unroutable().as_str(), "???000");
    }

    #[test]
    fn test_overlong_ordinal_rejected() {
        let widest = format!("UR_{}", "9".repeat(MAX_ADDR_DIGITS));
        let addr: Address = widest.parse().unwrap();
        assert_eq!(addr.ordinal(), "9".repeat(MAX_ADDR_DIGITS).parse::<u64>().unwrap());

        let overlong = format!("UR_{}", "9".repeat(MAX_ADDR_DIGITS + 1));
        assert_eq!(
            overlong.parse::<Address>().unwrap_err(),
            NetError::InvalidAddress(overlong.clone())
        );
        assert_eq!(AddressAllocator::with_digits(40).digits(), MAX_ADDR_DIGITS);
    }

    #[test]
    fn test_address_serde_validates() {
        let addr: Address = serde_json::from_str("\"WSS004\"").unwrap();
        assert_eq!(addr.prefix(), AddressPrefix::Wss);
        assert!(serde_json::from_str::<Address>("\"nope\"").is_err());
    }
}
