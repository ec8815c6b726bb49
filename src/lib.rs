//! URNET - addressable message endpoints.
//!
//! Endpoints exchange channel-qualified messages (`NET:PING`, `SRV:ECHO`,
//! `SYNC:DATA`, or bare local names) over pluggable transports, and a phase
//! scheduler brings each process up in a fixed order.
//!
//! # Architecture
//!
//! - **Message** - `CHANNEL:NAME` grammar and payload normalization
//! - **Address** - prefix + ordinal identities and their allocator
//! - **Packet** - one exchange on the wire
//! - **Socket** - peer handle plus in-memory and Unix transports
//! - **Endpoint** - handlers, roles, routing and pending calls
//! - **Phase** - ordered startup groups with sequential hooks
//!
//! # Modules
//!
//! - [`message`] - grammar and structural predicates
//! - [`address`] - addresses and [`AddressAllocator`]
//! - [`endpoint`] - [`Endpoint`] and its handlers
//! - [`socket`] - [`NetSocket`], framing, transports
//! - [`phase`] - [`PhaseMachine`], [`PhaseRegistry`] and [`Bootstrap`]
//! - [`config`] - configuration loading/saving

pub mod address;
pub mod endpoint;
pub mod message;
pub mod packet;
pub mod phase;
pub mod socket;

pub mod config;
pub mod constants;
pub mod error;

// Re-export commonly used types
pub use address::{Address, AddressAllocator, AddressPrefix, AllocateOptions};
pub use config::Config;
pub use endpoint::{Endpoint, EndpointConfig, MessageHandler, Role};
pub use error::{NetError, NetResult};
pub use message::Channel;
pub use packet::{Packet, PacketType};
pub use phase::{
    BootStatus, Bootstrap, Component, PhaseGroup, PhaseHook, PhaseMachine, PhaseMeta,
    PhaseRegistry, PhaseStatus,
};
pub use socket::NetSocket;
