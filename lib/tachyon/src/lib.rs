//! Tachyon: an authenticated, encrypted, congestion-controlled message
//! transport over UDP, with NAT traversal via STUN/ICE and application-
//! supplied signaling for peer-to-peer rendezvous.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod connection;
pub mod ice;
pub mod proto;
pub mod rendezvous;
pub mod service;
pub mod shared;
pub mod snp;
pub mod socket;
pub mod stats;
pub mod stun;
pub mod wire;

pub use crate::connection::{ConnectionState, StatusChange};
pub use crate::rendezvous::SignalTransport;
pub use crate::service::{ListenerId, NetContext};
pub use crate::shared::{ConnectionId, NetworkError, NetworkResult, VirtualPort};
pub use crate::snp::{sendflag, ReceivedMessage};
