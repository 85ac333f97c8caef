//! # dep2p Core
//!
//! Core types, capability traits, and errors for the dep2p realm fabric.
//!
//! This crate provides the foundational abstractions shared by the realm
//! layer and the connection engine:
//!
//! - [`NodeId`] / [`RealmId`]: opaque 32-byte identifiers
//! - [`PeerAddr`]: multiaddr-style dialing addresses
//! - [`ConnRealmContext`]: per-connection realm authentication record
//! - [`traits`]: narrow interfaces for every external collaborator
//!   (transports, peerstore, liveness, discovery, relay, hole-punching)
//! - [`mock`]: a complete in-memory transport plus collaborator fakes
//!   used by the workspace's test suites

pub mod addr;
pub mod context;
pub mod error;
pub mod identity;
pub mod mock;
pub mod traits;

pub use addr::{AddrClass, PeerAddr, Segment};
pub use context::{ConnRealmContext, RealmContextCell};
pub use error::*;
pub use identity::{ID_LENGTH, NodeId, RealmId};
pub use traits::*;
