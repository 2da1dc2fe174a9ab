//! # drip-engine
//!
//! Runtime for Drip: everything between "the user typed a code" and "the
//! bytes arrived".
//!
//! This crate provides:
//! - **Transport abstraction**: [`transport::Connection`] /
//!   [`transport::Listener`] / [`transport::Connector`] traits with TCP and
//!   in-memory implementations, so every layer above works over any byte
//!   transport
//! - **Discovery**: a pluggable [`discovery::Substrate`] capability
//!   (publish / lookup) with LAN-broadcast and rendezvous-server variants,
//!   merged by the coordinator into one de-duplicated candidate stream
//! - **Pairing race**: concurrent SPAKE2 attempts against every candidate
//!   with single-winner semantics and prompt cancellation of the losers
//! - **Negotiation**: the signed offer / response exchange and chunked
//!   file streaming over the winning session
//! - **Node**: the top-level state machine composing the above behind a
//!   command/event handle

pub mod cancel;
pub mod discovery;
pub mod framing;
pub mod lan;
pub mod memory;
pub mod negotiate;
pub mod node;
pub mod pairing;
pub mod rendezvous;
pub mod tcp;
pub mod transport;
