//! # drip-core
//!
//! Shared building blocks for the Drip file drop protocol.
//!
//! Drip lets two hosts that share no prior relationship exchange a file,
//! authenticating each other solely through a short one-time word code
//! spoken or typed out-of-band. This crate provides the pieces that both
//! the engine and the binary crate build on:
//!
//! - **Word codes** — the `amber-river-stone-lamp` code type, the split
//!   into public channel words and the never-transmitted secret phrase,
//!   and random code generation from a fixed dictionary.
//!
//! - **Channel derivation** — the time-bucketed discovery key both peers
//!   compute independently from the channel word.
//!
//! - **Identity & authentication** — ephemeral per-run Ed25519 keypair
//!   generation, `node_id` derivation (public-key fingerprint), and
//!   signature helpers.
//!
//! - **Wire format** — frame codec (magic / version / type / length) and
//!   the signed [`TransferEnvelope`](envelope::TransferEnvelope) carrying
//!   the transfer negotiation.
//!
//! - **File records** — size and streamed SHA-256 content identifier for
//!   the file being offered.

pub mod channel;
pub mod code;
pub mod envelope;
pub mod error;
pub mod file;
pub mod identity;
pub mod words;
