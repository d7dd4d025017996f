//! wisp-rpc Common Types and Codec
//!
//! This crate provides the protocol data model and the framing codec shared
//! by every component of the wisp-rpc system.
//!
//! # Overview
//!
//! wisp-rpc is a small multiplexed RPC framework: a client assigns sequence
//! numbers to outbound requests and demultiplexes responses on one duplex
//! connection, while the server dispatches each request to a registered
//! service method. This crate contains the pieces both sides agree on:
//!
//! - **Protocol Layer**: the per-message [`Header`], the handshake
//!   [`Options`] record, and the wire constants (magic number, content-type
//!   tags, HTTP paths and header names).
//! - **Codec Layer**: a pluggable serialization format selected by
//!   content-type tag, carried over length-prefixed frames.
//! - **Errors**: the [`RpcError`] enum used across the workspace.
//!
//! # Wire shape
//!
//! Every connection starts with one JSON-encoded [`Options`] line. After the
//! handshake both sides speak the negotiated codec, which emits a repeating
//! `Header` / `Body` frame pattern.

pub mod codec;
pub mod error;
pub mod protocol;

pub use codec::{CodecKind, FrameReader, FrameWriter};
pub use error::{Result, RpcError};
pub use protocol::{Header, Options};
