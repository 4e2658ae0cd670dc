//! relay-protocol
//!
//! Wire-level encoding/decoding for the relay.
//!
//! This crate is responsible for turning logical envelopes
//! (`relay_core::Envelope`) into bytes and back again.
//!
//! - [`json_codec`] : one envelope <-> one JSON object
//! - [`frame`]      : newline framing over a growing byte buffer

pub mod wire_types;
pub mod json_codec;
pub mod frame;

pub use json_codec::{decode_envelope, encode_envelope, ProtocolError};
pub use frame::{extract_frames, FrameDecoder};
