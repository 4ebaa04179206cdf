//! # corundum-wire: Wire protocol for Corundum
//!
//! Every message — on the wire and in the WAL — is `Header || body`:
//! a fixed 128-byte header with independent header and body checksums,
//! followed by an opaque body of at most `MESSAGE_BODY_SIZE_MAX` bytes.
//!
//! The dual checksum is load-bearing: a torn write that zeroes the tail
//! of a prepare corrupts the body without invalidating the header,
//! which is exactly the signal WAL recovery uses to classify a slot as
//! torn rather than faulty.
//!
//! This crate defines:
//! - [`Header`]: the fixed header with explicit little-endian layout
//! - [`Command`]: the protocol command set
//! - [`Operation`]: the application operation tag
//! - [`Message`]: the envelope, with validation
//! - typed bodies for control messages (postcard-encoded)
//! - [`FrameBuffer`]: incremental frame decoding for stream transports

mod command;
mod frame;
mod header;
mod message;

pub mod body;

pub use command::{Command, Operation};
pub use frame::FrameBuffer;
pub use header::{decode_headers, encode_headers, Header};
pub use message::{Message, WireError};
