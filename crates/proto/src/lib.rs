//! Shared wire types for the kiln build server protocol.
//!
//! This crate defines the messages exchanged between the build manager and
//! out-of-process build servers over loopback TCP, and the varint32
//! length-delimited codec that frames them. Payloads are postcard encoded.

#![warn(missing_docs)]

pub mod codec;
pub mod types;

pub use codec::{CodecError, MessageCodec};
pub use types::*;
