//! Wire protocol for operator↔daemon communication.
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix over the RPC TCP connection.

mod codec;
mod message;

pub use codec::{recv, send};
pub use message::{
    AppReport, InstanceReport, Request, Response, DEFAULT_RPC_HOST, DEFAULT_RPC_PORT,
};
