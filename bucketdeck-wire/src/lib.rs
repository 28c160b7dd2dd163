//! HTTP API vocabulary for bucketdeck
//!
//! Route table, JSON bodies and the small codecs both the server and the
//! client need. Nothing here performs I/O.

pub mod protocol;
pub mod wire;

pub use protocol::*;
pub use wire::*;
