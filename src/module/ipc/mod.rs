//! Bus transport between the host and module processes
//!
//! Envelopes travel as length-delimited JSON frames over each module's
//! stdin/stdout pair.

pub mod channel;
pub mod protocol;

pub use channel::{spawn_writer, EnvelopeReader};
pub use protocol::{Body, Destination, Envelope, Header, MessageId, RpcError, RpcErrorKind};
