//! Bus message protocol
//!
//! Every message on the bus is an [`Envelope`]: a header naming the sender,
//! a sender-scoped message id and the protocol version, plus a [`Body`]
//! whose variant is the message type. Envelopes are encoded as JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::module::traits::ModuleError;

/// Wire protocol version carried in every header
pub const PROTOCOL_VERSION: u32 = 1;

/// Bus address of the virtual in-process host endpoint
pub const HOST_ENDPOINT: &str = "core";

/// Pattern and proxy name matching every sender
pub const WILDCARD: &str = "*";

/// Sender-scoped message id. A registration id is the id of its `register` message.
pub type MessageId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub sender: String,
    pub id: MessageId,
    pub version: u32,
}

/// Message payload, one variant per message type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Subscribe to events whose sender and type match the patterns
    Register { source: String, event_type: String },
    /// Drop the subscription created by the `register` with this id
    Unregister { registration: MessageId },
    Event { event_type: String, payload: Value },
    RpcCall {
        destination: String,
        procedure: String,
        #[serde(default)]
        args: Value,
    },
    RpcReply {
        destination: String,
        reply_to: MessageId,
        result: Result<Value, RpcError>,
    },
    /// Startup handshake: the module is ready to receive `init`
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, id: MessageId, body: Body) -> Self {
        Self {
            header: Header {
                sender: sender.into(),
                id,
                version: PROTOCOL_VERSION,
            },
            body,
        }
    }

    /// Reply to `call`, addressed back to its sender
    pub fn reply_to(
        call: &Envelope,
        sender: impl Into<String>,
        id: MessageId,
        result: Result<Value, RpcError>,
    ) -> Self {
        Self::new(
            sender,
            id,
            Body::RpcReply {
                destination: call.header.sender.clone(),
                reply_to: call.header.id,
                result,
            },
        )
    }

    pub fn sender(&self) -> &str {
        &self.header.sender
    }

    pub fn id(&self) -> MessageId {
        self.header.id
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            Body::Register { .. } => "register",
            Body::Unregister { .. } => "unregister",
            Body::Event { .. } => "event",
            Body::RpcCall { .. } => "rpc_call",
            Body::RpcReply { .. } => "rpc_reply",
            Body::Ready => "ready",
        }
    }

    pub fn encode(&self) -> Result<Bytes, ModuleError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a frame, rejecting foreign protocol versions
    pub fn decode(frame: &[u8]) -> Result<Self, ModuleError> {
        let envelope: Envelope = serde_json::from_slice(frame)?;
        if envelope.header.version != PROTOCOL_VERSION {
            return Err(ModuleError::IpcError(format!(
                "unsupported protocol version {}",
                envelope.header.version
            )));
        }
        Ok(envelope)
    }
}

/// Routing target of a call or reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The virtual in-process endpoint
    Host,
    /// A module process, by name
    Module(String),
}

impl Destination {
    pub fn parse(name: &str) -> Self {
        if name == HOST_ENDPOINT {
            Destination::Host
        } else {
            Destination::Module(name.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    ProcedureNotFound,
    ModuleRestarting,
    ModuleNotRunning,
    /// The procedure itself failed
    Failed,
    /// The call is not permitted, e.g. a call through the wildcard proxy
    Disallowed,
}

/// Error carried in an `rpc_reply`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn procedure_not_found(procedure: &str) -> Self {
        Self::new(
            RpcErrorKind::ProcedureNotFound,
            format!("procedure {} not found", procedure),
        )
    }

    pub fn module_restarting(module: &str) -> Self {
        Self::new(
            RpcErrorKind::ModuleRestarting,
            format!("module {} is restarting", module),
        )
    }

    pub fn module_not_running(module: &str) -> Self {
        Self::new(
            RpcErrorKind::ModuleNotRunning,
            format!("module {} is not running", module),
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Failed, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RpcError {}
