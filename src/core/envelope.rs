use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BusError, Result};

/// Role tag stamped on envelopes built by this library unless the caller
/// overrides it.
pub const DEFAULT_COMP_TYPE: &str = "rust_client";

/// Lifecycle role of an envelope within one command exchange.
///
/// The five variants are a closed set; decoding any other value fails and
/// the message is handled through the raw-payload path instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplyType {
    /// Initial command publication by the caller.
    Sent,
    /// Receipt acknowledgment emitted by the addressee before any work.
    Rcv,
    /// Non-terminal progress report emitted while the handler runs.
    Fdb,
    /// Terminal success, `reply` carries the handler's result.
    Ack,
    /// Terminal failure, `reply` carries the failure description.
    Err,
}

impl ReplyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Rcv => "RCV",
            Self::Fdb => "FDB",
            Self::Ack => "ACK",
            Self::Err => "ERR",
        }
    }

    /// ACK and ERR close a command's lifecycle; everything after them is
    /// ignored by lifecycle consumers.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ack | Self::Err)
    }
}

impl fmt::Display for ReplyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the bus.
///
/// The JSON wire names are stable and must not change: three of them
/// (`reply type`, `tick count`, `UUID`) are inherited verbatim from the
/// reference deployment, embedded space included, so envelopes interoperate
/// with existing producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical/abstract target name.
    pub component: String,
    /// Physical/instance target name; a listener answers when either name
    /// matches its identity.
    pub comp_phys: String,
    /// Command verb.
    pub command: String,
    pub arg1: String,
    pub arg2: String,
    /// Opaque payload, empty until a reply populates it.
    pub reply: String,
    #[serde(rename = "reply type")]
    pub reply_type: ReplyType,
    /// Static tag of the sending role, e.g. `"rust_client"`.
    pub comp_type: String,
    /// Sender-side timestamp, milliseconds since the Unix epoch.
    #[serde(rename = "tick count")]
    pub tick_count: i64,
    /// Token grouping every message of one command's lifecycle. Fresh per
    /// top-level command; replies and feedback reuse the original's.
    #[serde(rename = "UUID")]
    pub correlation_id: String,
}

impl Envelope {
    /// Build a SENT envelope with a fresh random correlation id.
    pub fn command(
        component: &str,
        comp_phys: &str,
        command: &str,
        arg1: &str,
        arg2: &str,
    ) -> Self {
        Self {
            component: component.to_string(),
            comp_phys: comp_phys.to_string(),
            command: command.to_string(),
            arg1: arg1.to_string(),
            arg2: arg2.to_string(),
            reply: String::new(),
            reply_type: ReplyType::Sent,
            comp_type: DEFAULT_COMP_TYPE.to_string(),
            tick_count: now_ms(),
            correlation_id: fresh_correlation_id(),
        }
    }

    /// Build a reply to `original`: addressing fields, args, role tag and
    /// correlation id are copied, the reply payload and type are set and the
    /// tick count is stamped fresh.
    pub fn reply(original: &Envelope, payload: &str, reply_type: ReplyType) -> Self {
        Self {
            component: original.component.clone(),
            comp_phys: original.comp_phys.clone(),
            command: original.command.clone(),
            arg1: original.arg1.clone(),
            arg2: original.arg2.clone(),
            reply: payload.to_string(),
            reply_type,
            comp_type: original.comp_type.clone(),
            tick_count: now_ms(),
            correlation_id: original.correlation_id.clone(),
        }
    }

    /// Override the sender role tag.
    pub fn with_comp_type(mut self, comp_type: &str) -> Self {
        self.comp_type = comp_type.to_string();
        self
    }

    /// Whether a listener registered under `identity` is the addressee,
    /// by logical or physical name.
    pub fn is_addressed_to(&self, identity: &str) -> bool {
        self.component == identity || self.comp_phys == identity
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::EncodeError(e.to_string()))
    }

    /// Parse an envelope from raw bytes. Anything that is not a well formed
    /// envelope (bad JSON, missing field, reply type outside the enum)
    /// yields a `DecodeError`; callers keep the raw bytes flowing.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BusError::DecodeError(e.to_string()))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} reply='{}' uuid={}",
            self.reply_type, self.component, self.command, self.reply, self.correlation_id
        )
    }
}

/// Milliseconds since the Unix epoch, the wire clock for `tick_count`.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn fresh_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
