//! Versioned message envelope.
//!
//! Message bodies on the topic are `BrokerMessage` records with explicit
//! field tags. The drain engine treats them as opaque and goes through the
//! pluggable [`EnvelopeCodec`].

use bytes::Bytes;
use prost::Message;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Wire record for one message body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BrokerMessage {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Routing token of the session that produced the message.
    #[prost(string, tag = "2")]
    pub session_token: String,
    #[prost(string, tag = "3")]
    pub string_data: String,
    #[prost(message, optional, tag = "4")]
    pub header: Option<CommunicationHeader>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommunicationHeader {
    #[prost(message, optional, tag = "1")]
    pub flags: Option<CommFlags>,
}

/// Per-message flags carried in the header.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommFlags {
    #[prost(int32, tag = "1")]
    pub message_flag: i32,
    #[prost(int32, tag = "2")]
    pub acknowledgement_flag: i32,
    #[prost(int32, tag = "3")]
    pub heartbeat_flag: i32,
    #[prost(int32, tag = "4")]
    pub trace_flag: i32,
    #[prost(int32, tag = "5")]
    pub subscription_flag: i32,
    /// Name of the filter rule the producer routed through.
    #[prost(string, tag = "6")]
    pub service_bus_filter: String,
}

/// Decoded view of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub session_token: String,
    pub payload: String,
    pub filter_rule: Option<String>,
}

impl Envelope {
    pub fn new(session_token: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            session_token: session_token.into(),
            payload: payload.into(),
            filter_rule: None,
        }
    }

    pub fn with_filter_rule(mut self, rule: impl Into<String>) -> Self {
        self.filter_rule = Some(rule.into());
        self
    }

    /// Payload cut to at most `max_chars` characters for log lines.
    pub fn summary(&self, max_chars: usize) -> String {
        match self.payload.char_indices().nth(max_chars) {
            Some((end, _)) => format!("{}...", &self.payload[..end]),
            None => self.payload.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Message body is empty")]
    Empty,

    #[error("Malformed envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Unsupported envelope version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Serializer between [`Envelope`] and message bodies.
pub trait EnvelopeCodec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Bytes;

    fn decode(&self, body: &[u8]) -> Result<Envelope, EnvelopeError>;
}

/// Default codec writing [`BrokerMessage`] records.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstEnvelopeCodec;

impl EnvelopeCodec for ProstEnvelopeCodec {
    fn encode(&self, envelope: &Envelope) -> Bytes {
        let record = BrokerMessage {
            version: SCHEMA_VERSION,
            session_token: envelope.session_token.clone(),
            string_data: envelope.payload.clone(),
            header: Some(CommunicationHeader {
                flags: Some(CommFlags {
                    message_flag: 1,
                    service_bus_filter: envelope.filter_rule.clone().unwrap_or_default(),
                    ..Default::default()
                }),
            }),
        };
        Bytes::from(record.encode_to_vec())
    }

    fn decode(&self, body: &[u8]) -> Result<Envelope, EnvelopeError> {
        if body.is_empty() {
            return Err(EnvelopeError::Empty);
        }
        let record = BrokerMessage::decode(body)?;
        if record.version == 0 || record.version > SCHEMA_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                found: record.version,
                supported: SCHEMA_VERSION,
            });
        }
        let filter_rule = record
            .header
            .and_then(|h| h.flags)
            .map(|f| f.service_bus_filter)
            .filter(|rule| !rule.is_empty());
        Ok(Envelope {
            session_token: record.session_token,
            payload: record.string_data,
            filter_rule,
        })
    }
}
