use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

pub const REGISTER: &str = "register";
pub const OFFER: &str = "offer";
pub const ANSWER: &str = "answer";
pub const CANDIDATE: &str = "candidate";
pub const ERROR: &str = "error";

pub const NOT_FOUND_MESSAGE: &str = "User not found or offline";

/// Wire envelope exchanged with clients.
///
/// The payload is kept as raw JSON so forwarded negotiation data reaches the recipient
/// byte-for-byte; only the fields the relay routes on are ever decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Offer,
    Answer,
    Candidate,
}

impl ForwardKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        match kind {
            OFFER => Some(ForwardKind::Offer),
            ANSWER => Some(ForwardKind::Answer),
            CANDIDATE => Some(ForwardKind::Candidate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForwardKind::Offer => OFFER,
            ForwardKind::Answer => ANSWER,
            ForwardKind::Candidate => CANDIDATE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardTarget {
    target_user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload<'a> {
    message: &'a str,
    target_user: &'a str,
}

/// Typed view of an envelope, decoded from its `type` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Register { user_id: String },
    Forward { kind: ForwardKind, target_user_id: String },
    /// Error envelopes are server-generated; one arriving from a client is not acted upon.
    Error,
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[source] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(EnvelopeError::Json)
    }

    /// Server-generated report that `target_user` could not be reached.
    pub fn not_found(target_user: &str) -> Result<Self, serde_json::Error> {
        let payload = serde_json::value::to_raw_value(&ErrorPayload {
            message: NOT_FOUND_MESSAGE,
            target_user,
        })?;
        Ok(Self {
            kind: ERROR.to_string(),
            payload: Some(payload),
            from: None,
        })
    }

    pub fn is_register(&self) -> bool {
        self.kind == REGISTER
    }

    /// Overwrites whatever sender the client claimed.
    pub fn stamped(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }

    pub fn register_payload(&self) -> Result<RegisterPayload, EnvelopeError> {
        self.decode_payload()
    }

    pub fn signal(&self) -> Result<Signal, EnvelopeError> {
        if self.is_register() {
            let RegisterPayload { user_id } = self.register_payload()?;
            return Ok(Signal::Register { user_id });
        }
        if let Some(kind) = ForwardKind::from_type(&self.kind) {
            let ForwardTarget { target_user_id } = self.decode_payload()?;
            return Ok(Signal::Forward {
                kind,
                target_user_id,
            });
        }
        if self.kind == ERROR {
            return Ok(Signal::Error);
        }
        Ok(Signal::Unknown(self.kind.clone()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let raw = self.payload.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(raw).map_err(|source| EnvelopeError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }
}
