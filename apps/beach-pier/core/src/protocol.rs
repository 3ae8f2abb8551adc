use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Seq;

/// Frames pushed from the service to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Status(ProcessStatus),
    Data {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    History {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Error {
        message: String,
    },
}

/// Lifecycle of the upstream process as reported to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Exited(ExitReport),
}

/// Exit details. Both fields are always serialized, `null` when unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitReport {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }
}

/// Frames sent from a viewer to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    RequestHistory { reason: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("binary frame is not valid utf-8")]
    NotUtf8,
}

impl ServerMessage {
    pub fn data(data: impl Into<String>, seq: Seq) -> Self {
        ServerMessage::Data {
            data: data.into(),
            seq: Some(seq),
        }
    }

    pub fn history(data: impl Into<String>, seq: Seq) -> Self {
        ServerMessage::History {
            data: data.into(),
            seq: Some(seq),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ClientMessage {
    pub fn request_history(reason: impl ToString) -> Self {
        ClientMessage::RequestHistory {
            reason: reason.to_string(),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Some browsers' socket shims deliver JSON in binary frames.
    pub fn from_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::from_text(text)
    }
}
