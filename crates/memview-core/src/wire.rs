use crate::block::{parse_block_values, ParseReport};
use crate::{LogEntry, Strategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Liveness ping sent right after the channel opens.
pub const HANDSHAKE: &str = "ping";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
/// Suggestion value meaning no free block can hold the requested size.
pub const NO_SUGGESTION: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not JSON: {0}")]
    Decode(String),
    #[error("payload has no memory field")]
    MissingMemory,
    #[error("memory field is not a sequence")]
    MemoryNotSequence,
}

/// Parses a snapshot message (`{"memory": [...]}` plus any other fields).
pub fn parse_snapshot_message(text: &str) -> Result<ParseReport, PayloadError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| PayloadError::Decode(err.to_string()))?;
    parse_snapshot_value(&value)
}

pub fn parse_snapshot_value(value: &Value) -> Result<ParseReport, PayloadError> {
    let memory = value.get("memory").ok_or(PayloadError::MissingMemory)?;
    let records = memory.as_array().ok_or(PayloadError::MemoryNotSequence)?;
    Ok(parse_block_values(records))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocateRequest {
    pub pid: String,
    pub size: u64,
    pub strategy: String,
}

impl AllocateRequest {
    pub fn new(pid: impl Into<String>, size: u64, strategy: Strategy) -> Self {
        Self {
            pid: pid.into(),
            size,
            strategy: strategy.wire_token().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocateAck {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub memory: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl AllocateAck {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            status: Some(STATUS_FAILED.to_string()),
            error: Some(detail.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(STATUS_SUCCESS)
    }

    pub fn failure_text(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.reason.as_deref())
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeallocateAck {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub memory: Option<Vec<String>>,
}

impl DeallocateAck {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            status: Some(STATUS_FAILED.to_string()),
            reason: Some(detail.into()),
            memory: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(STATUS_SUCCESS)
    }

    pub fn failure_text(&self) -> Option<&str> {
        self.reason
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestResponse {
    pub suggested_strategy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessLogResponse {
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

/// Error body attached to 4xx responses (`{"detail": ...}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub detail: Value,
}

impl ErrorDetail {
    pub fn text(&self) -> String {
        match &self.detail {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}
