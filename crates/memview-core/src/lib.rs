pub mod block;
pub mod link;
pub mod metrics;
pub mod wire;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub use block::{
    parse_block, parse_block_values, parse_blocks, BlockParseError, ParseReport, RecordError,
};
pub use link::{
    transition, BackoffPolicy, ConnectionState, LinkAction, LinkEvent, LinkState, Transition,
};
pub use metrics::DerivedMetrics;

/// A contiguous address range reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub range_start: u64,
    pub range_end: u64,
    pub size: u64,
    pub status: BlockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupant: Option<String>,
}

impl MemoryBlock {
    pub fn free(range_start: u64, range_end: u64) -> Result<Self, BlockParseError> {
        Self::build(range_start, range_end, None)
    }

    pub fn used(
        range_start: u64,
        range_end: u64,
        occupant: impl Into<String>,
    ) -> Result<Self, BlockParseError> {
        Self::build(range_start, range_end, Some(occupant.into()))
    }

    fn build(
        range_start: u64,
        range_end: u64,
        occupant: Option<String>,
    ) -> Result<Self, BlockParseError> {
        if range_end < range_start {
            return Err(BlockParseError::InvertedRange {
                start: range_start,
                end: range_end,
            });
        }
        let size = (range_end - range_start)
            .checked_add(1)
            .ok_or(BlockParseError::SizeOverflow {
                start: range_start,
                end: range_end,
            })?;
        let status = if occupant.is_some() {
            BlockStatus::Used
        } else {
            BlockStatus::Free
        };
        Ok(Self {
            range_start,
            range_end,
            size,
            status,
            occupant,
        })
    }

    /// Process id of the occupant with any trailing `(Strategy)` annotation
    /// removed, so `"P1 (Firstfit)"` yields `"P1"`.
    pub fn occupant_pid(&self) -> Option<&str> {
        let label = self.occupant.as_deref()?.trim_end();
        if label.ends_with(')') {
            if let Some(idx) = label.rfind(" (") {
                let pid = label[..idx].trim_end();
                if !pid.is_empty() {
                    return Some(pid);
                }
            }
        }
        Some(label)
    }
}

impl fmt::Display for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.occupant.as_deref().unwrap_or(block::FREE_LABEL);
        write!(f, "[{}-{}] {}", self.range_start, self.range_end, label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Free,
    Used,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Free => "free",
            BlockStatus::Used => "used",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement strategy executed by the backend.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FirstFit,
    BestFit,
    WorstFit,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::FirstFit
    }
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::FirstFit, Strategy::BestFit, Strategy::WorstFit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FirstFit => "first_fit",
            Strategy::BestFit => "best_fit",
            Strategy::WorstFit => "worst_fit",
        }
    }

    /// Token sent in allocate requests. The backend only strips spaces and
    /// dashes before matching, so underscores must not reach it.
    pub fn wire_token(&self) -> &'static str {
        match self {
            Strategy::FirstFit => "firstfit",
            Strategy::BestFit => "bestfit",
            Strategy::WorstFit => "worstfit",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized: String = input
            .trim()
            .to_lowercase()
            .chars()
            .filter(|ch| !matches!(ch, ' ' | '-' | '_'))
            .collect();
        match normalized.as_str() {
            "firstfit" => Ok(Strategy::FirstFit),
            "bestfit" => Ok(Strategy::BestFit),
            "worstfit" => Ok(Strategy::WorstFit),
            _ => Err(format!("Unknown strategy: {}", input.trim())),
        }
    }
}

impl<'de> Deserialize<'de> for Strategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Active,
    Released,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Active => "active",
            LogStatus::Released => "released",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One allocation event in a process history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(deserialize_with = "deserialize_pid")]
    pub pid: String,
    pub range: String,
    pub size: u64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub strategy: Strategy,
    pub status: LogStatus,
}

/// Deserialize a pid that can be either a string or a number into a String
fn deserialize_pid<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for pid")),
    }
}

/// Accepts RFC 3339 with an offset, or a naive ISO-8601 timestamp read as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|err| format!("invalid timestamp '{trimmed}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn strategy_accepts_every_spelling() {
        for input in ["first_fit", "first-fit", "firstfit", "First Fit", " FIRST_FIT "] {
            assert_eq!(input.parse::<Strategy>(), Ok(Strategy::FirstFit), "{input}");
        }
        assert_eq!("Best-Fit".parse::<Strategy>(), Ok(Strategy::BestFit));
        assert_eq!("worstfit".parse::<Strategy>(), Ok(Strategy::WorstFit));
        assert!("next_fit".parse::<Strategy>().is_err());
        assert!("none".parse::<Strategy>().is_err());
    }

    #[test]
    fn strategy_wire_token_drops_separator() {
        assert_eq!(Strategy::BestFit.as_str(), "best_fit");
        assert_eq!(Strategy::BestFit.wire_token(), "bestfit");
    }

    #[test]
    fn occupant_pid_strips_strategy_annotation() {
        let annotated = MemoryBlock::used(0, 9, "P1 (Firstfit)").expect("block");
        assert_eq!(annotated.occupant_pid(), Some("P1"));

        let bare = MemoryBlock::used(0, 9, "P2").expect("block");
        assert_eq!(bare.occupant_pid(), Some("P2"));

        let free = MemoryBlock::free(0, 9).expect("block");
        assert_eq!(free.occupant_pid(), None);
    }

    #[test]
    fn block_display_matches_record_encoding() {
        let block = MemoryBlock::used(100, 149, "P2").expect("block");
        assert_eq!(block.to_string(), "[100-149] P2");
        assert_eq!(MemoryBlock::free(0, 99).expect("block").to_string(), "[0-99] Free");
    }

    #[test]
    fn log_entry_accepts_naive_timestamp_and_numeric_pid() {
        let entry: LogEntry = serde_json::from_str(
            r#"{
                "pid": 7,
                "range": "[0-49]",
                "size": 50,
                "timestamp": "2026-02-07T21:00:00.250000",
                "strategy": "firstfit",
                "status": "active"
            }"#,
        )
        .expect("parse entry");
        assert_eq!(entry.pid, "7");
        assert_eq!(entry.strategy, Strategy::FirstFit);
        assert_eq!(entry.status, LogStatus::Active);
        assert_eq!(
            entry.timestamp,
            Utc.with_ymd_and_hms(2026, 2, 7, 21, 0, 0).single().expect("ts")
                + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn log_entry_accepts_rfc3339_offset() {
        let ts = parse_timestamp("2026-02-07T23:00:00+02:00").expect("parse");
        assert_eq!(
            ts,
            Utc.with_ymd_and_hms(2026, 2, 7, 21, 0, 0).single().expect("ts")
        );
        assert!(parse_timestamp("yesterday").is_err());
    }
}
