use crate::MemoryBlock;
use serde_json::Value;
use thiserror::Error;

pub const FREE_LABEL: &str = "Free";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockParseError {
    #[error("record is not a string: {0}")]
    NotText(String),
    #[error("record has no label: {0:?}")]
    MissingLabel(String),
    #[error("range token {0:?} is not <start>-<end>")]
    MalformedRange(String),
    #[error("range bound {token:?} is not an integer: {message}")]
    InvalidBound { token: String, message: String },
    #[error("range end {end} precedes start {start}")]
    InvertedRange { start: u64, end: u64 },
    #[error("range {start}-{end} overflows block size")]
    SizeOverflow { start: u64, end: u64 },
}

/// A record that failed to parse, with its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub index: usize,
    pub error: BlockParseError,
}

/// Outcome of parsing one batch. Failures are isolated per record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub blocks: Vec<MemoryBlock>,
    pub errors: Vec<RecordError>,
}

impl ParseReport {
    fn push_block(&mut self, block: MemoryBlock) {
        self.blocks.push(block);
    }

    fn push_error(&mut self, index: usize, error: BlockParseError) {
        self.errors.push(RecordError { index, error });
    }
}

/// Parses one `"[<start>-<end>] <label>"` record.
pub fn parse_block(record: &str) -> Result<MemoryBlock, BlockParseError> {
    let trimmed = record.trim();
    let (range_token, label) = trimmed
        .split_once(char::is_whitespace)
        .map(|(range, label)| (range, label.trim()))
        .ok_or_else(|| BlockParseError::MissingLabel(trimmed.to_string()))?;
    if label.is_empty() {
        return Err(BlockParseError::MissingLabel(trimmed.to_string()));
    }

    let (start, end) = parse_range(range_token)?;
    if label == FREE_LABEL {
        MemoryBlock::free(start, end)
    } else {
        MemoryBlock::used(start, end, label)
    }
}

fn parse_range(token: &str) -> Result<(u64, u64), BlockParseError> {
    let inner = token.trim_start_matches('[').trim_end_matches(']');
    let (start, end) = inner
        .split_once('-')
        .ok_or_else(|| BlockParseError::MalformedRange(token.to_string()))?;
    Ok((parse_bound(start)?, parse_bound(end)?))
}

fn parse_bound(token: &str) -> Result<u64, BlockParseError> {
    token
        .trim()
        .parse::<u64>()
        .map_err(|err| BlockParseError::InvalidBound {
            token: token.to_string(),
            message: err.to_string(),
        })
}

pub fn parse_blocks<I, S>(records: I) -> ParseReport
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut report = ParseReport::default();
    for (index, record) in records.into_iter().enumerate() {
        match parse_block(record.as_ref()) {
            Ok(block) => report.push_block(block),
            Err(err) => report.push_error(index, err),
        }
    }
    report
}

/// Like [`parse_blocks`] over raw JSON values; non-string entries count as
/// malformed records rather than failing the batch.
pub fn parse_block_values(values: &[Value]) -> ParseReport {
    let mut report = ParseReport::default();
    for (index, value) in values.iter().enumerate() {
        let parsed = match value.as_str() {
            Some(record) => parse_block(record),
            None => Err(BlockParseError::NotText(value.to_string())),
        };
        match parsed {
            Ok(block) => report.push_block(block),
            Err(err) => report.push_error(index, err),
        }
    }
    report
}
