//! Incremental line framer.
//!
//! Bytes arrive from the engine in arbitrarily sized chunks. [`LineFramer`]
//! accumulates them and yields one [`FrameOutcome`] per complete record. The
//! buffer holds raw bytes, so a chunk boundary falling inside a multi-byte
//! UTF-8 sequence is harmless: the output depends only on the concatenated
//! input, never on how it was split.
//!
//! A line longer than the framer's limit is reported once as malformed and
//! skipped up to the next delimiter, so a peer that never sends `\n` cannot
//! grow the buffer without bound.

use super::envelope::{DecodeError, Message, RECORD_DELIMITER};

/// Default upper bound on one line, delimiter excluded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Bytes of an oversized line kept in its `Malformed` report.
const PREVIEW_BYTES: usize = 80;

/// Result of framing one delimited line.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// A well-formed record.
    Record(Message),
    /// A line that could not be parsed. Framing continues with the next line.
    Malformed { line: String, reason: String },
}

#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no delimiter.
    scanned: usize,
    max_line: usize,
    /// Skipping the rest of an oversized line.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framer that rejects lines longer than `max_line` bytes (at least 1).
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line: max_line.max(1),
            discarding: false,
        }
    }

    /// Feed a chunk and collect every record it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameOutcome> {
        self.buffer.extend_from_slice(chunk);

        let mut outcomes = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == RECORD_DELIMITER)
        {
            let end = self.scanned + offset;
            let line = &self.buffer[start..end];
            if self.discarding {
                self.discarding = false;
            } else if line.len() > self.max_line {
                outcomes.push(oversized(line, self.max_line));
            } else if let Some(outcome) = decode_line(line) {
                outcomes.push(outcome);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);

        if self.discarding {
            self.buffer.clear();
        } else if self.buffer.len() > self.max_line {
            outcomes.push(oversized(&self.buffer, self.max_line));
            self.buffer.clear();
            self.discarding = true;
        }
        self.scanned = self.buffer.len();
        outcomes
    }

    /// Flush at end of stream.
    ///
    /// Trailing bytes without a delimiter are not a record; they are reported
    /// as malformed rather than dropped.
    pub fn finish(&mut self) -> Option<FrameOutcome> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(FrameOutcome::Malformed {
            line: trimmed.to_string(),
            reason: "unterminated record at end of stream".to_string(),
        })
    }

    /// Number of buffered bytes still waiting for a delimiter.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn oversized(bytes: &[u8], max_line: usize) -> FrameOutcome {
    let preview = &bytes[..bytes.len().min(PREVIEW_BYTES)];
    FrameOutcome::Malformed {
        line: String::from_utf8_lossy(preview).into_owned(),
        reason: format!("line exceeds {} bytes", max_line),
    }
}

fn decode_line(bytes: &[u8]) -> Option<FrameOutcome> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            return Some(FrameOutcome::Malformed {
                line: String::from_utf8_lossy(bytes).trim().to_string(),
                reason: DecodeError::from(e).to_string(),
            });
        }
    };

    let line = text.trim();
    if line.is_empty() {
        return None;
    }

    Some(match Message::decode(line) {
        Ok(message) => FrameOutcome::Record(message),
        Err(e) => FrameOutcome::Malformed {
            line: line.to_string(),
            reason: e.to_string(),
        },
    })
}
