//! Log capture for supervised services.
//!
//! This module provides the per-service ring buffer (`LogBuffer`), the line
//! sanitizer that strips terminal control sequences, the keyword-based
//! severity classifier and the include/exclude line filter.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Number of lines retained per service.
pub const DEFAULT_MAX_LINES: usize = 1000;

/// Indicates the source stream of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Severity assigned to a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single line of log output from a service.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// The sanitized content of the line.
    pub text: String,
    /// When the line was captured.
    pub timestamp: DateTime<Utc>,
    /// Classified severity.
    pub level: Level,
    /// Whether the line came from stderr or marks a failure.
    pub is_error: bool,
}

impl LogLine {
    /// A line captured from a service stream, already sanitized.
    pub fn captured(text: String, stream: StreamKind) -> Self {
        let is_error = stream == StreamKind::Stderr;
        Self {
            level: classify(&text, is_error),
            text,
            timestamp: Utc::now(),
            is_error,
        }
    }

    /// A lifecycle line written by the supervisor itself.
    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: Utc::now(),
            level: Level::Info,
            is_error: false,
        }
    }

    /// A lifecycle line reporting a failure.
    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: Utc::now(),
            level: Level::Error,
            is_error: true,
        }
    }
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Copies out the most recent `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Strips escape sequences and carriage returns and trims the line.
///
/// Returns `None` when nothing printable is left.
pub fn sanitize_line(raw: &str) -> Option<String> {
    let stripped = strip(raw.as_bytes());
    let text = String::from_utf8_lossy(&stripped).replace('\r', "");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Longest line accepted from a child stream; the rest of the line is discarded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reads one `\n`-terminated line, keeping at most `limit` bytes of it.
///
/// Returns `Ok(None)` at end of stream. Invalid UTF-8 is replaced.
pub async fn read_line_capped<R>(reader: &mut R, limit: usize) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut seen_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        seen_any = true;
        let (chunk, consumed, done) = match available.iter().position(|b| *b == b'\n') {
            Some(idx) => (&available[..idx], idx + 1, true),
            None => (available, available.len(), false),
        };
        let room = limit.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);
        reader.consume(consumed);
        if done {
            break;
        }
    }
    if !seen_any {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Guesses a severity from keywords in the line.
pub fn classify(text: &str, from_stderr: bool) -> Level {
    let lower = text.to_lowercase();
    if from_stderr || lower.contains("error") || lower.contains("fail") {
        Level::Error
    } else if lower.contains("warn") {
        Level::Warn
    } else if lower.contains("debug") {
        Level::Debug
    } else {
        Level::Info
    }
}

/// Case-insensitive include/exclude patterns applied to captured lines.
#[derive(Debug, Clone, Default)]
pub struct LineFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl LineFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Whether a sanitized line should be kept.
    pub fn allows(&self, text: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(text) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(text),
            None => true,
        }
    }
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, regex::Error> {
    match pattern.filter(|p| !p.is_empty()) {
        Some(pattern) => RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(LogLine::notice("a"));
        buffer.push(LogLine::notice("b"));
        let dropped = buffer.push(LogLine::notice("c"));
        assert!(dropped);
        let lines = buffer.tail(usize::MAX).into_iter().map(|l| l.text).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn log_buffer_never_exceeds_capacity() {
        let mut buffer = LogBuffer::new(DEFAULT_MAX_LINES);
        for i in 0..1500 {
            buffer.push(LogLine::notice(format!("line {i}")));
        }
        let lines = buffer.tail(usize::MAX);
        assert_eq!(lines.len(), DEFAULT_MAX_LINES);
        assert_eq!(lines.first().unwrap().text, "line 500");
        assert_eq!(lines.last().unwrap().text, "line 1499");
    }

    #[test]
    fn tail_returns_most_recent_in_order() {
        let mut buffer = LogBuffer::new(10);
        for text in ["a", "b", "c", "d"] {
            buffer.push(LogLine::notice(text));
        }
        let tail = buffer.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text, "c");
        assert_eq!(tail[1].text, "d");
        assert_eq!(buffer.tail(100).len(), 4);
        buffer.clear();
        assert!(buffer.tail(100).is_empty());
    }

    #[test]
    fn sanitize_strips_escapes_and_carriage_returns() {
        assert_eq!(
            sanitize_line("\u{1b}[32mready\u{1b}[0m in 20ms\r").as_deref(),
            Some("ready in 20ms")
        );
        assert_eq!(sanitize_line("   \r"), None);
        assert_eq!(sanitize_line("\u{1b}[2K"), None);
    }

    #[test]
    fn classify_uses_keywords_and_stream() {
        assert_eq!(classify("Compilation FAILED", false), Level::Error);
        assert_eq!(classify("an error occurred", false), Level::Error);
        assert_eq!(classify("Warning: deprecated", false), Level::Warn);
        assert_eq!(classify("debug: cache hit", false), Level::Debug);
        assert_eq!(classify("listening on :3000", false), Level::Info);
        assert_eq!(classify("listening on :3000", true), Level::Error);
    }

    #[test]
    fn captured_stderr_line_is_error() {
        let line = LogLine::captured("boom".into(), StreamKind::Stderr);
        assert!(line.is_error);
        assert_eq!(line.level, Level::Error);
    }

    #[tokio::test]
    async fn read_line_capped_truncates_long_lines() {
        let data = b"short\nabcdefghij\n\xff\xfeok\ntail".to_vec();
        let mut reader = tokio::io::BufReader::with_capacity(4, &data[..]);
        let mut lines = Vec::new();
        while let Some(line) = read_line_capped(&mut reader, 6).await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["short", "abcdef", "\u{fffd}\u{fffd}ok", "tail"]);
    }

    #[test]
    fn filter_applies_exclude_before_include() {
        let filter = LineFilter::new(Some("api"), Some("hmr")).unwrap();
        assert!(filter.allows("API ready"));
        assert!(!filter.allows("api hmr update"));
        assert!(!filter.allows("web ready"));
        assert!(LineFilter::default().allows("anything"));
        assert!(LineFilter::new(Some("("), None).is_err());
    }
}
