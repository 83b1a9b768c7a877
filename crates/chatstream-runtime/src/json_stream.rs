//! Incremental extraction of JSON objects from fragmented text.
//!
//! Some providers stream whole JSON objects back to back (NDJSON or plain
//! concatenation) and the transport may cut them anywhere. The parser keeps
//! the unconsumed tail between calls and emits each object once its closing
//! brace has arrived.

use tracing::debug;

/// How object boundaries are located.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Braces inside JSON string literals are ignored (escapes honored).
    #[default]
    StringAware,
    /// Every `{` and `}` counts, including inside strings.
    BraceCounting,
}

/// Stateful parser fed with successive text fragments.
#[derive(Debug, Default)]
pub struct IncrementalJsonParser {
    buffer: String,
    mode: ScanMode,
}

impl IncrementalJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: ScanMode) -> Self {
        Self {
            buffer: String::new(),
            mode,
        }
    }

    /// Parser that counts every brace, matching payloads known to never carry
    /// braces inside string values.
    pub fn brace_counting() -> Self {
        Self::with_mode(ScanMode::BraceCounting)
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Appends `text` and returns every object completed by it, in order.
    ///
    /// Spans that balance but are not valid JSON are dropped.
    pub fn process_chunk(&mut self, text: &str) -> Vec<serde_json::Value> {
        self.buffer.push_str(text);
        let mut values = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[consumed..].find('{') {
            let start = consumed + offset;
            let Some(end) = self.object_end(start, self.mode) else {
                if let Some(end) = self.derailed_span_end(start) {
                    debug!(span_len = end - start, "discarding span with an unterminated string");
                    consumed = end;
                    continue;
                }
                break;
            };
            let span = &self.buffer[start..end];
            match serde_json::from_str::<serde_json::Value>(span) {
                Ok(value) => values.push(value),
                Err(err) => {
                    // A stray quote may have paired with one from a later
                    // object; only the brace-counted prefix is dropped then.
                    if let Some(early) = self.derailed_span_end(start).filter(|&e| e < end) {
                        debug!(
                            span_len = early - start,
                            "discarding span with an unterminated string"
                        );
                        consumed = early;
                        continue;
                    }
                    debug!(error = %err, span_len = span.len(), "discarding malformed json span");
                }
            }
            consumed = end;
        }

        self.buffer.drain(..consumed);
        values
    }

    /// Clears buffered text. Values already returned are unaffected.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Unconsumed text waiting for more input.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// End of a brace-counted span at `start` that a string-aware scan can
    /// never close.
    ///
    /// An unterminated string swallows every later object. The span is only
    /// given up once a non-empty object follows it, since quotes inside a
    /// real string value are escaped and cannot form one.
    fn derailed_span_end(&self, start: usize) -> Option<usize> {
        if self.mode != ScanMode::StringAware {
            return None;
        }
        let end = self.object_end(start, ScanMode::BraceCounting)?;
        let next = end + self.buffer[end..].find('{')?;
        let next_end = self.object_end(next, ScanMode::BraceCounting)?;
        match serde_json::from_str::<serde_json::Value>(&self.buffer[next..next_end]) {
            Ok(serde_json::Value::Object(map)) if !map.is_empty() => Some(end),
            _ => None,
        }
    }

    /// Byte index one past the `}` closing the object opened at `start`.
    fn object_end(&self, start: usize, mode: ScanMode) -> Option<usize> {
        let bytes = self.buffer.as_bytes();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' if mode == ScanMode::StringAware => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }
}
