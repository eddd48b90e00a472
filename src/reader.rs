// Line-oriented log reader and cursor primitives
//
// LineReader hands out one LineHandler per non-empty line. The handler is a
// cursor over the line with the consume/trim/parse primitives every parser
// shares. Failed numeric parses restore the cursor so callers can try an
// alternative branch of their grammar.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Cursor over a single log line.
#[derive(Debug, Clone, Default)]
pub struct LineHandler {
    line: String,
    pos: usize,
}

impl LineHandler {
    pub fn new(line: String) -> Self {
        Self { line, pos: 0 }
    }

    /// The full line, regardless of cursor position.
    pub fn raw_line(&self) -> &str {
        &self.line
    }

    /// The unconsumed remainder of the line.
    pub fn rest(&self) -> &str {
        &self.line[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.line.len()
    }

    /// Skip leading whitespace.
    pub fn trim_l(&mut self) {
        let rest = self.rest();
        let skipped = rest.len() - rest.trim_start().len();
        self.pos += skipped;
    }

    /// Advance to the next whitespace character, if any.
    #[allow(dead_code)]
    pub fn skip_till_whitespace(&mut self) {
        if let Some(off) = self.rest().find(char::is_whitespace) {
            self.pos += off;
        } else {
            self.pos = self.line.len();
        }
    }

    /// Consume exactly `c` at the cursor.
    pub fn consume_char(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    /// Consume exactly the prefix `s` at the cursor.
    pub fn consume_str(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    /// Search for `s` anywhere in the remainder and position the cursor
    /// right after it. Returns false (cursor untouched) if absent.
    pub fn consume_till_str(&mut self, s: &str) -> bool {
        match self.rest().find(s) {
            Some(off) => {
                self.pos += off + s.len();
                true
            }
            None => false,
        }
    }

    /// Extract characters while `pred` holds, advancing the cursor.
    pub fn extract_until(&mut self, pred: impl Fn(char) -> bool) -> &str {
        let start = self.pos;
        let rest = &self.line[start..];
        let len = rest
            .char_indices()
            .find(|(_, c)| !pred(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += len;
        &self.line[start..start + len]
    }

    /// Parse an unsigned integer in the given base (10 or 16). On failure
    /// the cursor is restored.
    pub fn parse_uint(&mut self, base: u32) -> Option<u64> {
        debug_assert!(base == 10 || base == 16);
        let start = self.pos;
        let digits: String = self
            .extract_until(|c| {
                if base == 16 {
                    c.is_ascii_hexdigit()
                } else {
                    c.is_ascii_digit()
                }
            })
            .to_string();
        match u64::from_str_radix(&digits, base) {
            Ok(v) => Some(v),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    /// Parse a (possibly negative) decimal integer. On failure the cursor
    /// is restored.
    pub fn parse_int(&mut self) -> Option<i64> {
        let start = self.pos;
        let negative = self.consume_char('-');
        match self.parse_uint(10) {
            Some(v) => {
                let v = v as i64;
                Some(if negative { -v } else { v })
            }
            None => {
                self.pos = start;
                None
            }
        }
    }

    /// Parse a literal `true` / `false`.
    pub fn parse_bool(&mut self) -> Option<bool> {
        if self.consume_str("true") {
            Some(true)
        } else if self.consume_str("false") {
            Some(false)
        } else {
            None
        }
    }
}

/// Buffered async reader yielding non-empty lines.
pub struct LineReader {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    line_number: u64,
}

impl LineReader {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::from_reader(Box::new(file)))
    }

    pub fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            reader: BufReader::new(reader),
            line_number: 0,
        }
    }

    /// Convenience for tests: read from an in-memory buffer.
    #[cfg(test)]
    pub fn from_string(content: &str) -> Self {
        Self::from_reader(Box::new(std::io::Cursor::new(content.to_string().into_bytes())))
    }

    /// The 1-based number of the line the last handler came from.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Next non-empty line, or None at end of input.
    pub async fn next_line(&mut self) -> std::io::Result<Option<LineHandler>> {
        loop {
            let mut buf = String::new();
            let n = self.reader.read_line(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            while buf.ends_with('\n') || buf.ends_with('\r') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }
            return Ok(Some(LineHandler::new(buf)));
        }
    }
}
