//! `text/event-stream` codec.
use std::{fmt::Write, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use monoio_codec::{Decoded, Decoder, Encoder};

const BOM: &[u8] = b"\xEF\xBB\xBF";
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SseError {
    #[error("event stream is not utf-8")]
    InvalidUtf8,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for SseError {
    fn from(e: io::Error) -> Self {
        SseError::Io(e.kind())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub comment: Option<String>,
    pub retry: Option<u64>,
    pub data: Option<String>,
}

impl SseEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unnamed event carrying `data`.
    pub fn message(data: impl Into<String>) -> Self {
        Self::new().with_data(data)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Wire form, terminated by a blank line. Multi-line values become
    /// repeated fields.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.write_to(&mut buf);
        buf.freeze()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        let mut out = String::with_capacity(64);
        if let Some(comment) = &self.comment {
            for line in lines(comment) {
                let _ = writeln!(out, ": {line}");
            }
        }
        if let Some(id) = &self.id {
            // an id cannot span lines
            let _ = writeln!(out, "id: {}", lines(id).next().unwrap_or_default());
        }
        if let Some(event) = &self.event {
            let _ = writeln!(out, "event: {}", lines(event).next().unwrap_or_default());
        }
        if let Some(retry) = self.retry {
            let _ = writeln!(out, "retry: {retry}");
        }
        if let Some(data) = &self.data {
            for line in lines(data) {
                let _ = writeln!(out, "data: {line}");
            }
        }
        out.push('\n');
        buf.put_slice(out.as_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SseEncoder;

impl Encoder<SseEvent> for SseEncoder {
    type Error = SseError;

    fn encode(&mut self, event: SseEvent, dst: &mut BytesMut) -> Result<(), SseError> {
        event.write_to(dst);
        Ok(())
    }
}

/// Splits on LF, CRLF and CR.
fn lines(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(text);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(&['\r', '\n'][..]) {
            Some(pos) => {
                let skip = if current[pos..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[pos + skip..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

/// Incremental event-stream parser. The source buffer may grow in arbitrary
/// fragments; an incomplete trailing line stays in it and the fields of an
/// incomplete event stay in the decoder.
#[derive(Debug)]
pub struct SseDecoder {
    max_line: usize,
    at_start: bool,
    pending: SseEvent,
    seen_field: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            max_line,
            at_start: true,
            pending: SseEvent::default(),
            seen_field: false,
        }
    }

    /// Drains `src` and returns every event it completes.
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<SseEvent>, SseError> {
        let mut events = Vec::new();
        while let Decoded::Some(event) = self.decode(src)? {
            events.push(event);
        }
        Ok(events)
    }

    fn next_line(&mut self, buf: &mut BytesMut) -> Result<Option<String>, SseError> {
        let Some(pos) = buf.iter().position(|b| *b == b'\r' || *b == b'\n') else {
            if buf.len() > self.max_line {
                return Err(SseError::LineTooLong(self.max_line));
            }
            return Ok(None);
        };
        let terminator = match (buf[pos], buf.get(pos + 1)) {
            (b'\r', Some(b'\n')) => 2,
            // a lone CR at the end may be the first half of CRLF
            (b'\r', None) => return Ok(None),
            _ => 1,
        };
        if pos > self.max_line {
            return Err(SseError::LineTooLong(self.max_line));
        }
        let line = buf.split_to(pos);
        buf.advance(terminator);
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| SseError::InvalidUtf8)
    }

    fn field(&mut self, line: &str) {
        let (name, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        let event = &mut self.pending;
        match name {
            "" => append(&mut event.comment, value),
            "data" => append(&mut event.data, value),
            "event" => event.event = Some(value.to_string()),
            "id" if !value.contains('\0') => event.id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                match value.parse() {
                    Ok(retry) => event.retry = Some(retry),
                    Err(_) => return,
                }
            }
            _ => return,
        }
        self.seen_field = true;
    }
}

impl Decoder for SseDecoder {
    type Item = SseEvent;
    type Error = SseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<SseEvent>, SseError> {
        if self.at_start {
            let n = src.len().min(BOM.len());
            if src[..n] != BOM[..n] {
                self.at_start = false;
            } else if n < BOM.len() {
                return Ok(Decoded::Insufficient);
            } else {
                src.advance(BOM.len());
                self.at_start = false;
            }
        }

        while let Some(line) = self.next_line(src)? {
            if line.is_empty() {
                if std::mem::take(&mut self.seen_field) {
                    return Ok(Decoded::Some(std::mem::take(&mut self.pending)));
                }
                continue;
            }
            self.field(&line);
        }
        Ok(Decoded::Insufficient)
    }
}

fn append(slot: &mut Option<String>, value: &str) {
    match slot {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(value);
        }
        None => *slot = Some(value.to_string()),
    }
}
