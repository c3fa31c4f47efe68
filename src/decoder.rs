//! Incremental decoding of upstream bodies into relay frames.
//!
//! Upstreams speak one of two streaming dialects: SSE (`data: ...` lines
//! separated by blank lines) or raw chunked text. Both decoders accept chunks
//! of arbitrary size and never assume a chunk boundary lines up with a line,
//! an event or a UTF-8 code point.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::frame::{RelayFrame, Usage};

/// Result of decoding one complete upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frames(Vec<RelayFrame>),
    /// The upstream's own end-of-stream marker.
    End,
    /// Valid JSON with no shape the relay understands.
    Ignored,
    Malformed(String),
    /// The upstream broke a size limit. Always the last item of a batch;
    /// the decoder yields nothing afterwards.
    Fatal(DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("upstream line exceeded {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("upstream event exceeded {limit} bytes before dispatch")]
    EventTooLarge { limit: usize },
}

/// Incremental SSE parser. `max_line_bytes` bounds both a single pending
/// line and the `data` accumulated for one event.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    data_bytes: usize,
    event: Option<String>,
    max_line_bytes: usize,
    failed: bool,
}

impl SseDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data: Vec::new(),
            data_bytes: 0,
            event: None,
            max_line_bytes,
            failed: false,
        }
    }

    /// Decodes every complete line in `chunk`. Items decoded before a size
    /// violation are returned ahead of the trailing [`Decoded::Fatal`].
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        if self.failed {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);
        let mut decoded = Vec::new();

        while let Some(index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.buffer.drain(..=index).collect::<Vec<_>>();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(item) = self.process_line(&line) {
                let fatal = matches!(item, Decoded::Fatal(_));
                decoded.push(item);
                if fatal {
                    return decoded;
                }
            }
        }

        if self.buffer.len() > self.max_line_bytes {
            decoded.push(self.fail(DecodeError::LineTooLong {
                limit: self.max_line_bytes,
            }));
        }

        decoded
    }

    /// Flushes a trailing line and dispatches an event left open by an
    /// upstream that closed without the final blank line.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut decoded = Vec::new();
        if self.failed {
            return decoded;
        }
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(item) = self.process_line(&line) {
                let fatal = matches!(item, Decoded::Fatal(_));
                decoded.push(item);
                if fatal {
                    return decoded;
                }
            }
        }
        if let Some(item) = self.dispatch() {
            decoded.push(item);
        }
        decoded
    }

    fn fail(&mut self, error: DecodeError) -> Decoded {
        self.failed = true;
        self.buffer.clear();
        self.data.clear();
        self.data_bytes = 0;
        Decoded::Fatal(error)
    }

    fn process_line(&mut self, line: &[u8]) -> Option<Decoded> {
        if line.is_empty() {
            return self.dispatch();
        }

        let Ok(line) = std::str::from_utf8(line) else {
            return Some(Decoded::Malformed("line is not valid UTF-8".to_owned()));
        };

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                self.data_bytes += value.len() + 1;
                if self.data_bytes > self.max_line_bytes {
                    return Some(self.fail(DecodeError::EventTooLarge {
                        limit: self.max_line_bytes,
                    }));
                }
                self.data.push(value.to_owned());
                None
            }
            "event" => {
                self.event = Some(value.to_owned());
                None
            }
            "id" | "retry" => None,
            _ => Some(Decoded::Malformed(format!(
                "unexpected line: {}",
                line.chars().take(80).collect::<String>()
            ))),
        }
    }

    fn dispatch(&mut self) -> Option<Decoded> {
        let event = self.event.take();
        self.data_bytes = 0;
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        Some(map_payload(&payload, event.as_deref()))
    }
}

/// Maps one SSE `data` payload to relay frames.
pub fn map_payload(payload: &str, event: Option<&str>) -> Decoded {
    let trimmed = payload.trim();
    if trimmed == "[DONE]" {
        return Decoded::End;
    }

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(error) => return Decoded::Malformed(format!("invalid JSON payload: {error}")),
    };

    if event == Some("error") {
        return Decoded::Frames(vec![RelayFrame::error(upstream_error_message(&value))]);
    }

    match value {
        Value::String(text) => text_frames(text),
        Value::Object(object) => map_object(object),
        _ => Decoded::Ignored,
    }
}

fn text_frames(text: String) -> Decoded {
    if text.is_empty() {
        Decoded::Ignored
    } else {
        Decoded::Frames(vec![RelayFrame::text(text)])
    }
}

fn map_object(object: Map<String, Value>) -> Decoded {
    if let Some(kind) = object.get("type").and_then(Value::as_str) {
        if kind == "error" {
            let message = upstream_error_message(&Value::Object(object));
            return Decoded::Frames(vec![RelayFrame::error(message)]);
        }
        if let Ok(frame) = serde_json::from_value::<RelayFrame>(Value::Object(object.clone())) {
            return Decoded::Frames(vec![frame]);
        }
    }

    if let Some(error) = object.get("error") {
        return Decoded::Frames(vec![RelayFrame::error(upstream_error_message(error))]);
    }

    let mut frames = Vec::new();

    let text = ["text", "content", "delta"]
        .iter()
        .find_map(|key| match object.get(*key) {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Object(inner)) => inner.get("text").and_then(Value::as_str).map(str::to_owned),
            _ => None,
        });
    if let Some(text) = text.filter(|text| !text.is_empty()) {
        frames.push(RelayFrame::text(text));
    }

    let percent = object
        .get("progress")
        .or_else(|| object.get("percent"))
        .and_then(Value::as_f64);
    if let Some(percent) = percent {
        frames.push(RelayFrame::Progress {
            percent: percent.clamp(0.0, 100.0),
            stage: object
                .get("stage")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        });
    }

    let mut bad_usage = None;
    if let Some(usage) = object.get("usage") {
        match serde_json::from_value::<Usage>(usage.clone()) {
            Ok(usage) => frames.push(RelayFrame::Usage(usage)),
            Err(error) => bad_usage = Some(format!("invalid usage object: {error}")),
        }
    }

    match (frames.is_empty(), bad_usage) {
        (true, Some(detail)) => Decoded::Malformed(detail),
        (true, None) => Decoded::Ignored,
        (false, Some(detail)) => {
            debug!(detail = %detail, "dropped usage from upstream event, kept content");
            Decoded::Frames(frames)
        }
        (false, None) => Decoded::Frames(frames),
    }
}

fn upstream_error_message(value: &Value) -> String {
    let message = match value {
        Value::String(message) => Some(message.as_str()),
        Value::Object(object) => object.get("message").and_then(Value::as_str),
        _ => None,
    };
    message
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .unwrap_or("The model service reported an error.")
        .to_owned()
}

/// Turns raw bytes into text without splitting a multi-byte character that
/// straddles two chunks. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match error.error_len() {
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }

        text
    }

    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
