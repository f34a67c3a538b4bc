//! # SSE Event Parser
//!
//! Turns raw byte chunks into complete server-sent-event frames.
//!
//! Lines end in `\n`, `\r\n` or `\r`, and frames end at a blank line. A
//! frame's `data:` lines are joined with `\n` and trimmed. A payload of
//! `[DONE]` signals end of stream. Any other payload must be JSON; payloads
//! that fail to decode are reported through `on_parse_error` and skipped.
//!
//! The parser keeps no state of its own: unconsumed bytes are handed back as
//! `leftover` and must be passed in with the next chunk. Leftover is kept as
//! bytes so a chunk boundary inside a multi-byte character is harmless.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::byte_stream::ByteStream;
use crate::provider::ProviderError;

/// Receives parsed frames.
pub trait SseHandler {
    /// A JSON payload, with the frame's `event:` name if present.
    fn on_event(&mut self, event: Option<&str>, data: Value);
    /// The `[DONE]` sentinel.
    fn on_done(&mut self);
    /// A payload that is not valid JSON.
    fn on_parse_error(&mut self, raw: &str, error: &serde_json::Error);
}

/// One parsed frame.
#[derive(Clone, Debug, PartialEq)]
pub enum SseFrame {
    /// JSON payload.
    Event {
        /// `event:` field.
        event: Option<String>,
        /// Decoded `data:` payload.
        data: Value,
    },
    /// `[DONE]` sentinel.
    Done,
    /// Undecodable payload.
    Malformed {
        /// Raw payload text.
        raw: String,
        /// Decoder message.
        error: String,
    },
}

impl SseHandler for Vec<SseFrame> {
    fn on_event(&mut self, event: Option<&str>, data: Value) {
        self.push(SseFrame::Event {
            event: event.map(str::to_owned),
            data,
        });
    }

    fn on_done(&mut self) {
        self.push(SseFrame::Done);
    }

    fn on_parse_error(&mut self, raw: &str, error: &serde_json::Error) {
        self.push(SseFrame::Malformed {
            raw: raw.to_owned(),
            error: error.to_string(),
        });
    }
}

struct Callbacks<E, D, P> {
    on_event: E,
    on_done: D,
    on_parse_error: P,
}

impl<E, D, P> SseHandler for Callbacks<E, D, P>
where
    E: FnMut(Option<&str>, Value),
    D: FnMut(),
    P: FnMut(&str, &serde_json::Error),
{
    fn on_event(&mut self, event: Option<&str>, data: Value) {
        (self.on_event)(event, data);
    }

    fn on_done(&mut self) {
        (self.on_done)();
    }

    fn on_parse_error(&mut self, raw: &str, error: &serde_json::Error) {
        (self.on_parse_error)(raw, error);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunk parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Callback form: parse `chunk` after `leftover` and return the new leftover.
pub fn parse(
    chunk: &[u8],
    leftover: Vec<u8>,
    on_event: impl FnMut(Option<&str>, Value),
    on_done: impl FnMut(),
    on_parse_error: impl FnMut(&str, &serde_json::Error),
) -> Vec<u8> {
    let mut callbacks = Callbacks {
        on_event,
        on_done,
        on_parse_error,
    };
    parse_chunk(chunk, leftover, &mut callbacks)
}

/// Parse `chunk` after `leftover`, dispatching complete frames to `handler`.
///
/// Returns the bytes of the trailing incomplete frame.
pub fn parse_chunk<H: SseHandler + ?Sized>(chunk: &[u8], leftover: Vec<u8>, handler: &mut H) -> Vec<u8> {
    // Leftover holds no blank line, so only its last few bytes can begin one.
    let mut scan_from = leftover.len().saturating_sub(3);
    let mut buf = leftover;
    buf.extend_from_slice(chunk);

    let mut start = 0;
    while let Some((frame_end, next_start)) = find_frame_end(&buf, scan_from) {
        dispatch_frame(&buf[start..frame_end], handler);
        start = next_start;
        scan_from = next_start;
    }

    if start == 0 {
        buf
    } else {
        buf.split_off(start)
    }
}

/// Flush a final frame that was not followed by a blank line.
pub fn finish<H: SseHandler + ?Sized>(leftover: Vec<u8>, handler: &mut H) {
    if !leftover.is_empty() {
        dispatch_frame(&leftover, handler);
    }
}

enum LineEnd {
    Other,
    Len(usize),
    /// A trailing `\r` that may still be half of `\r\n`.
    Pending,
}

fn line_end_at(buf: &[u8], i: usize) -> LineEnd {
    match buf.get(i) {
        Some(b'\n') => LineEnd::Len(1),
        Some(b'\r') => match buf.get(i + 1) {
            Some(b'\n') => LineEnd::Len(2),
            Some(_) => LineEnd::Len(1),
            None => LineEnd::Pending,
        },
        _ => LineEnd::Other,
    }
}

/// Locate the next blank line at or after `from`.
///
/// Returns `(end of frame, start of next frame)`. Lines may end in `\n`,
/// `\r\n` or a bare `\r`, mixed freely.
fn find_frame_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        match line_end_at(buf, i) {
            LineEnd::Other => i += 1,
            LineEnd::Pending => return None,
            LineEnd::Len(n) => {
                let j = i + n;
                match line_end_at(buf, j) {
                    LineEnd::Len(m) => return Some((i, j + m)),
                    // Blank either way; a following `\n` lands as an empty line.
                    LineEnd::Pending => return Some((i, j + 1)),
                    LineEnd::Other => i = j,
                }
            }
        }
    }
    None
}

fn dispatch_frame<H: SseHandler + ?Sized>(frame: &[u8], handler: &mut H) {
    let text = String::from_utf8_lossy(frame);
    let mut event: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.split(['\n', '\r']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => event = Some(value.trim()),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return;
    }
    let payload = data_lines.join("\n");
    let payload = payload.trim();
    if payload.is_empty() {
        return;
    }
    if payload == "[DONE]" {
        handler.on_done();
        return;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(data) => handler.on_event(event, data),
        Err(e) => handler.on_parse_error(payload, &e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream adapter
// ─────────────────────────────────────────────────────────────────────────────

struct FrameState {
    body: ByteStream,
    leftover: Vec<u8>,
    pending: VecDeque<SseFrame>,
    finished: bool,
}

/// Parse a byte stream into frames. Malformed frames are logged and skipped.
///
/// A trailing frame without a blank line is flushed when the body ends.
pub fn sse_frames(body: ByteStream) -> impl Stream<Item = Result<SseFrame, ProviderError>> + Send {
    let state = FrameState {
        body,
        leftover: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.pending.pop_front() {
                if let SseFrame::Malformed { raw, error } = &frame {
                    warn!(
                        error = %error,
                        data_preview = %relay_core::text::truncate_str(raw, 200),
                        "skipping malformed SSE frame"
                    );
                    continue;
                }
                return Some((Ok(frame), st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let mut frames = Vec::new();
                    st.leftover = parse_chunk(&chunk, std::mem::take(&mut st.leftover), &mut frames);
                    st.pending.extend(frames);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.finished = true;
                    let mut frames = Vec::new();
                    finish(std::mem::take(&mut st.leftover), &mut frames);
                    st.pending.extend(frames);
                }
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
