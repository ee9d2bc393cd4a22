use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use tracing::debug;

use super::events::StreamEvent;

const DATA_PREFIX: &str = "data:";
const CLOSE_SENTINEL: &str = "event: close";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("malformed frame {frame:?}: {source}")]
    MalformedFrame {
        frame: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame has no `state` field")]
    MissingState,
    #[error("`{state}` event is missing its `{field}` field")]
    MissingField { state: String, field: &'static str },
    #[error("`{state}` event has an invalid `{field}` field: {source}")]
    InvalidEvent {
        state: String,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("POST Error: {0}")]
    Status(u16),
}

/// Reassembles server-sent event frames from arbitrarily split byte chunks.
///
/// Lines are buffered across chunks. `data:` lines (and, for transports that
/// drop the prefix on continuation lines, any other non-blank line) feed the
/// message buffer; a blank line flushes it as one JSON event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    message: String,
    closed: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when a partial line or unflushed message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty() || !self.message.is_empty()
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.message.clear();
    }

    /// Feed one transport read, returning every event it completes.
    ///
    /// The decoder closes after a terminal event or a decode failure, and
    /// ignores anything pushed after that.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, StreamError>> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }
        if chunk.starts_with(b"event: close\n") {
            debug!(discarded = self.has_partial(), "close sentinel at chunk start");
            self.close();
            return out;
        }

        self.pending.extend_from_slice(chunk);
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            let line = text.strip_suffix('\r').unwrap_or(&*text);

            if let Some(item) = self.feed_line(line) {
                let terminal = match &item {
                    Ok(event) => event.is_terminal(),
                    Err(_) => true,
                };
                out.push(item);
                if terminal {
                    self.close();
                }
            }
            if self.closed {
                break;
            }
        }
        out
    }

    fn feed_line(&mut self, line: &str) -> Option<Result<StreamEvent, StreamError>> {
        if line == CLOSE_SENTINEL {
            debug!(discarded = !self.message.is_empty(), "close sentinel");
            self.close();
            return None;
        }
        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            self.message.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            None
        } else if !line.is_empty() {
            self.message.push_str(line);
            None
        } else if !self.message.is_empty() {
            let frame = std::mem::take(&mut self.message);
            Some(StreamEvent::parse(&frame))
        } else {
            None
        }
    }
}

/// Decode a byte stream into events, lazily and in arrival order.
///
/// Ends at end-of-stream, at the close sentinel, or right after a terminal
/// event or error has been yielded.
pub fn decode<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamEvent, StreamError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let ready: VecDeque<Result<StreamEvent, StreamError>> = VecDeque::new();
    stream::unfold(
        (bytes, SseDecoder::new(), ready),
        |(mut bytes, mut decoder, mut ready)| async move {
            loop {
                if let Some(item) = ready.pop_front() {
                    return Some((item, (bytes, decoder, ready)));
                }
                if decoder.is_closed() {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.push(chunk.as_ref())),
                    Some(Err(err)) => {
                        decoder.close();
                        ready.push_back(Err(StreamError::Transport(err.to_string())));
                    }
                    None => {
                        if decoder.has_partial() {
                            debug!("stream ended inside an unterminated frame");
                        }
                        return None;
                    }
                }
            }
        },
    )
}
