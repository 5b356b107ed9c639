//! Incremental SSE frame decoder
//!
//! Bytes arrive in arbitrary chunks. Frames end at a blank line and are only
//! released once that delimiter has been seen. Raw bytes are buffered so a
//! UTF-8 sequence split across chunks is reassembled before decoding.

use tracing::debug;

/// Splits a byte stream into SSE frame payloads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Last byte pushed was `\r`; a `\n` right after it is the same line end
    after_cr: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. `\r\n` and lone `\r` line ends become `\n`, also
    /// when a `\r\n` pair is split across chunks.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.reserve(chunk.len());
        for &byte in chunk {
            match byte {
                b'\r' => {
                    self.buffer.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => self.after_cr = false,
                _ => {
                    self.buffer.push(byte);
                    self.after_cr = false;
                }
            }
        }
    }

    /// Next complete frame's data payload, if one is buffered.
    ///
    /// Frames without any `data:` line are skipped.
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            let boundary = self.buffer.windows(2).position(|w| w == b"\n\n")?;
            let rest = self.buffer.split_off(boundary + 2);
            let block = std::mem::replace(&mut self.buffer, rest);
            let block = String::from_utf8_lossy(&block[..boundary]);

            if let Some(payload) = data_payload(&block) {
                return Some(payload);
            }
        }
    }

    /// Bytes still waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// End of stream: an unterminated trailing frame is discarded
    pub fn finish(&mut self) {
        let leftover = self.buffer.iter().filter(|b| !b.is_ascii_whitespace()).count();
        if leftover > 0 {
            debug!(bytes = self.buffer.len(), "discarding unterminated frame");
        }
        self.buffer.clear();
        self.after_cr = false;
    }
}

/// Join the `data:` lines of one frame. `event:`, `id:`, `retry:` and
/// comment lines carry nothing the dispatcher needs.
fn data_payload(block: &str) -> Option<String> {
    let mut lines = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .peekable();

    lines.peek()?;
    Some(lines.collect::<Vec<_>>().join("\n"))
}
