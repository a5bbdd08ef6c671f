//! Incremental line framer for the modem's serial event stream.
//!
//! The modem emits newline-delimited ASCII event lines. Serial reads hand us
//! arbitrary chunks, so this framer buffers bytes and yields whole lines when
//! available. It applies a conservative size bound and resynchronizes by
//! discarding the oversized prefix when the modem (or line noise) produces a
//! run of bytes with no terminator.

use bytes::{Buf, BytesMut};

/// Maximum bytes tolerated without a newline before the buffer is dropped.
const MAX_LINE_BYTES: usize = 4096;

pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete line, without its terminator. Trailing `\r`
    /// is stripped (the modem uses CRLF). Returns None until a full line is
    /// buffered. Invalid UTF-8 is replaced rather than dropped so a single
    /// mangled byte cannot eat a whole report.
    pub fn next_line(&mut self) -> Option<String> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Some(String::from_utf8_lossy(&line).into_owned())
            }
            None => {
                if self.buf.len() > MAX_LINE_BYTES {
                    // Runaway unterminated input; drop it and resync.
                    self.buf.advance(self.buf.len());
                }
                None
            }
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
