//! Newline-delimited frame accumulation.
//!
//! A [`FrameReader`] accumulates raw socket reads and yields complete
//! frames. Oversized frames are reported as errors and their bytes are
//! discarded up to the next delimiter, so one misbehaving message does not
//! poison the connection.

use crate::error::ProtocolError;

/// Upper bound on a single frame, delimiter excluded.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const DELIMITER: u8 = b'\n';

/// Accumulates bytes and splits them into newline-delimited frames.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_frame: usize,
    /// Discarding mode: an oversized frame was detected and bytes are being
    /// dropped until the next delimiter resynchronizes the stream.
    discarding: bool,
}

impl FrameReader {
    /// Create a reader with the default frame bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    /// Create a reader with an explicit frame bound.
    #[must_use]
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
            discarding: false,
        }
    }

    /// Feed bytes from the transport; returns the completed frames in
    /// arrival order. Each returned item is either a frame or the error for
    /// an oversized one.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Vec<u8>, ProtocolError>> {
        let mut out = Vec::new();
        self.buf.extend_from_slice(data);

        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == DELIMITER) {
                let frame: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
                if self.discarding {
                    // Tail of an oversized frame; the error was already
                    // reported when the bound tripped.
                    self.discarding = false;
                } else if frame.len() > self.max_frame {
                    out.push(Err(ProtocolError::FrameTooLarge {
                        max: self.max_frame,
                    }));
                } else if !frame.is_empty() {
                    out.push(Ok(frame));
                }
            } else {
                if self.discarding {
                    // Still inside the oversized frame; drop the bytes
                    // rather than accumulating them.
                    self.buf.clear();
                } else if self.buf.len() > self.max_frame {
                    out.push(Err(ProtocolError::FrameTooLarge {
                        max: self.max_frame,
                    }));
                    self.buf.clear();
                    self.discarding = true;
                }
                break;
            }
        }
        out
    }

    /// Bytes currently buffered awaiting a delimiter.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
