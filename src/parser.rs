use bytes::{Buf, BytesMut};
use std::io::Cursor;

use crate::frame::{self, Frame, Limits};

/// Incremental RESP2 decoder.
///
/// Bytes are handed over as they arrive from the socket, in chunks of any size. Every complete
/// frame is returned as soon as its last byte is fed; a partial frame at the end of the input is
/// kept until the next call completes it.
#[derive(Debug)]
pub struct Parser {
    // Data is read from the socket into the buffer. When a frame is parsed, the corresponding
    // data is removed from the buffer.
    buffer: BytesMut,
    limits: Limits,
}

impl Parser {
    pub fn new(limits: Limits) -> Parser {
        Parser {
            // Allocate the buffer with 4kb of capacity.
            buffer: BytesMut::with_capacity(4096),
            limits,
        }
    }

    /// Appends `input` and returns every frame it completes, in order.
    ///
    /// A malformed frame clears the buffered input and fails the whole call, including frames
    /// that were decoded before it. The stream cannot be resynchronised afterwards.
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<Frame>, frame::Error> {
        self.buffer.extend_from_slice(input);

        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < self.buffer.len() {
            let mut cursor = Cursor::new(&self.buffer[..]);
            cursor.set_position(offset as u64);

            match Frame::parse(&mut cursor, &self.limits, 0) {
                Ok(frame) => {
                    frames.push(frame);
                    offset = cursor.position() as usize;
                }
                Err(frame::Error::Incomplete) => break,
                Err(err) => {
                    self.buffer.clear();
                    return Err(err);
                }
            }
        }

        self.buffer.advance(offset);

        Ok(frames)
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}
