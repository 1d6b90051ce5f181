use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, Frame, Limits};

/// Frames RESP2 values over any async byte stream, e.g. with `tokio_util::codec::Framed`.
///
/// It is the client side counterpart of the server's connection handling and shares its parser
/// limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec {
    limits: Limits,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] frame::Error),
    #[error(transparent)]
    Encode(#[from] frame::EncodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameCodec {
    pub fn new(limits: Limits) -> FrameCodec {
        FrameCodec { limits }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse(&mut cursor, &self.limits, 0) {
            Ok(frame) => frame,
            // Not enough data to parse a frame.
            Err(frame::Error::Incomplete) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        // Remove the parsed frame from the buffer.
        let position = cursor.position() as usize;
        src.advance(position);

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.encode()?;
        dst.extend_from_slice(&bytes);

        Ok(())
    }
}
