use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::commands;
use crate::event_loop::{ConnHandler, Op};
use crate::frame::{Frame, Limits};
use crate::parser::Parser;
use crate::server::Shared;

const INTERNAL_ENCODE_ERROR: &[u8] = b"-ERR internal encode error\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Reading commands and writing their replies.
    Active,
    /// A protocol error reply is being written, the connection closes once it is out.
    Closing,
    /// Quiesced. Nothing is armed anymore.
    Closed,
}

/// Protocol state of one client connection, driven by the completions of its socket.
pub struct Connection {
    pub id: Uuid,
    client_address: SocketAddr,
    state: State,
    // Bytes are read from the socket into the parser. Complete frames are taken out of it, a
    // partial frame stays buffered until the next read.
    parser: Parser,
    shared: Arc<Shared>,
    span: Span,
}

impl Connection {
    pub(crate) fn new(
        id: Uuid,
        client_address: SocketAddr,
        shared: Arc<Shared>,
        limits: Limits,
    ) -> Connection {
        let span = info_span!(
            "connection",
            connection_id = %id,
            client_address = %client_address
        );

        Connection {
            id,
            client_address,
            state: State::Active,
            parser: Parser::new(limits),
            shared,
            span,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Decodes `input` and runs every command it completes, returning the encoded replies.
    ///
    /// A protocol error yields the error reply as `Err`; the stream cannot be read any further.
    fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, Vec<u8>> {
        let mut out = Vec::new();

        let frames = match self.parser.feed(input) {
            Ok(frames) => frames,
            Err(err) => {
                warn!("protocol error: {}", err);
                encode_reply(&Frame::Error(format!("ERR Protocol error: {}", err)), &mut out);
                return Err(out);
            }
        };

        for frame in frames {
            debug!("received frame: {:?}", frame);
            let reply = commands::execute(frame, &self.shared.store);
            debug!("sending reply: {:?}", reply);
            encode_reply(&reply, &mut out);
        }

        Ok(out)
    }

    fn close(&mut self) -> Op {
        if self.state != State::Closed {
            if self.shared.quiesce(&self.id) {
                info!("connection from {} closed", self.client_address);
            } else {
                debug!("connection already quiesced");
            }
            self.state = State::Closed;
        }

        Op::Stop
    }
}

impl ConnHandler for Connection {
    fn on_read(&mut self, result: io::Result<&[u8]>) -> Op {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state != State::Active {
            return self.close();
        }

        match result {
            Ok(bytes) if bytes.is_empty() => {
                debug!("client closed the connection");
                self.close()
            }
            Ok(bytes) => match self.process(bytes) {
                Ok(out) if out.is_empty() => Op::Read,
                Ok(out) => Op::Write(out),
                Err(out) => {
                    self.state = State::Closing;
                    Op::Write(out)
                }
            },
            Err(err) => {
                debug!("read failed: {}", err);
                self.close()
            }
        }
    }

    fn on_write(&mut self, result: io::Result<()>) -> Op {
        let span = self.span.clone();
        let _enter = span.enter();

        match result {
            Ok(()) if self.state == State::Active => Op::Read,
            Ok(()) => self.close(),
            Err(err) => {
                debug!("write failed: {}", err);
                self.close()
            }
        }
    }
}

fn encode_reply(reply: &Frame, out: &mut Vec<u8>) {
    if let Err(err) = reply.encode_into(out) {
        warn!("failed to encode reply {:?}: {}", reply, err);
        out.extend_from_slice(INTERNAL_ENCODE_ERROR);
    }
}
