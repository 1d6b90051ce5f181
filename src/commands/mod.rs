pub mod del;
pub mod echo;
pub mod executable;
pub mod get;
pub mod incr;
pub mod ping;
pub mod set;

use bytes::Bytes;
use std::vec;
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::frame::Frame;
use crate::store::Store;

use del::Del;
use echo::Echo;
use get::Get;
use incr::Incr;
use ping::Ping;
use set::Set;

#[derive(Debug, PartialEq)]
pub enum Command {
    Del(Del),
    Get(Get),
    Incr(Incr),
    Set(Set),

    Echo(Echo),
    Ping(Ping),
}

impl Executable for Command {
    fn exec(self, store: &Store) -> Frame {
        match self {
            Command::Del(cmd) => cmd.exec(store),
            Command::Echo(cmd) => cmd.exec(store),
            Command::Get(cmd) => cmd.exec(store),
            Command::Incr(cmd) => cmd.exec(store),
            Command::Ping(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
        }
    }
}

impl TryFrom<Frame> for Command {
    type Error = CommandParserError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the Redis server as RESP arrays.
        let frames = match frame {
            Frame::Array(array) => array,
            _ => return Err(CommandParserError::NotAnArray),
        };

        let mut parts = frames.into_iter();
        let command = parse_command_name(&mut parts)?;
        let parser = &mut CommandParser { command, parts };

        match &parser.command[..] {
            "del" => Del::try_from(parser).map(Command::Del),
            "echo" => Echo::try_from(parser).map(Command::Echo),
            "get" => Get::try_from(parser).map(Command::Get),
            "incr" => Incr::try_from(parser).map(Command::Incr),
            "ping" => Ping::try_from(parser).map(Command::Ping),
            "set" => Set::try_from(parser).map(Command::Set),
            _ => Err(CommandParserError::UnknownCommand {
                command: parser.command.clone(),
            }),
        }
    }
}

/// Parses and runs one command frame, turning command errors into error replies.
pub fn execute(frame: Frame, store: &Store) -> Frame {
    match Command::try_from(frame) {
        Ok(cmd) => cmd.exec(store),
        Err(err) => err.into(),
    }
}

fn parse_command_name(parts: &mut vec::IntoIter<Frame>) -> Result<String, CommandParserError> {
    let command_name = parts.next().ok_or(CommandParserError::EmptyCommand)?;

    match command_name {
        Frame::Simple(s) => Ok(s.to_lowercase()),
        Frame::Bulk(bytes) => Ok(String::from_utf8_lossy(&bytes).to_lowercase()),
        frame => Err(CommandParserError::InvalidToken { kind: frame.kind() }),
    }
}

/// Walks the arguments of a command, the command name already taken off the front.
pub struct CommandParser {
    /// Lower-cased command name, used in error replies.
    command: String,
    parts: vec::IntoIter<Frame>,
}

impl CommandParser {
    /// Number of arguments not consumed yet.
    pub fn remaining(&self) -> usize {
        self.parts.len()
    }

    /// Fails with a wrong arity error unless exactly `count` arguments are left.
    pub fn expect_args(&self, count: usize) -> Result<(), CommandParserError> {
        if self.remaining() == count {
            Ok(())
        } else {
            Err(self.wrong_arity())
        }
    }

    pub fn wrong_arity(&self) -> CommandParserError {
        CommandParserError::WrongArity {
            command: self.command.clone(),
        }
    }

    /// Takes the next argument as raw bytes. Keys and values are binary safe.
    pub fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        let frame = self.parts.next().ok_or_else(|| self.wrong_arity())?;

        match frame {
            Frame::Simple(s) => Ok(Bytes::from(s)),
            Frame::Bulk(bytes) => Ok(bytes),
            frame => Err(CommandParserError::InvalidToken { kind: frame.kind() }),
        }
    }
}

/// Errors answered with an error reply. None of them end the connection.
#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("Protocol error: command must be array")]
    NotAnArray,
    #[error("Protocol error: empty command")]
    EmptyCommand,
    #[error("Protocol error: invalid command token kind {kind}")]
    InvalidToken { kind: &'static str },
    #[error("wrong number of arguments for '{command}' command")]
    WrongArity { command: String },
    #[error("unknown command '{command}'")]
    UnknownCommand { command: String },
}

impl From<CommandParserError> for Frame {
    fn from(err: CommandParserError) -> Frame {
        Frame::Error(format!("ERR {}", err))
    }
}
