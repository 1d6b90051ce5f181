// https://redis.io/docs/reference/protocol-spec

use std::io::Cursor;
use std::str;

use bytes::{Buf, BufMut, Bytes};
use strum_macros::IntoStaticStr;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Largest bulk string accepted by the parser, 512 MiB.
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest element count accepted for a single array.
pub const DEFAULT_MAX_ARRAY_LEN: usize = 1024 * 1024;
/// Deepest array nesting accepted by the parser.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// Upper bound for the capacity reserved up front when an array header is read. The announced
// length is only trusted once the elements actually arrive.
const MAX_ARRAY_PREALLOC: usize = 1024;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("unknown RESP2 prefix byte '{}'", .0.escape_ascii())]
    UnknownPrefix(u8),
    #[error("invalid integer {0:?}")]
    InvalidInteger(String),
    #[error("invalid bulk string length {0:?}")]
    InvalidBulkLength(String),
    #[error("negative bulk string length: {0}")]
    NegativeBulkLength(i64),
    #[error("bulk string length {len} exceeds limit {limit}")]
    BulkTooLarge { len: i64, limit: usize },
    #[error("bulk string missing CRLF terminator")]
    MissingBulkTerminator,
    #[error("invalid array length {0:?}")]
    InvalidArrayLength(String),
    #[error("negative array length: {0}")]
    NegativeArrayLength(i64),
    #[error("array length {len} exceeds limit {limit}")]
    ArrayTooLarge { len: i64, limit: usize },
    #[error("array nesting exceeds max depth {0}")]
    MaxDepthExceeded(usize),
}

#[derive(Debug, ThisError, PartialEq)]
pub enum EncodeError {
    #[error("{kind} contains CR or LF")]
    InlineNewline { kind: &'static str },
}

/// Bounds applied while parsing untrusted input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_bulk_len: usize,
    pub max_array_len: usize,
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// A single RESP2 value.
///
/// `Null` is the null bulk string `$-1`. The null array `*-1` is not accepted, any negative array
/// length is malformed.
#[derive(Clone, Debug, PartialEq, IntoStaticStr)]
pub enum Frame {
    #[strum(serialize = "simple_string")]
    Simple(String),
    #[strum(serialize = "error")]
    Error(String),
    #[strum(serialize = "integer")]
    Integer(i64),
    #[strum(serialize = "bulk_string")]
    Bulk(Bytes),
    #[strum(serialize = "array")]
    Array(Vec<Frame>),
    #[strum(serialize = "null")]
    Null,
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Name of the value kind, as used in protocol error messages.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Parses one frame starting at the cursor position.
    ///
    /// On success the cursor is left right after the frame. `Error::Incomplete` means the input
    /// ends before the frame does; the caller should retry from the same position once more bytes
    /// are available. Any other error means the input is malformed.
    pub fn parse(src: &mut Cursor<&[u8]>, limits: &Limits, depth: usize) -> Result<Frame, Error> {
        if depth > limits.max_depth {
            return Err(Error::MaxDepthExceeded(limits.max_depth));
        }

        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        match get_byte(src)? {
            b'+' => {
                let line = get_line(src)?;
                Ok(Frame::Simple(lossy(line)))
            }
            b'-' => {
                let line = get_line(src)?;
                Ok(Frame::Error(lossy(line)))
            }
            b':' => {
                let line = get_line(src)?;
                let integer =
                    parse_i64(line).ok_or_else(|| Error::InvalidInteger(lossy(line)))?;
                Ok(Frame::Integer(integer))
            }
            // $<length>\r\n<data>\r\n
            b'$' => {
                let line = get_line(src)?;
                let length =
                    parse_i64(line).ok_or_else(|| Error::InvalidBulkLength(lossy(line)))?;

                if length == -1 {
                    return Ok(Frame::Null);
                }
                if length < -1 {
                    return Err(Error::NegativeBulkLength(length));
                }
                if length as u64 > limits.max_bulk_len as u64 {
                    return Err(Error::BulkTooLarge {
                        len: length,
                        limit: limits.max_bulk_len,
                    });
                }

                let length = length as usize;
                if src.remaining() < length + CRLF.len() {
                    return Err(Error::Incomplete);
                }

                let start = src.position() as usize;
                let data = &src.get_ref()[start..start + length];
                if &src.get_ref()[start + length..start + length + CRLF.len()] != CRLF {
                    return Err(Error::MissingBulkTerminator);
                }
                let data = Bytes::copy_from_slice(data);
                src.advance(length + CRLF.len());

                Ok(Frame::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            b'*' => {
                let line = get_line(src)?;
                let length =
                    parse_i64(line).ok_or_else(|| Error::InvalidArrayLength(lossy(line)))?;

                if length < 0 {
                    return Err(Error::NegativeArrayLength(length));
                }
                if length as u64 > limits.max_array_len as u64 {
                    return Err(Error::ArrayTooLarge {
                        len: length,
                        limit: limits.max_array_len,
                    });
                }

                let length = length as usize;
                let mut frames = Vec::with_capacity(length.min(MAX_ARRAY_PREALLOC));
                for _ in 0..length {
                    frames.push(Self::parse(src, limits, depth + 1)?);
                }

                Ok(Frame::Array(frames))
            }
            byte => Err(Error::UnknownPrefix(byte)),
        }
    }

    /// Serializes the frame into a new buffer.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut dst = Vec::new();
        self.encode_into(&mut dst)?;
        Ok(dst)
    }

    /// Appends the serialized frame to `dst`.
    ///
    /// Inline strings are validated before anything is written, so `dst` is left untouched when
    /// the frame cannot be encoded.
    pub fn encode_into(&self, dst: &mut Vec<u8>) -> Result<(), EncodeError> {
        self.validate()?;
        self.write_to(dst);
        Ok(())
    }

    fn validate(&self) -> Result<(), EncodeError> {
        match self {
            Frame::Simple(s) | Frame::Error(s) if has_newline(s) => {
                Err(EncodeError::InlineNewline { kind: self.kind() })
            }
            Frame::Array(frames) => frames.iter().try_for_each(Frame::validate),
            _ => Ok(()),
        }
    }

    fn write_to(&self, dst: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Integer(i) => {
                dst.put_u8(b':');
                dst.put_slice(i.to_string().as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Bulk(bytes) => {
                dst.put_u8(b'$');
                dst.put_slice(bytes.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                dst.put_slice(bytes);
                dst.put_slice(CRLF);
            }
            Frame::Array(frames) => {
                dst.put_u8(b'*');
                dst.put_slice(frames.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                for frame in frames {
                    frame.write_to(dst);
                }
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
        }
    }
}

fn has_newline(s: &str) -> bool {
    s.bytes().any(|b| b == b'\r' || b == b'\n')
}

/// Returns the bytes up to the next CRLF and moves the cursor past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let end = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buf[start..end])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

fn parse_i64(line: &[u8]) -> Option<i64> {
    str::from_utf8(line).ok()?.parse::<i64>().ok()
}

// Inline strings are not required to be UTF-8, invalid sequences become U+FFFD.
fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Result<Frame, Error> {
        let mut cursor = Cursor::new(data);
        Frame::parse(&mut cursor, &Limits::default(), 0)
    }

    #[test]
    fn parse_simple_string_frame() {
        let frame = parse(b"+OK\r\n");

        assert!(matches!(frame, Ok(Frame::Simple(ref s)) if s == "OK"));
    }

    #[test]
    fn parse_simple_error_frame() {
        let frame = parse(b"-Error message\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Error(ref s)) if s == "Error message"
        ));
    }

    fn parse_integer_frame(data: &[u8], expected: i64) {
        let frame = parse(data);

        assert!(matches!(frame, Ok(Frame::Integer(i)) if i == expected));
    }

    #[test]
    fn parse_integer_frame_positive() {
        parse_integer_frame(b":1000\r\n", 1000);
    }

    #[test]
    fn parse_integer_frame_negative() {
        parse_integer_frame(b":-1000\r\n", -1000);
    }

    #[test]
    fn parse_integer_frame_zero() {
        parse_integer_frame(b":0\r\n", 0);
    }

    #[test]
    fn parse_integer_frame_positive_signed() {
        parse_integer_frame(b":+1000\r\n", 1000);
    }

    #[test]
    fn parse_bulk_string_frame() {
        let frame = parse(b"$6\r\nfoobar\r\n");

        assert_eq!(frame, Ok(Frame::Bulk(Bytes::from("foobar"))));
    }

    #[test]
    fn parse_bulk_string_frame_binary_payload() {
        let frame = parse(b"$4\r\na\r\nb\r\n");

        assert_eq!(frame, Ok(Frame::Bulk(Bytes::from_static(b"a\r\nb"))));
    }

    #[test]
    fn parse_bulk_string_frame_empty() {
        let frame = parse(b"$0\r\n\r\n");

        assert_eq!(frame, Ok(Frame::Bulk(Bytes::new())));
    }

    #[test]
    fn parse_bulk_string_frame_null() {
        let frame = parse(b"$-1\r\n");

        assert!(matches!(frame, Ok(Frame::Null)));
    }

    #[test]
    fn parse_array_frame_empty() {
        let frame = parse(b"*0\r\n");

        assert!(matches!(frame, Ok(Frame::Array(ref a)) if a.is_empty()));
    }

    #[test]
    fn parse_array_frame_nested() {
        let frame = parse(b"*2\r\n*3\r\n:1\r\n:2\r\n:3\r\n*2\r\n+Hello\r\n-World\r\n");

        assert_eq!(
            frame,
            Ok(Frame::Array(vec![
                Frame::Array(vec![
                    Frame::Integer(1),
                    Frame::Integer(2),
                    Frame::Integer(3)
                ]),
                Frame::Array(vec![
                    Frame::Simple("Hello".to_string()),
                    Frame::Error("World".to_string())
                ]),
            ]))
        );
    }

    #[test]
    fn parse_array_frame_null_in_the_middle() {
        let frame = parse(b"*3\r\n$5\r\nhello\r\n$-1\r\n$5\r\nworld\r\n");

        assert_eq!(
            frame,
            Ok(Frame::Array(vec![
                Frame::Bulk(Bytes::from("hello")),
                Frame::Null,
                Frame::Bulk(Bytes::from("world")),
            ]))
        );
    }

    #[test]
    fn parse_leaves_cursor_after_frame() {
        let data = b"+OK\r\n:1\r\n";
        let mut cursor = Cursor::new(&data[..]);

        Frame::parse(&mut cursor, &Limits::default(), 0).unwrap();

        assert_eq!(cursor.position(), 5);
    }

    #[test]
    fn parse_incomplete() {
        assert_eq!(parse(b""), Err(Error::Incomplete));
        assert_eq!(parse(b"+OK"), Err(Error::Incomplete));
        assert_eq!(parse(b"+OK\r"), Err(Error::Incomplete));
        assert_eq!(parse(b"$5\r\nhel"), Err(Error::Incomplete));
        assert_eq!(parse(b"$5\r\nhello"), Err(Error::Incomplete));
        assert_eq!(parse(b"$5\r\nhello\r"), Err(Error::Incomplete));
        assert_eq!(parse(b"*2\r\n:1\r\n"), Err(Error::Incomplete));
    }

    #[test]
    fn parse_malformed() {
        assert_eq!(parse(b"!oops\r\n"), Err(Error::UnknownPrefix(b'!')));
        assert_eq!(
            parse(b":1x\r\n"),
            Err(Error::InvalidInteger("1x".to_string()))
        );
        assert_eq!(
            parse(b"$x\r\n"),
            Err(Error::InvalidBulkLength("x".to_string()))
        );
        assert_eq!(parse(b"$-2\r\n"), Err(Error::NegativeBulkLength(-2)));
        assert_eq!(parse(b"*-1\r\n"), Err(Error::NegativeArrayLength(-1)));
        assert_eq!(parse(b"$3\r\nfooxx"), Err(Error::MissingBulkTerminator));
    }

    #[test]
    fn parse_non_utf8_inline_string() {
        assert_eq!(
            parse(b"+PI\xffNG\r\n"),
            Ok(Frame::Simple("PI\u{fffd}NG".to_string()))
        );
        assert_eq!(
            parse(b"-\xfe\r\n"),
            Ok(Frame::Error("\u{fffd}".to_string()))
        );
    }

    #[test]
    fn parse_enforces_limits() {
        let limits = Limits {
            max_bulk_len: 4,
            max_array_len: 2,
            max_depth: 1,
        };
        let parse_with = |data: &[u8]| Frame::parse(&mut Cursor::new(data), &limits, 0);

        assert_eq!(
            parse_with(b"$5\r\n"),
            Err(Error::BulkTooLarge { len: 5, limit: 4 })
        );
        assert_eq!(
            parse_with(b"*3\r\n"),
            Err(Error::ArrayTooLarge { len: 3, limit: 2 })
        );
        assert_eq!(
            parse_with(b"*1\r\n*1\r\n:1\r\n"),
            Err(Error::MaxDepthExceeded(1))
        );
        assert_eq!(
            parse_with(b"*1\r\n*0\r\n"),
            Ok(Frame::Array(vec![Frame::Array(vec![])]))
        );
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            Error::UnknownPrefix(b'!').to_string(),
            "unknown RESP2 prefix byte '!'"
        );
        assert_eq!(
            Error::UnknownPrefix(b'\n').to_string(),
            "unknown RESP2 prefix byte '\\n'"
        );
        assert!(Error::NegativeBulkLength(-2).to_string().contains("negative"));
        assert!(Error::NegativeArrayLength(-2)
            .to_string()
            .contains("negative"));
        assert_eq!(
            Error::InvalidInteger("1\r2".to_string()).to_string(),
            "invalid integer \"1\\r2\""
        );
    }

    #[test]
    fn encode_table() {
        let cases = vec![
            (Frame::Simple("OK".to_string()), "+OK\r\n"),
            (Frame::Error("ERR fail".to_string()), "-ERR fail\r\n"),
            (Frame::Integer(-2), ":-2\r\n"),
            (Frame::Bulk(Bytes::from("foo")), "$3\r\nfoo\r\n"),
            (Frame::Bulk(Bytes::new()), "$0\r\n\r\n"),
            (Frame::Null, "$-1\r\n"),
            (Frame::Array(vec![]), "*0\r\n"),
            (
                Frame::Array(vec![
                    Frame::Bulk(Bytes::from("PING")),
                    Frame::Bulk(Bytes::from("x")),
                ]),
                "*2\r\n$4\r\nPING\r\n$1\r\nx\r\n",
            ),
        ];

        for (frame, expected) in cases {
            assert_eq!(
                frame.encode().unwrap(),
                expected.as_bytes(),
                "encoding {:?}",
                frame
            );
        }
    }

    #[test]
    fn encode_rejects_inline_newline() {
        let err = Frame::Simple("bad\r\nvalue".to_string()).encode();
        assert_eq!(
            err,
            Err(EncodeError::InlineNewline {
                kind: "simple_string"
            })
        );

        let err = Frame::Error("bad\nvalue".to_string()).encode();
        assert_eq!(err, Err(EncodeError::InlineNewline { kind: "error" }));
    }

    #[test]
    fn encode_into_leaves_buffer_untouched_on_failure() {
        let mut dst = b"+PONG\r\n".to_vec();
        let frame = Frame::Array(vec![
            Frame::Integer(1),
            Frame::Array(vec![Frame::Simple("a\rb".to_string())]),
        ]);

        assert!(frame.encode_into(&mut dst).is_err());
        assert_eq!(dst, b"+PONG\r\n");
    }

    #[test]
    fn encode_bulk_allows_newlines() {
        let frame = Frame::Bulk(Bytes::from("a\r\nb"));

        assert_eq!(frame.encode().unwrap(), b"$4\r\na\r\nb\r\n");
    }

    #[test]
    fn kind_names() {
        assert_eq!(Frame::Simple(String::new()).kind(), "simple_string");
        assert_eq!(Frame::Error(String::new()).kind(), "error");
        assert_eq!(Frame::Integer(0).kind(), "integer");
        assert_eq!(Frame::Bulk(Bytes::new()).kind(), "bulk_string");
        assert_eq!(Frame::Array(vec![]).kind(), "array");
        assert_eq!(Frame::Null.kind(), "null");
    }
}
