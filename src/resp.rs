//! RESP value type and the incremental reply parser.

use bstr::ByteSlice;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<Value>>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SimpleString(s) => write!(f, "simple({:?})", s.as_bstr()),
            Self::Error(s) => write!(f, "error({:?})", s.as_bstr()),
            Self::Integer(i) => write!(f, "int({i})"),
            Self::BulkString(None) => write!(f, "bulk(null)"),
            Self::BulkString(Some(s)) => write!(f, "bulk({:?})", s.as_bstr()),
            Self::Array(None) => write!(f, "array(null)"),
            Self::Array(Some(items)) => {
                f.write_str("array(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item:?}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl Value {
    pub const fn ok() -> Self {
        Self::SimpleString(Bytes::from_static(b"OK"))
    }

    pub fn bulk(bytes: impl Into<Bytes>) -> Self {
        Self::BulkString(Some(bytes.into()))
    }

    pub(crate) fn array_head(&self) -> Option<(&[Value], &[u8])> {
        let Self::Array(Some(items)) = self else {
            return None;
        };
        let Some(Self::BulkString(Some(head))) = items.first() else {
            return None;
        };
        Some((items, head))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::BulkString(Some(b)) | Self::SimpleString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

enum ParsedUnit {
    Value(Value),
    ArrayHeader(i64),
}

struct PendingArray {
    remaining: usize,
    items: Vec<Value>,
}

/// Once poisoned by a malformed byte, every later `try_next` keeps erroring.
#[derive(Default)]
pub struct RespParser {
    buf: BytesMut,
    stack: Vec<PendingArray>,
    poison: Option<String>,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn try_next(&mut self) -> Result<Option<Value>, crate::error::Error> {
        if let Some(msg) = &self.poison {
            return Err(crate::error::Error::Protocol(msg.clone()));
        }
        match self.try_next_inner() {
            Ok(value) => Ok(value),
            Err(msg) => {
                self.poison = Some(msg.clone());
                Err(crate::error::Error::Protocol(msg))
            }
        }
    }

    fn try_next_inner(&mut self) -> Result<Option<Value>, String> {
        loop {
            let Some(unit) = self.parse_one()? else {
                return Ok(None);
            };
            let value = match unit {
                ParsedUnit::Value(value) => value,
                ParsedUnit::ArrayHeader(len) => {
                    if len < 0 {
                        Value::Array(None)
                    } else {
                        let len = len as usize;
                        self.stack.push(PendingArray {
                            remaining: len,
                            items: Vec::with_capacity(len.min(4096)),
                        });
                        continue;
                    }
                }
            };
            if let Some(value) = self.complete_with(value) {
                return Ok(Some(value));
            }
        }
    }

    fn complete_with(&mut self, mut value: Value) -> Option<Value> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Some(value);
            };
            frame.items.push(value);
            if frame.items.len() < frame.remaining {
                return None;
            }
            let frame = self.stack.pop().unwrap();
            value = Value::Array(Some(frame.items));
        }
    }

    fn parse_one(&mut self) -> Result<Option<ParsedUnit>, String> {
        let Some(&prefix) = self.buf.first() else {
            return Ok(None);
        };
        if !matches!(prefix, b'+' | b'-' | b':' | b'*' | b'$') {
            return Err(format!("unknown type prefix {:?}", prefix as char));
        }
        let Some(end) = find_crlf(&self.buf) else {
            return Ok(None);
        };
        let line = &self.buf[1..end];
        match prefix {
            b'+' => {
                let value = Value::SimpleString(Bytes::copy_from_slice(line));
                self.buf.advance(end + 2);
                Ok(Some(ParsedUnit::Value(value)))
            }
            b'-' => {
                let value = Value::Error(Bytes::copy_from_slice(line));
                self.buf.advance(end + 2);
                Ok(Some(ParsedUnit::Value(value)))
            }
            b':' => {
                let i = parse_i64(line).ok_or("invalid integer")?;
                self.buf.advance(end + 2);
                Ok(Some(ParsedUnit::Value(Value::Integer(i))))
            }
            b'*' => {
                let len = parse_i64(line).ok_or("invalid multibulk length")?;
                self.buf.advance(end + 2);
                Ok(Some(ParsedUnit::ArrayHeader(len)))
            }
            b'$' => {
                let len = parse_i64(line).ok_or("invalid bulk length")?;
                let header_len = end + 2;
                if len < 0 {
                    self.buf.advance(header_len);
                    return Ok(Some(ParsedUnit::Value(Value::BulkString(None))));
                }
                let len = len as usize;
                if self.buf.len() < header_len + len + 2 {
                    return Ok(None);
                }
                self.buf.advance(header_len);
                let data = self.buf.split_to(len).freeze();
                if &self.buf[..2] != b"\r\n" {
                    return Err("missing CRLF after bulk string".to_owned());
                }
                self.buf.advance(2);
                Ok(Some(ParsedUnit::Value(Value::BulkString(Some(data)))))
            }
            _ => unreachable!("prefix checked above"),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    let pos = buf.find_byte(b'\r')?;
    if pos + 1 < buf.len() && buf[pos + 1] == b'\n' {
        Some(pos)
    } else {
        None
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

pub fn encode_command(args: &[Bytes], dst: &mut BytesMut) {
    dst.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}
