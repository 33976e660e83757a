//! Bencode decoding (BEP-3).
//!
//! Only what tracker response parsing needs: a borrowing-free [`Value`] tree,
//! a strict decoder, and a small encoder used to build replies in tests.
//! Torrent metainfo parsing is the host's concern and not handled here.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid byte {byte:#04x} at offset {offset}")]
    InvalidByte { byte: u8, offset: usize },

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidLength,

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    TooDeep,
}

/// A decoded bencode value.
///
/// Dictionary keys are raw byte strings ordered as bencode requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

const MAX_DEPTH: usize = 32;

/// Decodes a complete bencode value, rejecting trailing bytes.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.parse(0)?;

    if parser.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) -> Result<u8, BencodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn parse(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }

        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(depth),
            b'd' => self.parse_dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?)),
            byte => Err(BencodeError::InvalidByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn parse_integer(&mut self) -> Result<Value, BencodeError> {
        self.bump()?; // 'i'

        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }

        let digits = &self.data[start..self.pos];
        self.bump()?; // 'e'

        let s = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;

        // "i-0e" and leading zeros are invalid per BEP-3.
        if s.is_empty()
            || s == "-"
            || (s.len() > 1 && (s.starts_with('0') || s.starts_with("-0")))
        {
            return Err(BencodeError::InvalidInteger);
        }

        s.parse().map(Value::Integer).map_err(|_| BencodeError::InvalidInteger)
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::InvalidLength);
            }
            self.pos += 1;
        }

        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;

        self.bump()?; // ':'

        if self.data.len() - self.pos < len {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?; // 'l'

        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse(depth + 1)?);
        }
        self.bump()?; // 'e'

        Ok(Value::List(items))
    }

    fn parse_dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?; // 'd'

        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.parse_bytes()?;
            let value = self.parse(depth + 1)?;
            dict.insert(key, value);
        }
        self.bump()?; // 'e'

        Ok(Value::Dict(dict))
    }
}

/// Encodes a value back to bencode. Used by tests to fabricate tracker replies.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, val) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}
