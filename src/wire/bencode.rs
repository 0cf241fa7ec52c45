// Bencode value codec with size and nesting guards.
//
// Grammar: integers `i<digits>e`, byte strings `<len>:<bytes>`,
// lists `l...e`, dictionaries `d<key><value>...e` with byte-string keys.
// Encoding always emits dictionary keys in sorted order; decoding accepts
// any order.

use std::collections::BTreeMap;

use super::WireError;

/// Maximum nesting depth accepted while decoding.
const MAX_DEPTH: usize = 8;

/// Maximum single byte-string length: 16 MiB.
/// Pairing payloads are tiny; this bound only exists to keep a malformed
/// length prefix from looking like an allocation request.
const MAX_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Encode a value to its canonical byte form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            // BTreeMap iterates in key order, which is the canonical order
            out.push(b'd');
            for (key, item) in entries {
                encode_into(&Value::Bytes(key.clone()), out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode a single value; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value, WireError> {
    let (value, rest) = decode_partial(input, 0)?;
    if !rest.is_empty() {
        return Err(WireError::Malformed("trailing bytes after value"));
    }
    Ok(value)
}

fn decode_partial(input: &[u8], depth: usize) -> Result<(Value, &[u8]), WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::Malformed("nesting too deep"));
    }
    match input.first() {
        None => Err(WireError::Malformed("unexpected end of input")),
        Some(b'i') => decode_int(&input[1..]),
        Some(b'l') => {
            let mut rest = &input[1..];
            let mut items = Vec::new();
            loop {
                if rest.first() == Some(&b'e') {
                    return Ok((Value::List(items), &rest[1..]));
                }
                let (item, remaining) = decode_partial(rest, depth + 1)?;
                items.push(item);
                rest = remaining;
            }
        }
        Some(b'd') => {
            let mut rest = &input[1..];
            let mut entries = BTreeMap::new();
            loop {
                if rest.first() == Some(&b'e') {
                    return Ok((Value::Dict(entries), &rest[1..]));
                }
                let (key, remaining) = decode_bytes(rest)?;
                let (item, remaining) = decode_partial(remaining, depth + 1)?;
                entries.insert(key, item);
                rest = remaining;
            }
        }
        Some(c) if c.is_ascii_digit() => {
            let (bytes, rest) = decode_bytes(input)?;
            Ok((Value::Bytes(bytes), rest))
        }
        Some(_) => Err(WireError::Malformed("unexpected byte")),
    }
}

fn decode_int(input: &[u8]) -> Result<(Value, &[u8]), WireError> {
    let end = input
        .iter()
        .position(|&b| b == b'e')
        .ok_or(WireError::Malformed("unterminated integer"))?;
    let digits =
        std::str::from_utf8(&input[..end]).map_err(|_| WireError::Malformed("bad integer"))?;
    if digits.is_empty() || digits == "-" {
        return Err(WireError::Malformed("empty integer"));
    }
    // Reject leading zeros / "-0": there is exactly one encoding per number
    if (digits.len() > 1 && digits.starts_with('0'))
        || (digits.len() > 2 && digits.starts_with("-0"))
        || digits == "-0"
    {
        return Err(WireError::Malformed("non-canonical integer"));
    }
    let value: i64 = digits.parse().map_err(|_| WireError::Malformed("bad integer"))?;
    Ok((Value::Int(value), &input[end + 1..]))
}

fn decode_bytes(input: &[u8]) -> Result<(Vec<u8>, &[u8]), WireError> {
    let sep = input
        .iter()
        .position(|&b| b == b':')
        .ok_or(WireError::Malformed("missing string length separator"))?;
    let digits =
        std::str::from_utf8(&input[..sep]).map_err(|_| WireError::Malformed("bad string length"))?;
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return Err(WireError::Malformed("bad string length"));
    }
    let len: usize = digits
        .parse()
        .map_err(|_| WireError::Malformed("bad string length"))?;
    if len > MAX_BYTES {
        return Err(WireError::Malformed("string too long"));
    }
    let start = sep + 1;
    if input.len() < start + len {
        return Err(WireError::Malformed("truncated string"));
    }
    Ok((input[start..start + len].to_vec(), &input[start + len..]))
}
