//! Opaque bytes codec boundary.
//!
//! The core treats serialization as a black box (`spec.md` §1, §9): a
//! narrow `encode`/`decode` interface over a restricted value domain
//! (primitives, ordered sequences, named maps, byte strings), rather than
//! relying on general-purpose object serialization. [`Value`] is that
//! restricted domain; [`Codec`] is the trait backends code against.
//!
//! The concrete wire format (`msgpack` via `rmp-serde`, or `json` via
//! `serde_json`) is itself an external collaborator choice — both are
//! provided and selected by `Config::serialization_backend`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{NuvomError, Result};

/// A value in the restricted domain the codec can move across the wire.
///
/// Mirrors the primitive/sequence/map/bytes domain named in `spec.md` §9,
/// layered over `serde_json::Value` so task args/kwargs/results can carry
/// arbitrary JSON-representable data without the core depending on a
/// specific serialization crate's type system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    #[serde(with = "serde_bytes")]
    Bytes(Vec<u8>),
    Map(BTreeMap<String, Value>),
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(a) => Value::Seq(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s),
            Value::Bytes(b) => {
                serde_json::Value::Array(b.into_iter().map(|x| x.into()).collect())
            }
            Value::Seq(s) => serde_json::Value::Array(s.into_iter().map(Into::into).collect()),
            Value::Map(m) => {
                serde_json::Value::Object(m.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Which wire format a codec call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    MsgPack,
    Json,
}

impl CodecKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "json" => CodecKind::Json,
            _ => CodecKind::MsgPack,
        }
    }

    /// File extension used for on-disk artifacts (queue entries, meta files).
    pub fn ext(&self) -> &'static str {
        match self {
            CodecKind::MsgPack => "msgpack",
            CodecKind::Json => "json",
        }
    }
}

/// Encode a serializable value to opaque bytes.
pub fn encode<T: Serialize>(kind: CodecKind, value: &T) -> Result<Vec<u8>> {
    match kind {
        CodecKind::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
        CodecKind::Json => Ok(serde_json::to_vec(value)?),
    }
}

/// Decode opaque bytes back into a value. A decode failure here is the
/// `DecodeCorruption` error kind at the queue/result-backend boundary.
pub fn decode<T: for<'de> Deserialize<'de>>(kind: CodecKind, bytes: &[u8]) -> Result<T> {
    match kind {
        CodecKind::MsgPack => rmp_serde::from_slice(bytes).map_err(NuvomError::from),
        CodecKind::Json => serde_json::from_slice(bytes).map_err(NuvomError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_msgpack() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), Value::Int(1));
        m.insert("b".to_string(), Value::Str("hi".into()));
        let v = Value::Seq(vec![Value::Bool(true), Value::Map(m)]);

        let bytes = encode(CodecKind::MsgPack, &v).unwrap();
        let back: Value = decode(CodecKind::MsgPack, &bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn round_trip_json() {
        let v = Value::Seq(vec![Value::Int(42), Value::Null]);
        let bytes = encode(CodecKind::Json, &v).unwrap();
        let back: Value = decode(CodecKind::Json, &bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn round_trip_plain_int_sequence() {
        let v = Value::Seq(vec![Value::Int(1), Value::Int(2)]);

        let msgpack = encode(CodecKind::MsgPack, &v).unwrap();
        let back: Value = decode(CodecKind::MsgPack, &msgpack).unwrap();
        assert_eq!(v, back);

        let json = encode(CodecKind::Json, &v).unwrap();
        let back: Value = decode(CodecKind::Json, &json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn decode_corruption_surfaces_error() {
        let garbage = vec![0xff, 0x00, 0x13, 0x37];
        let result: Result<Value> = decode(CodecKind::MsgPack, &garbage);
        assert!(result.is_err());
    }
}
