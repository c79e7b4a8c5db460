// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row values and their canonical, versioned wire form.
//!
//! Rows travel between replicas (and sit in the oplog) as a JSON envelope:
//!
//! ```text
//! {"v":1,"cols":{"id":{"t":"int","v":1},"name":{"t":"text","v":"a"}}}
//! ```
//!
//! Every value carries its type so integers and reals never blur, and blobs
//! are hex encoded. Decoding rejects envelopes from an unknown version.
//!
//! # Example
//!
//! ```
//! use satellite::codec::{encode_row, decode_row, Row, SqlValue};
//!
//! let mut row = Row::new();
//! row.insert("id".into(), SqlValue::Integer(1));
//! row.insert("ratio".into(), SqlValue::Real(0.1));
//! row.insert("raw".into(), SqlValue::Blob(vec![0xde, 0xad]));
//!
//! let encoded = encode_row(&row).unwrap();
//! assert_eq!(decode_row(&encoded).unwrap(), row);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Current envelope version written by [`encode_row`].
pub const CODEC_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported row codec version {0}")]
    UnsupportedVersion(u32),
    #[error("column '{column}' holds a non-finite real, which cannot be stored")]
    NonFiniteReal { column: String },
    #[error("column '{column}' holds an invalid blob: {reason}")]
    InvalidBlob { column: String, reason: String },
    #[error("malformed row envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single column value as the embedded database stores it.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Column name to value. Ordered so serialization is deterministic.
pub type Row = BTreeMap<String, SqlValue>;

impl SqlValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Plain JSON rendering used for canonical keys and debugging.
    ///
    /// Unlike the tagged codec form this loses the integer/real distinction
    /// for whole-valued reals, so it is only used where values are compared
    /// for identity within one schema. Blobs render as `{"$blob": hex}` so
    /// they never collide with text.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Integer(i) => Value::from(*i),
            Self::Real(r) => serde_json::Number::from_f64(*r)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::Blob(b) => serde_json::json!({ "$blob": hex::encode(b) }),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
            Self::Text(s) => write!(f, "'{}'", s),
            Self::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
enum WireValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    cols: BTreeMap<String, WireValue>,
}

/// Encode a row into the versioned envelope.
pub fn encode_row(row: &Row) -> Result<String, CodecError> {
    let mut cols = BTreeMap::new();
    for (column, value) in row {
        let wire = match value {
            SqlValue::Null => WireValue::Null,
            SqlValue::Integer(i) => WireValue::Int(*i),
            SqlValue::Real(r) if !r.is_finite() => {
                return Err(CodecError::NonFiniteReal {
                    column: column.clone(),
                })
            }
            SqlValue::Real(r) => WireValue::Real(*r),
            SqlValue::Text(s) => WireValue::Text(s.clone()),
            SqlValue::Blob(b) => WireValue::Blob(hex::encode(b)),
        };
        cols.insert(column.clone(), wire);
    }

    Ok(serde_json::to_string(&Envelope {
        v: CODEC_VERSION,
        cols,
    })?)
}

/// Decode an envelope produced by [`encode_row`].
pub fn decode_row(encoded: &str) -> Result<Row, CodecError> {
    let envelope: Envelope = serde_json::from_str(encoded)?;
    if envelope.v != CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.v));
    }

    envelope
        .cols
        .into_iter()
        .map(|(column, wire)| {
            let value = match wire {
                WireValue::Null => SqlValue::Null,
                WireValue::Int(i) => SqlValue::Integer(i),
                WireValue::Real(r) => SqlValue::Real(r),
                WireValue::Text(s) => SqlValue::Text(s),
                WireValue::Blob(h) => SqlValue::Blob(hex::decode(&h).map_err(|e| {
                    CodecError::InvalidBlob {
                        column: column.clone(),
                        reason: e.to_string(),
                    }
                })?),
            };
            Ok((column, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[(&str, SqlValue)]) -> Row {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_round_trip_all_types() {
        let original = row(&[
            ("n", SqlValue::Null),
            ("i", SqlValue::Integer(i64::MIN)),
            ("r", SqlValue::Real(-1.5e-300)),
            ("t", SqlValue::Text("héllo \"quoted\"".into())),
            ("b", SqlValue::Blob(vec![0, 1, 254, 255])),
        ]);
        let encoded = encode_row(&original).unwrap();
        assert_eq!(decode_row(&encoded).unwrap(), original);
    }

    #[test]
    fn test_whole_real_stays_real() {
        let original = row(&[("r", SqlValue::Real(2.0))]);
        let decoded = decode_row(&encode_row(&original).unwrap()).unwrap();
        assert_eq!(decoded["r"], SqlValue::Real(2.0));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = row(&[("b", SqlValue::Integer(2)), ("a", SqlValue::Integer(1))]);
        let b = row(&[("a", SqlValue::Integer(1)), ("b", SqlValue::Integer(2))]);
        assert_eq!(encode_row(&a).unwrap(), encode_row(&b).unwrap());
    }

    #[test]
    fn test_rejects_non_finite_real() {
        let bad = row(&[("r", SqlValue::Real(f64::NAN))]);
        assert!(matches!(
            encode_row(&bad),
            Err(CodecError::NonFiniteReal { column }) if column == "r"
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let err = decode_row(r#"{"v":99,"cols":{}}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(99)));
    }

    #[test]
    fn test_rejects_bad_blob() {
        let err = decode_row(r#"{"v":1,"cols":{"b":{"t":"blob","v":"zz"}}}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBlob { .. }));
    }

    #[test]
    fn test_empty_row() {
        let encoded = encode_row(&Row::new()).unwrap();
        assert!(decode_row(&encoded).unwrap().is_empty());
    }
}
