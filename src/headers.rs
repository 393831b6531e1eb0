//! Typed access to AMQP header tables and declaration arguments.
//!
//! Retry state travels with the message itself (`repeat_number` written by
//! the repeat policy, `x-death` written by the broker when it dead-letters).
//! Readers coerce whatever integer or numeric-string representation they
//! find; anything missing or malformed counts as "no prior attempts".

use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the number of repeats already scheduled by the repeat policy.
pub const REPEAT_NUMBER: &str = "repeat_number";
/// Header the broker appends to on every dead-lettering.
pub const X_DEATH: &str = "x-death";
pub const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue-level message TTL in milliseconds.
pub const X_MESSAGE_TTL: &str = "x-message-ttl";

/// A scalar declaration argument as it appears in YAML or the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ArgValue {
    fn to_amqp(&self) -> AMQPValue {
        match self {
            ArgValue::Bool(b) => AMQPValue::Boolean(*b),
            ArgValue::Int(i) => match i32::try_from(*i) {
                Ok(small) => AMQPValue::LongInt(small),
                Err(_) => AMQPValue::LongLongInt(*i),
            },
            ArgValue::Float(f) => AMQPValue::Double(*f),
            ArgValue::Str(s) => AMQPValue::LongString(s.clone().into()),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Str(s)
    }
}

impl From<i64> for ArgValue {
    fn from(i: i64) -> Self {
        ArgValue::Int(i)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Bool(b)
    }
}

/// Declaration arguments keyed by name.
pub type Arguments = BTreeMap<String, ArgValue>;

/// Converts declaration arguments into an AMQP field table.
pub fn field_table(args: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(ShortString::from(key.as_str()), value.to_amqp());
    }
    table
}

/// Coerces an integer-like header value.
pub fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::ShortString(s) => s.as_str().trim().parse().ok(),
        AMQPValue::LongString(s) => s.to_string().trim().parse().ok(),
        _ => None,
    }
}

fn non_negative(value: Option<i64>) -> u32 {
    value
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or_default()
}

/// Reads `repeat_number`, defaulting to 0 when absent or not a number.
pub fn repeat_number(headers: Option<&FieldTable>) -> u32 {
    non_negative(headers.and_then(|h| h.inner().get(REPEAT_NUMBER)).and_then(as_i64))
}

/// Reads the `count` of the last `x-death` entry, defaulting to 0.
pub fn death_count(headers: Option<&FieldTable>) -> u32 {
    let last = match headers.and_then(|h| h.inner().get(X_DEATH)) {
        Some(AMQPValue::FieldArray(entries)) => entries
            .as_slice()
            .iter()
            .filter_map(|entry| match entry {
                AMQPValue::FieldTable(table) => Some(table),
                _ => None,
            })
            .last(),
        _ => None,
    };
    non_negative(last.and_then(|table| table.inner().get("count")).and_then(as_i64))
}

/// Returns a copy of `headers` with `key` set to `value`.
pub fn with_header(headers: Option<&FieldTable>, key: &str, value: AMQPValue) -> FieldTable {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert(ShortString::from(key), value);
    table
}

/// Returns a copy of `headers` without `key`.
pub fn without_header(headers: Option<&FieldTable>, key: &str) -> FieldTable {
    let mut inner: BTreeMap<ShortString, AMQPValue> =
        headers.map(|h| h.inner().clone()).unwrap_or_default();
    inner.remove(key);
    FieldTable::from(inner)
}
