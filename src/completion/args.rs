//! Lenient argument deserializers for tool calls
//!
//! Model output is untrusted. Integer fields may arrive as doubles (`2024.0`)
//! or strings (`"2024"`), quarters as `"Q3"`, `"3"` or `3`. These helpers
//! normalise that at the trust boundary; entries that still do not parse are
//! dropped from lists rather than failing the whole call.

use crate::models::Quarter;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeSet;

pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn value_to_quarter(value: &Value) -> Option<Quarter> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(_) => value_to_i64(value).and_then(|n| n.to_string().parse().ok()),
        _ => None,
    }
}

pub fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_to_i64(&value).ok_or_else(|| D::Error::custom(format!("expected integer, got {}", value)))
}

pub fn lenient_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    let n = lenient_i64(deserializer)?;
    i32::try_from(n).map_err(|_| D::Error::custom(format!("integer out of range: {}", n)))
}

pub fn lenient_i64_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items.iter().filter_map(value_to_i64).collect(),
        Value::Null => Vec::new(),
        single => value_to_i64(&single).into_iter().collect(),
    })
}

pub fn lenient_quarters<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeSet<Quarter>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items.iter().filter_map(value_to_quarter).collect(),
        Value::Null => BTreeSet::new(),
        single => value_to_quarter(&single).into_iter().collect(),
    })
}

pub fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(D::Error::custom(format!("expected boolean, got {}", value))),
        },
        Value::Number(_) => value_to_i64(&value)
            .map(|n| n != 0)
            .ok_or_else(|| D::Error::custom(format!("expected boolean, got {}", value))),
        _ => Err(D::Error::custom(format!("expected boolean, got {}", value))),
    }
}
