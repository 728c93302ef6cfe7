//! Value codec: tagged attribute values to plain JSON
//!
//! - binary becomes base64 text, matching what the AWS CLI prints
//! - sets become lists in the order the store returned them
//! - numbers stay exact decimals; anything that would need rounding is an error

use crate::error::{DynamoError, Result};
use crate::types::{AttributeValue, Item};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bigdecimal::{BigDecimal, Zero};
use serde_json::{Map, Number, Value};
use std::str::FromStr;

/// Maximum significant digits of a number value
pub const MAX_PRECISION: u64 = 100;

/// Smallest adjusted exponent of a number value
pub const MIN_EXPONENT: i64 = -128;

/// Largest adjusted exponent of a number value
pub const MAX_EXPONENT: i64 = 126;

/// Decode a full item into a JSON object
pub fn decode_item(item: &Item) -> Result<Value> {
    let mut out = Map::with_capacity(item.len());
    for (name, value) in item {
        out.insert(name.clone(), decode(value)?);
    }
    Ok(Value::Object(out))
}

/// Decode one tagged value
pub fn decode(value: &AttributeValue) -> Result<Value> {
    Ok(match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => decode_number(n)?,
        AttributeValue::B(bytes) => Value::String(STANDARD.encode(bytes)),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(items) => Value::Array(items.iter().map(decode).collect::<Result<_>>()?),
        AttributeValue::M(map) => {
            let mut out = Map::with_capacity(map.len());
            for (name, member) in map {
                out.insert(name.clone(), decode(member)?);
            }
            Value::Object(out)
        }
        AttributeValue::Ss(strings) => {
            Value::Array(strings.iter().cloned().map(Value::String).collect())
        }
        AttributeValue::Ns(numbers) => Value::Array(
            numbers
                .iter()
                .map(|n| decode_number(n))
                .collect::<Result<_>>()?,
        ),
        AttributeValue::Bs(sets) => Value::Array(
            sets.iter()
                .map(|bytes| Value::String(STANDARD.encode(bytes)))
                .collect(),
        ),
    })
}

/// Parse a raw JSON value in wire format and decode it
pub fn decode_json(raw: &Value) -> Result<Value> {
    let value: AttributeValue = serde_json::from_value(raw.clone())
        .map_err(|e| DynamoError::malformed(format!("{raw}: {e}")))?;
    decode(&value)
}

/// Decode a number, rejecting values that do not fit the decimal context
pub fn decode_number(text: &str) -> Result<Value> {
    let decimal = parse_decimal(text)?;
    Number::from_str(&decimal.to_string())
        .map(Value::Number)
        .map_err(|e| DynamoError::Decimal {
            value: text.to_string(),
            reason: e.to_string(),
        })
}

/// Parse and range-check a decimal
pub fn parse_decimal(text: &str) -> Result<BigDecimal> {
    let invalid = |reason: String| DynamoError::Decimal {
        value: text.to_string(),
        reason,
    };

    let decimal = BigDecimal::from_str(text.trim())
        .map_err(|e| invalid(format!("not a decimal number ({e})")))?;
    if decimal.is_zero() {
        return Ok(decimal);
    }

    let normalized = decimal.normalized();
    let digits = normalized.digits();
    if digits > MAX_PRECISION {
        return Err(invalid(format!(
            "{digits} significant digits exceeds the maximum of {MAX_PRECISION}"
        )));
    }

    let (_, scale) = normalized.as_bigint_and_exponent();
    let adjusted = digits as i64 - 1 - scale;
    if !(MIN_EXPONENT..=MAX_EXPONENT).contains(&adjusted) {
        return Err(invalid(format!(
            "exponent {adjusted} outside [{MIN_EXPONENT}, {MAX_EXPONENT}]"
        )));
    }

    Ok(decimal)
}

/// Encode plain JSON into tagged values (no binary or set detection)
pub fn encode(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(encode).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(name, member)| (name.clone(), encode(member)))
                .collect(),
        ),
    }
}

/// Encode a JSON object into an item; non-objects yield an empty item
pub fn encode_item(value: &Value) -> Item {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(name, member)| (name.clone(), encode(member)))
            .collect(),
        _ => Item::new(),
    }
}
