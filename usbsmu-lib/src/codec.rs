//! Conversion between device JSON payloads and exact decimals.
//!
//! The web server reports entities as JSON objects, e.g.
//! `{"id":"sensor-usbsmu_meas_voltage","value":5.0021,"state":"5.0021 V"}`.
//! Calibration numbers are read from `value`, sensor displays from the first
//! whitespace-separated token of `state`. Values never go through `f64`
//! arithmetic; numbers are re-parsed from their JSON text.

use crate::error::{Result, SmuError};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::str::FromStr;

/// Parse a single numeric token into an exact decimal.
///
/// Accepts plain (`-0.125`) and scientific (`1.5e-3`) notation.
pub fn parse_decimal(token: &str) -> Result<Decimal> {
    let token = token.trim();
    Decimal::from_str_exact(token)
        .or_else(|_| Decimal::from_scientific(token))
        .map_err(|e| SmuError::decode(format!("'{token}' is not a decimal number: {e}")))
}

/// Text sent as the `value` query parameter of a `number` write.
pub fn encode_decimal(value: Decimal) -> String {
    value.to_string()
}

fn parse_object(body: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| SmuError::decode(format!("response is not JSON: {e}")))?;
    if !value.is_object() {
        return Err(SmuError::decode("response is not a JSON object"));
    }
    Ok(value)
}

fn field<'a>(object: &'a Value, name: &str) -> Result<&'a Value> {
    object
        .get(name)
        .ok_or_else(|| SmuError::decode(format!("response has no '{name}' field")))
}

/// Decode the `value` field of a response, used for `number` entities.
pub fn decode_value(body: &str) -> Result<Decimal> {
    let object = parse_object(body)?;
    match field(&object, "value")? {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s),
        other => Err(SmuError::decode(format!("'value' field is not numeric: {other}"))),
    }
}

/// Decode the `state` field of a response, dropping any unit suffix.
///
/// `"5.000 V"` and `"5v"` both decode to `5`.
pub fn decode_state(body: &str) -> Result<Decimal> {
    let object = parse_object(body)?;
    let state = match field(&object, "state")? {
        Value::String(s) => s.as_str(),
        other => return Err(SmuError::decode(format!("'state' field is not a string: {other}"))),
    };
    let token = state
        .split_whitespace()
        .next()
        .ok_or_else(|| SmuError::decode("'state' field is empty"))?;
    let number = token.trim_end_matches(|c: char| c.is_alphabetic() || c == '%' || c == '°');
    if number.is_empty() {
        return Err(SmuError::decode(format!("'state' field has no reading: '{state}'")));
    }
    parse_decimal(number)
}

/// Decode a textual entity, preferring `value` and falling back to `state`.
pub fn decode_text(body: &str) -> Result<String> {
    let object = parse_object(body)?;
    match object.get("value").or_else(|| object.get("state")) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(SmuError::decode(format!("text field is not a string: {other}"))),
        None => Err(SmuError::decode("response has neither 'value' nor 'state'")),
    }
}

/// Parse a non-negative integral token such as a sample cursor or timestamp.
///
/// The firmware prints integers, but `"25.0"` is tolerated.
pub fn parse_integral(token: &str) -> Result<u64> {
    let token = token.trim();
    if let Ok(n) = token.parse::<u64>() {
        return Ok(n);
    }
    let d = Decimal::from_str(token).map_err(|_| SmuError::decode(format!("'{token}' is not an integer")))?;
    if d.is_sign_negative() || !d.fract().is_zero() {
        return Err(SmuError::decode(format!("'{token}' is not a non-negative integer")));
    }
    d.to_u64()
        .ok_or_else(|| SmuError::decode(format!("'{token}' is out of range")))
}
