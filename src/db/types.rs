//! Driver-independent type mappings.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies a PostgreSQL column type into a logical category
//! 2. Driver-specific decoders (in each backend's row module) extract the value
//!
//! This keeps the classification in one place while the wire and sql
//! backends read values through their own row types. NUMERIC travels as an
//! exact decimal string in both directions.

use crate::models::Value;
use serde_json::Value as JsonValue;
use std::fmt::Write as _;

/// Logical category for PostgreSQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Classify a PostgreSQL type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    match type_name.to_lowercase().as_str() {
        "int2" | "smallint" | "smallserial" => TypeCategory::SmallInt,
        "int4" | "int" | "integer" | "serial" => TypeCategory::Integer,
        "int8" | "bigint" | "bigserial" => TypeCategory::BigInt,
        "float4" | "real" => TypeCategory::Real,
        "float8" | "double precision" => TypeCategory::Double,
        "numeric" | "decimal" => TypeCategory::Decimal,
        "bool" | "boolean" => TypeCategory::Boolean,
        "text" | "varchar" | "character varying" | "bpchar" | "char" | "character" | "name"
        | "citext" => TypeCategory::Text,
        "bytea" => TypeCategory::Binary,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "timestamp" | "timestamp without time zone" => TypeCategory::Timestamp,
        "timestamptz" | "timestamp with time zone" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" | "time without time zone" => TypeCategory::Time,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// NUMERIC Support
// =============================================================================

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render a binary-format NUMERIC as its exact decimal string.
///
/// Layout: ndigits, weight, sign, dscale (all 16-bit big endian), followed
/// by `ndigits` base-10000 digits.
pub fn decode_numeric(raw: &[u8]) -> Result<String, String> {
    if raw.len() < 8 {
        return Err(format!("numeric value too short ({} bytes)", raw.len()));
    }
    let read_u16 = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
    let ndigits = read_u16(0) as usize;
    let weight = i32::from(read_u16(2) as i16);
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid numeric sign 0x{other:04X}")),
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err(format!("numeric value truncated: expected {ndigits} digits"));
    }

    let digits: Vec<i16> = (0..ndigits)
        .map(|i| read_u16(8 + i * 2) as i16)
        .collect();
    let digit = |i: i32| -> i16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                let _ = write!(out, "{}", digit(i));
            } else {
                let _ = write!(out, "{:04}", digit(i));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

/// Encode a decimal string as a binary-format NUMERIC.
pub fn encode_numeric(text: &str) -> Result<Vec<u8>, String> {
    let text = text.trim();
    let special = match text.to_ascii_lowercase().as_str() {
        "nan" => Some(NUMERIC_NAN),
        "infinity" | "+infinity" | "inf" | "+inf" => Some(NUMERIC_PINF),
        "-infinity" | "-inf" => Some(NUMERIC_NINF),
        _ => None,
    };
    if let Some(sign) = special {
        return Ok(numeric_bytes(&[], 0, sign, 0));
    }

    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part)
    {
        return Err(format!("invalid numeric value '{text}'"));
    }

    let int_part = int_part.trim_start_matches('0');
    let dscale = u16::try_from(frac_part.len()).map_err(|_| "numeric scale too large".to_string())?;
    let int_digits = format!("{}{int_part}", "0".repeat((4 - int_part.len() % 4) % 4));
    let frac_digits = format!("{frac_part}{}", "0".repeat((4 - frac_part.len() % 4) % 4));

    let mut groups: Vec<i16> = int_digits
        .as_bytes()
        .chunks(4)
        .chain(frac_digits.as_bytes().chunks(4))
        .map(|chunk| chunk.iter().fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0')))
        .collect();
    let mut weight = i16::try_from(int_digits.len() / 4)
        .map_err(|_| "numeric value too large".to_string())?
        - 1;

    let leading = groups.iter().take_while(|&&g| g == 0).count();
    groups.drain(..leading);
    weight -= i16::try_from(leading).map_err(|_| "numeric value too small".to_string())?;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    let sign = if negative && !groups.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };
    Ok(numeric_bytes(&groups, weight, sign, dscale))
}

fn numeric_bytes(digits: &[i16], weight: i16, sign: u16, dscale: u16) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + digits.len() * 2);
    raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
    raw.extend_from_slice(&weight.to_be_bytes());
    raw.extend_from_slice(&sign.to_be_bytes());
    raw.extend_from_slice(&dscale.to_be_bytes());
    for d in digits {
        raw.extend_from_slice(&d.to_be_bytes());
    }
    raw
}

// =============================================================================
// JSON Rows
// =============================================================================

/// Convert a JSON cell into a [`Value`]. Used for rows that arrive as JSON
/// objects (the orm backend).
pub fn json_to_value(json: JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map_or(Value::Null, Value::Float),
        },
        JsonValue::String(s) => Value::Text(s),
        other => Value::Json(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[i16]) -> Vec<u8> {
        numeric_bytes(digits, weight, sign, dscale)
    }

    #[test]
    fn test_categorize_type() {
        assert_eq!(categorize_type("INT4"), TypeCategory::Integer);
        assert_eq!(categorize_type("int8"), TypeCategory::BigInt);
        assert_eq!(categorize_type("numeric"), TypeCategory::Decimal);
        assert_eq!(categorize_type("jsonb"), TypeCategory::Json);
        assert_eq!(categorize_type("timestamptz"), TypeCategory::TimestampTz);
        assert_eq!(categorize_type("varchar"), TypeCategory::Text);
        assert_eq!(categorize_type("inet"), TypeCategory::Unknown);
    }

    #[test]
    fn test_decode_numeric_fraction() {
        let raw = numeric(0, NUMERIC_POS, 2, &[123, 4500]);
        assert_eq!(decode_numeric(&raw).unwrap(), "123.45");
    }

    #[test]
    fn test_decode_numeric_multi_group_integer() {
        let raw = numeric(1, NUMERIC_NEG, 0, &[1234, 5678]);
        assert_eq!(decode_numeric(&raw).unwrap(), "-12345678");
    }

    #[test]
    fn test_decode_numeric_trailing_zero_groups() {
        // 10000 is stored as a single digit with weight 1
        let raw = numeric(1, NUMERIC_POS, 0, &[1]);
        assert_eq!(decode_numeric(&raw).unwrap(), "10000");
    }

    #[test]
    fn test_decode_numeric_small_values() {
        let raw = numeric(-1, NUMERIC_POS, 3, &[10]);
        assert_eq!(decode_numeric(&raw).unwrap(), "0.001");
        let raw = numeric(-2, NUMERIC_POS, 5, &[1000]);
        assert_eq!(decode_numeric(&raw).unwrap(), "0.00001");
    }

    #[test]
    fn test_decode_numeric_zero_with_scale() {
        let raw = numeric(0, NUMERIC_POS, 2, &[]);
        assert_eq!(decode_numeric(&raw).unwrap(), "0.00");
    }

    #[test]
    fn test_decode_numeric_special() {
        assert_eq!(decode_numeric(&numeric(0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert_eq!(
            decode_numeric(&numeric(0, NUMERIC_NINF, 0, &[])).unwrap(),
            "-Infinity"
        );
    }

    #[test]
    fn test_decode_numeric_rejects_garbage() {
        assert!(decode_numeric(&[0, 1]).is_err());
        let mut raw = numeric(0, NUMERIC_POS, 0, &[1, 2]);
        raw.truncate(10);
        assert!(decode_numeric(&raw).is_err());
    }

    #[test]
    fn test_encode_numeric_layout() {
        assert_eq!(
            encode_numeric("123.45").unwrap(),
            numeric(0, NUMERIC_POS, 2, &[123, 4500])
        );
        assert_eq!(
            encode_numeric("-12345678").unwrap(),
            numeric(1, NUMERIC_NEG, 0, &[1234, 5678])
        );
        assert_eq!(encode_numeric("10000").unwrap(), numeric(1, NUMERIC_POS, 0, &[1]));
        assert_eq!(
            encode_numeric("0.00001").unwrap(),
            numeric(-2, NUMERIC_POS, 5, &[1000])
        );
        assert_eq!(encode_numeric("-0.00").unwrap(), numeric(0, NUMERIC_POS, 2, &[]));
    }

    #[test]
    fn test_encode_numeric_matches_decoder() {
        for text in ["0.001", "987654321.0123", "-42", "NaN"] {
            let raw = encode_numeric(text).unwrap();
            assert_eq!(decode_numeric(&raw).unwrap(), text);
        }
    }

    #[test]
    fn test_encode_numeric_rejects_garbage() {
        assert!(encode_numeric("").is_err());
        assert!(encode_numeric("1.2.3").is_err());
        assert!(encode_numeric("12a").is_err());
        assert!(encode_numeric(".").is_err());
    }

    #[test]
    fn test_json_to_value() {
        assert_eq!(json_to_value(serde_json::json!(5)), Value::Int(5));
        assert_eq!(json_to_value(serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(json_to_value(serde_json::json!("x")), Value::Text("x".into()));
        assert!(matches!(
            json_to_value(serde_json::json!({"a": 1})),
            Value::Json(_)
        ));
    }
}
