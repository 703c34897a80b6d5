//! Resource quantity parsing.
//!
//! Task payloads carry resources as strings (`"4"`, `"8 GiB"`, `"20GB"`).
//! Decimal and binary unit families are both read as binary multiples.

use crate::error::QuantityError;

/// One gibibyte.
pub const GIB: i64 = 1 << 30;

fn multiplier(unit: &str) -> Option<i64> {
    let m = match unit.to_ascii_lowercase().as_str() {
        "b" => 1,
        "k" | "kb" | "ki" | "kib" => 1 << 10,
        "m" | "mb" | "mi" | "mib" => 1 << 20,
        "" | "g" | "gb" | "gi" | "gib" => GIB,
        "t" | "tb" | "ti" | "tib" => 1 << 40,
        _ => return None,
    };
    Some(m)
}

/// Parse a memory/storage quantity into bytes. A bare number is GiB.
pub fn parse_quantity(input: &str) -> Result<i64, QuantityError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let unit = unit.trim();

    let value: f64 = number
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| QuantityError::InvalidNumber(input.to_string()))?;
    if value < 0.0 {
        return Err(QuantityError::Negative(input.to_string()));
    }
    let factor = multiplier(unit).ok_or_else(|| QuantityError::UnknownUnit {
        input: input.to_string(),
        unit: unit.to_string(),
    })?;

    Ok((value * factor as f64).round() as i64)
}

/// Parse a whole-core cpu count. Fractions are truncated.
pub fn parse_cpu(input: &str) -> Result<i64, QuantityError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::Empty);
    }
    let value: f64 = trimmed
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| QuantityError::InvalidNumber(input.to_string()))?;
    if value < 0.0 {
        return Err(QuantityError::Negative(input.to_string()));
    }
    Ok(value.trunc() as i64)
}
