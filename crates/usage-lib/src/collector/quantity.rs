//! Kubernetes resource quantity parsing
//!
//! metrics-server reports CPU as e.g. "123456789n" or "250m" and memory as
//! e.g. "24880Ki" or "128Mi". Both are converted to plain numbers here.

use crate::error::QuantityError;

const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: &[(&str, i32)] = &[
    ("k", 3),
    ("K", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse a CPU quantity into fractional cores
pub fn parse_cpu_cores(quantity: &str) -> Result<f64, QuantityError> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (number, scale) = if let Some(val) = quantity.strip_suffix('n') {
        (val, 1e-9)
    } else if let Some(val) = quantity.strip_suffix('u') {
        (val, 1e-6)
    } else if let Some(val) = quantity.strip_suffix('m') {
        (val, 1e-3)
    } else {
        (quantity, 1.0)
    };

    Ok(parse_number(number, quantity)? * scale)
}

/// Parse a memory quantity into bytes
pub fn parse_memory_bytes(quantity: &str) -> Result<u64, QuantityError> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err(QuantityError::Empty);
    }

    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(val) = quantity.strip_suffix(suffix) {
            let bytes = parse_number(val, quantity)? * 1024f64.powi(*power as i32);
            return Ok(bytes.round() as u64);
        }
    }

    for (suffix, exponent) in DECIMAL_SUFFIXES {
        if let Some(val) = quantity.strip_suffix(suffix) {
            let bytes = parse_number(val, quantity)? * 10f64.powi(*exponent);
            return Ok(bytes.round() as u64);
        }
    }

    // Plain bytes, possibly in exponent notation ("1e3")
    Ok(parse_number(quantity, quantity)?.round() as u64)
}

fn parse_number(number: &str, original: &str) -> Result<f64, QuantityError> {
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(original.to_string()))?;

    if !value.is_finite() {
        return Err(QuantityError::Invalid(original.to_string()));
    }
    if value < 0.0 {
        return Err(QuantityError::Negative(original.to_string()));
    }
    // "-0" parses to negative zero
    Ok(value.abs())
}
