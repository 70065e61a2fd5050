//! Kubernetes resource quantities (`2Gi`, `500Mi`, `1G`)

use crate::{Error, Result};

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parse a storage quantity into bytes
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, mult)| quantity.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((quantity, 1));

    if number.is_empty() || number.starts_with('-') || number.starts_with('+') {
        return Err(Error::Validation(format!("invalid quantity '{}'", quantity)));
    }

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| Error::Validation(format!("quantity '{}' overflows", quantity)));
    }

    let fractional: f64 = number
        .parse()
        .map_err(|_| Error::Validation(format!("invalid quantity '{}'", quantity)))?;
    let bytes = (fractional * multiplier as f64).ceil();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(Error::Validation(format!("quantity '{}' overflows", quantity)));
    }
    Ok(bytes as u64)
}

/// Quantity for a whole number of GiB, the unit Azure managed disks are sized in
pub fn gibibytes(size_gb: u32) -> String {
    format!("{}Gi", size_gb)
}
