//! Parsing of human-readable object sizes such as `4k`, `8m` or `2g`.

use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// A size token could not be turned into a positive byte count.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid size format `{token}`: {reason}")]
pub struct InvalidSizeFormat {
    /// The token as given by the user.
    pub token: String,
    /// Why the token was rejected.
    pub reason: &'static str,
}

impl InvalidSizeFormat {
    fn new(token: &str, reason: &'static str) -> Self {
        Self {
            token: token.to_owned(),
            reason,
        }
    }
}

/// Parses a size token into a number of bytes.
///
/// The token is a decimal numeral, optionally followed by a single case-insensitive suffix:
///
/// - `k`: kibibytes (×1024)
/// - `m`: mebibytes (×1024²)
/// - `g`: gibibytes (×1024³)
///
/// Without a suffix, the numeral is taken as raw bytes. Zero, negative or non-numeric values are
/// rejected, as are unknown suffixes and values that overflow a `u64`.
///
/// ```
/// assert_eq!(s3load_engine::parse_size("4k").unwrap(), 4096);
/// assert_eq!(s3load_engine::parse_size("512").unwrap(), 512);
/// assert!(s3load_engine::parse_size("5x").is_err());
/// ```
pub fn parse_size(token: &str) -> Result<u64, InvalidSizeFormat> {
    let text = token.trim();
    if text.is_empty() {
        return Err(InvalidSizeFormat::new(token, "size must not be empty"));
    }

    let (numeral, multiplier) = match text.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_lowercase() {
                'k' => KIB,
                'm' => MIB,
                'g' => GIB,
                _ => return Err(InvalidSizeFormat::new(token, "unknown suffix, expected k/m/g")),
            };
            (&text[..idx], multiplier)
        }
        _ => (text, 1),
    };

    if numeral.is_empty() || !numeral.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidSizeFormat::new(
            token,
            "expected a positive decimal number",
        ));
    }

    let value: u64 = numeral
        .parse()
        .map_err(|_| InvalidSizeFormat::new(token, "number is too large"))?;
    if value == 0 {
        return Err(InvalidSizeFormat::new(token, "size must be positive"));
    }

    value
        .checked_mul(multiplier)
        .ok_or_else(|| InvalidSizeFormat::new(token, "size is too large"))
}
