//! Human-readable byte sizes.
//!
//! Sizes are written as a decimal number with an optional binary unit suffix: `1024`, `128MiB`,
//! `2G`, `1.5 gb`.  All suffixes are powers of 1024; the `k`/`kb`/`kib` spellings are
//! synonyms.  A bare number is a byte count.

const UNITS: &[(&str, u32)] = &[
    ("", 0),
    ("b", 0),
    ("k", 1),
    ("kb", 1),
    ("kib", 1),
    ("m", 2),
    ("mb", 2),
    ("mib", 2),
    ("g", 3),
    ("gb", 3),
    ("gib", 3),
    ("t", 4),
    ("tb", 4),
    ("tib", 4),
];

/// Names used by [`format_size`], indexed by power of 1024.
const UNIT_NAMES: [&str; 5] = ["", "KiB", "MiB", "GiB", "TiB"];

pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

fn unit_multiplier(suffix: &str) -> Option<u64> {
    let suffix = suffix.to_ascii_lowercase();
    UNITS
        .iter()
        .find(|(name, _)| *name == suffix)
        .map(|(_, power)| 1u64 << (10 * power))
}

/// Parses a size string into an exact byte count.
///
/// Whitespace anywhere in the string is ignored and the unit is matched case-insensitively.
/// Fractional values are allowed for every unit and are rounded to the nearest byte (halves
/// round up).
///
/// Returns `None` if the string can't be parsed, including the empty string, negative numbers
/// and values that don't fit in a `u64`.  Callers must treat `None` as an error and never as
/// zero.
pub fn parse_size(input: &str) -> Option<u64> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();

    let split = compact
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(compact.len());
    let (number, suffix) = compact.split_at(split);
    let multiplier = unit_multiplier(suffix)?;

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.contains('.') {
        return None;
    }

    let whole: u128 = match whole {
        "" => 0,
        digits => digits.parse().ok()?,
    };
    let mut bytes = whole.checked_mul(multiplier as u128)?;

    // Long multiplication from the last digit up.  Only the remainder of the final step
    // decides rounding, so the arithmetic stays exact for any number of digits.
    let mut part = 0u128;
    let mut round_up = false;
    for digit in fraction.bytes().rev() {
        let n = u128::from(digit - b'0') * multiplier as u128 + part;
        part = n / 10;
        round_up = n % 10 >= 5;
    }
    bytes = bytes.checked_add(part + u128::from(round_up))?;

    u64::try_from(bytes).ok()
}

/// Formats a byte count using the largest binary unit that divides it exactly.
///
/// The output always parses back to the same value with [`parse_size`].
pub fn format_size(bytes: u64) -> String {
    let mut power = 0;
    let mut value = bytes;
    while value != 0 && value % 1024 == 0 && power + 1 < UNIT_NAMES.len() {
        value /= 1024;
        power += 1;
    }
    format!("{value}{}", UNIT_NAMES[power])
}
