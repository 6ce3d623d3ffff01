//! Counter decoding for iptables listings
//!
//! `iptables -v` abbreviates large counters with decimal suffixes
//! (`231K`, `1.2M`, `3G`). [`parse_count`] turns them back into integers.

use tracing::warn;

/// Parses a human-readable packet or byte counter.
///
/// - `""` and `"--"` are `0`
/// - commas are ignored
/// - `K`/`M`/`G` (any case) multiply by 10^3 / 10^6 / 10^9
/// - fractional values are multiplied as `f64` and truncated
///
/// Unparsable input logs a warning and yields `0`, which callers treat as
/// "unknown".
pub fn parse_count(text: &str) -> u64 {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "--" {
        return 0;
    }

    let cleaned: String = trimmed.chars().filter(|c| *c != ',').collect();

    let (number, multiplier) = match cleaned.chars().last() {
        Some('K' | 'k') => (&cleaned[..cleaned.len() - 1], 1_000_u64),
        Some('M' | 'm') => (&cleaned[..cleaned.len() - 1], 1_000_000),
        Some('G' | 'g') => (&cleaned[..cleaned.len() - 1], 1_000_000_000),
        _ => (cleaned.as_str(), 1),
    };

    if number.is_empty() {
        return 0;
    }

    if number.contains('.') {
        match number.parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => {
                (value * multiplier as f64).trunc() as u64
            }
            _ => {
                warn!("Unparsable counter value {:?}", text);
                0
            }
        }
    } else {
        match number.parse::<u64>() {
            Ok(value) => value.saturating_mul(multiplier),
            Err(e) => {
                warn!("Unparsable counter value {:?}: {}", text, e);
                0
            }
        }
    }
}
