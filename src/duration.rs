//! Human-friendly duration parsing for command-line flags.

use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use switchbot_exporter::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("11s").unwrap(), Duration::from_secs(11));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be tried before "m" and "s".
    let (number, unit, millis_per_unit): (&str, &str, u64) =
        if let Some(num) = src.strip_suffix("ms") {
            (num, "milliseconds", 1)
        } else if let Some(num) = src.strip_suffix('h') {
            (num, "hours", 3_600_000)
        } else if let Some(num) = src.strip_suffix('m') {
            (num, "minutes", 60_000)
        } else if let Some(num) = src.strip_suffix('s') {
            (num, "seconds", 1_000)
        } else {
            (src, "duration", 1_000)
        };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {number}"))?;
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("{unit} out of range: {number}"))
}
