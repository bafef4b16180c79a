//! Human-readable durations for command-line flags.

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
/// use heartband_relay::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("5h").unwrap(), Duration::from_secs(5 * 3600));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit_secs, unit_name) = if let Some(num) = src.strip_suffix("ms") {
        return parse_number(num, "milliseconds").map(Duration::from_millis);
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3600, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1, "seconds")
    } else {
        (src, 1, "duration")
    };

    let value = parse_number(num, unit_name)?;
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("{unit_name} out of range: {}", num.trim()))
}

fn parse_number(num: &str, unit_name: &str) -> Result<u64, String> {
    num.trim()
        .parse()
        .map_err(|_| format!("invalid {unit_name}: {num}"))
}
