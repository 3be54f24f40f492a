use chrono::{DateTime, Utc};

/// Split the timestamp the API server prefixes to each line
///
/// Returns the parsed instant and the rest of the line. Lines without a
/// recognizable prefix come back unchanged.
pub fn split_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
    // 2024-01-15T10:30:00Z (20 chars) up to 2024-01-15T10:30:00.123456789Z (30 chars)
    if raw.len() < 20 {
        return (None, raw);
    }

    let search_end = floor_char_boundary(raw, 35);
    let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) else {
        return (None, raw);
    };

    match DateTime::parse_from_rfc3339(&raw[..=z_pos]) {
        Ok(ts) => {
            let rest = &raw[z_pos + 1..];
            // Only the single separator space belongs to the prefix
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            (Some(ts.with_timezone(&Utc)), rest)
        }
        Err(_) => (None, raw),
    }
}

/// Largest char boundary <= idx
fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_split_timestamp() {
        let (ts, rest) = split_timestamp("2024-01-15T10:30:00.123456789Z Starting server");
        let ts = ts.unwrap();
        assert_eq!(ts.hour(), 10);
        assert_eq!(ts.nanosecond(), 123_456_789);
        assert_eq!(rest, "Starting server");
    }

    #[test]
    fn test_split_keeps_indentation() {
        let (ts, rest) = split_timestamp("2024-01-15T10:30:00Z   at Foo.bar()");
        assert!(ts.is_some());
        assert_eq!(rest, "  at Foo.bar()");

        let (ts, rest) = split_timestamp("2024-01-15T10:30:00Z ");
        assert!(ts.is_some());
        assert_eq!(rest, "");
    }

    #[test]
    fn test_no_timestamp() {
        let line = "plain log line without any prefix at all";
        assert_eq!(split_timestamp(line), (None, line));
        assert_eq!(split_timestamp("short"), (None, "short"));
        assert_eq!(split_timestamp("Zebra crossing report: all clear"), (None, "Zebra crossing report: all clear"));
    }

    #[test]
    fn test_multibyte_near_search_window() {
        let line = "日本語のログ日本語のログ日本語のログ日本語のログ";
        assert_eq!(split_timestamp(line), (None, line));
    }
}
