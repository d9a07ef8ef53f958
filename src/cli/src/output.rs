//! Table and value formatting for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Relative age such as "3 minutes ago".
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let secs = chrono::Utc::now().signed_duration_since(*dt).num_seconds();
    if secs < 1 {
        return "just now".to_string();
    }

    let (count, unit) = match secs {
        s if s < 60 => (s, "second"),
        s if s < 3600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3600, "hour"),
        s if s < 30 * 86_400 => (s / 86_400, "day"),
        s if s < 365 * 86_400 => (s / (30 * 86_400), "month"),
        s => (s / (365 * 86_400), "year"),
    };
    let plural = if count == 1 { "" } else { "s" };
    format!("{count} {unit}{plural} ago")
}

/// Cut `s` to at most `max` characters, marking the cut with `...`.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(100 * 1048576), "100.0 MB");
        assert_eq!(format_bytes(10 * 1073741824), "10.0 GB");
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["TAG", "MANIFEST"]);
        table.add_row(["app:latest", "0123456789ab"]);
        let output = table.to_string();
        assert!(output.contains("TAG"));
        assert!(output.contains("app:latest"));
        assert!(output.contains("0123456789ab"));
    }

    #[test]
    fn test_format_ago() {
        let now = chrono::Utc::now();
        assert_eq!(format_ago(&now), "just now");
        assert_eq!(
            format_ago(&(now - chrono::Duration::seconds(30))),
            "30 seconds ago"
        );
        assert_eq!(
            format_ago(&(now - chrono::Duration::minutes(1))),
            "1 minute ago"
        );
        assert_eq!(
            format_ago(&(now - chrono::Duration::hours(5))),
            "5 hours ago"
        );
        assert_eq!(
            format_ago(&(now - chrono::Duration::days(60))),
            "2 months ago"
        );
        assert_eq!(
            format_ago(&(now - chrono::Duration::days(730))),
            "2 years ago"
        );
        assert_eq!(
            format_ago(&(now + chrono::Duration::hours(1))),
            "just now"
        );
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("RUN true", 20), "RUN true");
        assert_eq!(truncate_str("RUN make install", 10), "RUN mak...");
        assert_eq!(truncate_str("abc", 3), "abc");
    }
}
