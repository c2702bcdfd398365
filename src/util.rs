//! Shared utility functions used across the codebase.

use chrono::Utc;

/// Parse a boolean setting.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Strip trailing slashes so paths can be appended with `format!`.
pub fn trim_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "y", "On"] {
            assert!(parse_bool(value), "{value} should be truthy");
        }
        for value in ["0", "false", "no", "", "maybe"] {
            assert!(!parse_bool(value), "{value} should be falsy");
        }
    }

    #[test]
    fn trim_base_url_drops_trailing_slashes() {
        assert_eq!(trim_base_url("http://host/api//"), "http://host/api");
        assert_eq!(trim_base_url("http://host"), "http://host");
    }
}
