//! Small shared utilities: feed URL validation and epoch-time helpers.

mod url_validator;

pub use url_validator::{validate_url, UrlValidationError};

/// Current time as epoch seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Retention cutoff as epoch seconds: entries published before this are
/// outside the retention window.
pub fn cutoff_ts(retention_days: i64) -> i64 {
    (chrono::Utc::now() - chrono::Duration::days(retention_days)).timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_is_in_the_past() {
        let cutoff = cutoff_ts(30);
        let now = now_ts();
        assert!(cutoff < now);
        // 30 days in seconds, with a little slack for test execution time
        assert!((now - cutoff - 30 * 86400).abs() < 5);
    }

    #[test]
    fn test_zero_retention_cutoff_is_now() {
        let cutoff = cutoff_ts(0);
        assert!((now_ts() - cutoff).abs() < 5);
    }
}
