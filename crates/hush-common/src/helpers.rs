//! Common helper functions for Hush.

use subtle::ConstantTimeEq;

/// Performs a constant-time comparison of two strings.
/// This is used to compare passphrases without leaking where they differ.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    // Length is not secret; the contents are.
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_identical() {
        assert!(constant_time_eq("passphrase", "passphrase"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_constant_time_eq_different() {
        assert!(!constant_time_eq("passphrase1", "passphrase2"));
        assert!(!constant_time_eq("", "a"));
    }

    #[test]
    fn test_constant_time_eq_different_lengths() {
        assert!(!constant_time_eq("short", "much_longer_string"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn test_constant_time_eq_unicode() {
        assert!(constant_time_eq("émoji🎉", "émoji🎉"));
        assert!(!constant_time_eq("hello", "hėllo"));
    }
}
