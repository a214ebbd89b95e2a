//! Environment variable helpers for `OCPP_*` configuration.
//!
//! ```ignore
//! use ocpp_core::env::{env_get, env_timeout_ms};
//!
//! let reactors: usize = env_get("OCPP_REACTORS", 4);
//! // Negative values disable the timeout.
//! let call_timeout = env_timeout_ms("OCPP_CALL_TIMEOUT_MS", 5000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only when the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true; anything else set is false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond timeout. A negative value means "no timeout" (`None`).
pub fn env_timeout_ms(key: &str, default_ms: i64) -> Option<Duration> {
    millis_to_timeout(env_get(key, default_ms))
}

/// Whole-second duration; negative values clamp to zero.
pub fn env_duration_secs(key: &str, default_secs: i64) -> Duration {
    Duration::from_secs(env_get(key, default_secs).max(0) as u64)
}

/// Signed milliseconds to an optional timeout.
pub fn millis_to_timeout(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__OCPP_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u16>("__OCPP_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__OCPP_TEST_UNSET__", "x"), "x");
    }

    #[test]
    fn test_env_get_parses_and_falls_back() {
        std::env::set_var("__OCPP_TEST_NUM__", " 17 ");
        assert_eq!(env_get::<usize>("__OCPP_TEST_NUM__", 0), 17);
        std::env::set_var("__OCPP_TEST_NUM__", "seventeen");
        assert_eq!(env_get::<usize>("__OCPP_TEST_NUM__", 3), 3);
        std::env::remove_var("__OCPP_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("__OCPP_TEST_BOOL__", "On");
        assert!(env_get_bool("__OCPP_TEST_BOOL__", false));
        std::env::set_var("__OCPP_TEST_BOOL__", "nope");
        assert!(!env_get_bool("__OCPP_TEST_BOOL__", true));
        std::env::remove_var("__OCPP_TEST_BOOL__");
        assert!(env_get_bool("__OCPP_TEST_BOOL__", true));
    }

    #[test]
    fn test_timeout_ms() {
        assert_eq!(millis_to_timeout(250), Some(Duration::from_millis(250)));
        assert_eq!(millis_to_timeout(0), Some(Duration::ZERO));
        assert_eq!(millis_to_timeout(-1), None);

        std::env::set_var("__OCPP_TEST_TIMEOUT__", "-5");
        assert_eq!(env_timeout_ms("__OCPP_TEST_TIMEOUT__", 100), None);
        std::env::remove_var("__OCPP_TEST_TIMEOUT__");
        assert_eq!(
            env_timeout_ms("__OCPP_TEST_TIMEOUT__", 100),
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_duration_secs_clamps() {
        assert_eq!(env_duration_secs("__OCPP_TEST_SECS__", -3), Duration::ZERO);
        assert_eq!(env_duration_secs("__OCPP_TEST_SECS__", 60), Duration::from_secs(60));
    }
}
