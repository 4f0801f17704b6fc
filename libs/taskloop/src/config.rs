use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling timeouts.
///
/// Instance-scoped: every handler and looper carries its own copy instead of
/// consulting process-wide values. Fields deserialize from humantime strings
/// ("20ms", "1s"), so the struct can sit in a host application's config bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timings {
    /// Cap applied to a `next` wait while retryable work remains queued.
    #[serde(with = "humantime_serde", default = "default_retry_timeout")]
    pub retry_timeout: Duration,
    /// Per-iteration wait of a looper's run loop.
    #[serde(with = "humantime_serde", default = "default_handle_timeout")]
    pub handle_timeout: Duration,
    /// Grace period for an exec closure attached shortly after posting.
    #[serde(with = "humantime_serde", default = "default_attach_timeout")]
    pub attach_timeout: Duration,
}

fn default_retry_timeout() -> Duration {
    Duration::from_millis(20)
}

fn default_handle_timeout() -> Duration {
    Duration::from_millis(700)
}

fn default_attach_timeout() -> Duration {
    Duration::from_millis(20)
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            retry_timeout: default_retry_timeout(),
            handle_timeout: default_handle_timeout(),
            attach_timeout: default_attach_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let t = Timings::default();
        assert_eq!(t.retry_timeout, Duration::from_millis(20));
        assert_eq!(t.handle_timeout, Duration::from_millis(700));
        assert_eq!(t.attach_timeout, Duration::from_millis(20));
    }

    #[test]
    fn deserializes_humantime_strings_with_defaults() {
        let t: Timings = serde_yaml::from_str("retry_timeout: 5ms\n").unwrap();
        assert_eq!(t.retry_timeout, Duration::from_millis(5));
        assert_eq!(t.handle_timeout, Duration::from_millis(700));
    }

    #[test]
    fn rejects_unknown_fields() {
        let r: Result<Timings, _> = serde_yaml::from_str("poll_timeout: 5ms\n");
        assert!(r.is_err());
    }
}
