use std::time::Duration;

/// How long a blocking scheduler call may park.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Do not park at all.
    NoWait,
    /// Park until work or a pulse arrives.
    Forever,
    /// Park for at most this long.
    Timeout(Duration),
}

impl Wait {
    /// Truncate the wait to at most `cap`.
    pub(crate) fn cap(self, cap: Duration) -> Wait {
        match self {
            Wait::NoWait => Wait::NoWait,
            Wait::Forever => Wait::Timeout(cap),
            Wait::Timeout(d) => Wait::Timeout(d.min(cap)),
        }
    }
}

impl From<Duration> for Wait {
    fn from(d: Duration) -> Self {
        Wait::Timeout(d)
    }
}
