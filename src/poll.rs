//! Bounded poll-until-ready loop for server-side eventual consistency.
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("timed out after {waited_ms} ms waiting for {what}")]
    Timeout { what: String, waited_ms: u128 },
    #[error("{what}: {source:#}")]
    Failed {
        what: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Exponential backoff schedule with an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(15),
        }
    }
}

impl Backoff {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Run `check` until it yields `Some`, sleeping between attempts.
///
/// A check error ends the loop immediately; running out of time is reported
/// as `PollError::Timeout`, distinct from "not ready yet".
pub fn poll_until<T>(
    what: &str,
    backoff: &Backoff,
    mut check: impl FnMut() -> anyhow::Result<Option<T>>,
) -> Result<T, PollError> {
    let started = Instant::now();
    let mut delay = backoff.initial;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match check() {
            Ok(Some(value)) => {
                tracing::debug!(what, attempts, "poll satisfied");
                return Ok(value);
            }
            Ok(None) => {}
            Err(source) => {
                return Err(PollError::Failed {
                    what: what.to_string(),
                    source,
                })
            }
        }
        let elapsed = started.elapsed();
        if elapsed >= backoff.timeout {
            return Err(PollError::Timeout {
                what: what.to_string(),
                waited_ms: elapsed.as_millis(),
            });
        }
        let remaining = backoff.timeout - elapsed;
        thread::sleep(delay.min(remaining));
        delay = backoff.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn returns_once_the_check_is_ready() {
        let mut calls = 0;
        let value = poll_until("file registration", &quick(), || {
            calls += 1;
            Ok((calls == 3).then_some("ready"))
        })
        .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(calls, 3);
    }

    #[test]
    fn timeout_is_distinct_from_failure() {
        let backoff = Backoff {
            timeout: Duration::from_millis(5),
            ..quick()
        };
        let err = poll_until::<()>("never", &backoff, || Ok(None)).unwrap_err();
        assert!(matches!(err, PollError::Timeout { .. }));

        let err = poll_until::<()>("broken", &quick(), || Err(anyhow::anyhow!("HTTP 500")))
            .unwrap_err();
        match err {
            PollError::Failed { what, source } => {
                assert_eq!(what, "broken");
                assert_eq!(source.to_string(), "HTTP 500");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.next_delay(Duration::from_millis(250)),
            Duration::from_millis(500)
        );
        assert_eq!(
            backoff.next_delay(Duration::from_millis(1500)),
            Duration::from_secs(2)
        );
    }
}
