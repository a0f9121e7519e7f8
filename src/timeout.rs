// ABOUTME: Response-timeout policy: how long to wait for the first qualifying fragment of a read
// ABOUTME: Once any qualifying fragment arrives the policy disarms; stop conditions govern from there

use std::time::Duration;
use tokio::time::Instant;

/// What a read does when the response window elapses without data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutAction {
    /// Fail the read with [`Error::Timeout`](crate::Error::Timeout).
    #[default]
    Error,
    /// Complete the read with an empty frame.
    ReturnEmpty,
}

/// Response-timeout policy for reads.
///
/// The response window bounds the time from read start to the *first*
/// qualifying fragment. It is armed when a read is registered, disarmed by
/// that first fragment, and never re-armed for the same read; frame closure
/// after that point is governed solely by stop conditions
/// ([`Continuation`](crate::StopCondition::Continuation) /
/// [`Total`](crate::StopCondition::Total)).
///
/// ```
/// use instrio::{Timeout, TimeoutAction};
/// use std::time::Duration;
///
/// // Fail after two seconds of silence.
/// let timeout = Timeout::new(Duration::from_secs(2));
///
/// // Return an empty frame instead of failing.
/// let timeout = Timeout::new(Duration::from_millis(100))
///     .with_action(TimeoutAction::ReturnEmpty);
///
/// // Wait forever (stop conditions only).
/// let timeout = Timeout::disabled();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    response: Option<Duration>,
    action: TimeoutAction,
}

impl Timeout {
    /// A policy that waits `response` for the first fragment and fails with
    /// a timeout error on expiry.
    pub fn new(response: Duration) -> Timeout {
        Timeout {
            response: Some(response),
            action: TimeoutAction::Error,
        }
    }

    /// A policy with no response window: reads wait indefinitely for the
    /// first fragment.
    pub fn disabled() -> Timeout {
        Timeout {
            response: None,
            action: TimeoutAction::Error,
        }
    }

    pub fn with_action(mut self, action: TimeoutAction) -> Timeout {
        self.action = action;
        self
    }

    pub fn response(&self) -> Option<Duration> {
        self.response
    }

    pub fn action(&self) -> TimeoutAction {
        self.action
    }

    /// Absolute deadline for a read admitted at `start`.
    pub(crate) fn deadline_from(&self, start: Instant) -> Option<Instant> {
        self.response.map(|window| start + window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_derives_from_admission() {
        let start = Instant::now();
        let timeout = Timeout::new(Duration::from_millis(250));
        assert_eq!(
            timeout.deadline_from(start),
            Some(start + Duration::from_millis(250))
        );
        assert_eq!(Timeout::disabled().deadline_from(start), None);
    }

    #[test]
    fn action_defaults_to_error() {
        assert_eq!(
            Timeout::new(Duration::from_secs(1)).action(),
            TimeoutAction::Error
        );
        assert_eq!(
            Timeout::new(Duration::from_secs(1))
                .with_action(TimeoutAction::ReturnEmpty)
                .action(),
            TimeoutAction::ReturnEmpty
        );
    }
}
