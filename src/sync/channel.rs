use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::task::AbortHandle;

use super::FetchRequest;

/// Reconnect delays never exceed this.
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Active,
    /// Disconnected because the host is hidden. Doesn't count as an error.
    Idle,
    /// Disconnected after an error, waiting to reconnect.
    Disabled,
}

/// One event stream shared by every consumer of a key.
#[derive(Debug)]
pub(crate) struct ScopedChannel {
    /// Request the stream was opened with. Pushed payloads are cached under its cache key.
    pub(crate) request: FetchRequest,
    pub(crate) state: ChannelState,
    /// Consecutive errors since the last successful open.
    pub(crate) errors: u32,
    /// Identifies the task driving the stream, so a replaced task can tell it's stale.
    pub(crate) generation: u64,
    pub(crate) task: Option<AbortHandle>,
}

impl ScopedChannel {
    pub(crate) fn new(request: FetchRequest) -> ScopedChannel {
        ScopedChannel {
            request,
            state: ChannelState::Active,
            errors: 0,
            generation: 0,
            task: None,
        }
    }

    /// Stop the task driving the stream.
    pub(crate) fn disconnect(&mut self, state: ChannelState) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = state;
        self.generation += 1;
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Exponential backoff with jitter: `3^(errors - 3) * (1s + random(0..1s))`, capped at
/// [`MAX_BACKOFF`].
pub(crate) fn backoff(errors: u32) -> Duration {
    let exponent = errors.min(16) as i32 - 3;
    let jitter: f64 = thread_rng().gen_range(0.0..1.0);
    let millis = 3f64.powi(exponent) * (1000.0 + jitter * 1000.0);
    Duration::from_millis(millis as u64).min(MAX_BACKOFF)
}
