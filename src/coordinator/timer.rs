use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// A cancellable deferred task. Dropping the handle cancels it.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    id: u64,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TimerHandle {
    /// Reserves an id before the timer exists, so the callback can recognise
    /// its own registration.
    pub(crate) fn next_id() -> u64 {
        NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `f` once `delay` has elapsed unless cancelled first.
    ///
    /// Returns `None`, and never runs `f`, outside a Tokio runtime.
    pub(crate) fn spawn<F>(id: u64, delay: Duration, f: F) -> Option<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(?delay, "No Tokio runtime; timer not armed");
            return None;
        };
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let join = runtime.spawn(async move {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(delay) => f(),
            }
        });
        Some(Self { id, token, join })
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
