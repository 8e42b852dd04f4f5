use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Longest stretch a waiting caller goes without re-checking its token.
const POLL_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallInterrupt {
    #[error("call cancelled")]
    Cancelled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,

    #[error("model call worker panicked")]
    WorkerPanicked,
}

/// Shared cancellation flag that sleeping callers can be woken from.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks for up to `timeout`; returns `true` as soon as the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let until = Instant::now() + timeout;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= until {
                return false;
            }
            let (guard, _) = self
                .inner
                .signal
                .wait_timeout(cancelled, until - now)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
        true
    }
}

/// Cancellation token plus optional deadline carried by every model call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Tightens the deadline; an earlier existing deadline is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<(), CallInterrupt> {
        if self.cancel.is_cancelled() {
            return Err(CallInterrupt::Cancelled);
        }
        if self.remaining().is_some_and(|left| left.is_zero()) {
            return Err(CallInterrupt::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early on cancellation or at the deadline.
    pub fn sleep(&self, duration: Duration) -> Result<(), CallInterrupt> {
        self.check()?;
        let (wait, hits_deadline) = match self.remaining() {
            Some(left) if left < duration => (left, true),
            _ => (duration, false),
        };
        if self.cancel.wait_timeout(wait) {
            return Err(CallInterrupt::Cancelled);
        }
        if hits_deadline {
            return Err(CallInterrupt::DeadlineExceeded);
        }
        Ok(())
    }

    /// Runs a blocking call on a helper thread and waits for it within this context.
    ///
    /// On cancellation or deadline the caller returns immediately; the helper
    /// finishes on its own and its result is dropped.
    pub fn run<T, F>(&self, call: F) -> Result<T, CallInterrupt>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.check()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(call());
        });
        loop {
            let slice = self
                .remaining()
                .map_or(POLL_SLICE, |left| left.min(POLL_SLICE));
            match rx.recv_timeout(slice) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => self.check()?,
                Err(RecvTimeoutError::Disconnected) => return Err(CallInterrupt::WorkerPanicked),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{CallContext, CallInterrupt, CancelToken};

    #[test]
    fn sleep_returns_after_duration() {
        let ctx = CallContext::new();
        let started = Instant::now();
        assert_eq!(ctx.sleep(Duration::from_millis(20)), Ok(()));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_wakes_sleeping_caller() {
        let token = CancelToken::new();
        let ctx = CallContext::with_cancel(token.clone());
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            token.cancel();
        });
        let started = Instant::now();
        assert_eq!(
            ctx.sleep(Duration::from_secs(10)),
            Err(CallInterrupt::Cancelled)
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        let _ = canceller.join();
    }

    #[test]
    fn sleep_past_deadline_reports_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        assert_eq!(
            ctx.sleep(Duration::from_secs(10)),
            Err(CallInterrupt::DeadlineExceeded)
        );
    }

    #[test]
    fn with_deadline_keeps_the_earlier_bound() {
        let near = Instant::now() + Duration::from_millis(10);
        let far = Instant::now() + Duration::from_secs(60);
        let ctx = CallContext::new().with_deadline(near).with_deadline(far);
        assert_eq!(ctx.deadline(), Some(near));
    }

    #[test]
    fn run_returns_value() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(|| 21 * 2), Ok(42));
    }

    #[test]
    fn run_abandons_call_at_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(30));
        let started = Instant::now();
        let outcome = ctx.run(|| {
            thread::sleep(Duration::from_secs(2));
            1
        });
        assert_eq!(outcome, Err(CallInterrupt::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn run_refuses_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let ctx = CallContext::with_cancel(token);
        assert_eq!(ctx.run(|| 1), Err(CallInterrupt::Cancelled));
    }
}
