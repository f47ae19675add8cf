use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::Instant;

/// A resettable timer future that never resolves while idle.
///
/// Used inside `tokio::select!` loops, where an idle handle keeps the branch disabled without
/// extra bookkeeping.
#[derive(Debug)]
pub struct SleepHandle(Option<Pin<Box<tokio::time::Sleep>>>);

impl SleepHandle {
    /// Creates an idle timer.
    pub fn idle() -> Self {
        Self(None)
    }

    /// Cancels the timer.
    pub fn reset(&mut self) {
        self.0 = None;
    }

    /// Arms the timer to fire after `duration`, replacing a previous deadline.
    pub fn set(&mut self, duration: Duration) {
        self.0 = Some(Box::pin(tokio::time::sleep(duration)));
    }

    /// Returns `true` if the timer is not armed.
    pub fn is_idle(&self) -> bool {
        self.0.is_none()
    }

    /// Returns the deadline of the armed timer.
    pub fn deadline(&self) -> Option<Instant> {
        self.0.as_ref().map(|sleep| sleep.deadline())
    }
}

impl Future for SleepHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.0 {
            Some(ref mut sleep) => match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.0 = None;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let mut handle = SleepHandle::idle();
        assert!(handle.is_idle());
        assert!((&mut handle).now_or_never().is_none());

        handle.set(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!((&mut handle).now_or_never().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!((&mut handle).now_or_never(), Some(()));
        assert!(handle.is_idle());
    }
}
