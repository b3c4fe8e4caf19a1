use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;

pin_project! {
    /// A future slot that may be empty. Polls `Pending` while unarmed and
    /// empties itself once the armed future resolves.
    ///
    /// Fiber run loops keep one gate per kind of in-flight work (a log
    /// append, an archive read, a timer) and guard the matching `select!`
    /// arm with [`Gate::is_armed`].
    #[derive(Debug)]
    #[must_use = "futures do nothing unless polled"]
    pub(crate) struct Gate<F> {
        #[pin]
        slot: Option<F>,
    }
}

impl<F> Gate<F> {
    /// Creates an empty gate.
    pub(crate) fn idle() -> Self {
        Self { slot: None }
    }

    /// Returns whether a future is currently armed.
    pub(crate) fn is_armed(&self) -> bool {
        self.slot.is_some()
    }
}

impl<F: Unpin> Gate<F> {
    /// Arms the gate, replacing any future already in flight.
    pub(crate) fn arm(&mut self, fut: F) {
        self.slot = Some(fut);
    }

    /// Empties the gate, dropping any future in flight.
    pub(crate) fn disarm(&mut self) {
        self.slot = None;
    }
}

impl<F: Future> Future for Gate<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let Some(fut) = this.slot.as_mut().as_pin_mut() else {
            return Poll::Pending;
        };
        let out = ready!(fut.poll(cx));
        this.slot.set(None);
        Poll::Ready(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unarmed_gate_is_pending() {
        let mut gate = Gate::<std::future::Ready<u32>>::idle();
        assert!(!gate.is_armed());

        tokio::select! {
            _ = &mut gate => panic!("unarmed gate must not resolve"),
            () = tokio::time::sleep(std::time::Duration::from_millis(1)) => {}
        }
    }

    #[tokio::test]
    async fn armed_gate_resolves_once() {
        let mut gate = Gate::idle();
        gate.arm(std::future::ready(7u32));
        assert!(gate.is_armed());
        assert_eq!((&mut gate).await, 7);
        assert!(!gate.is_armed());
    }
}
