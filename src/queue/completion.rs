use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::QueueError;

type Outcome = Result<(), QueueError>;

/// Resolves once the enqueued frame has left the queue.
///
/// `Ok(())` when the frame was dequeued for sending, `Err(Closed)` when the queue was closed
/// while the frame was still pending. Dropping the `Completion` is fine, the frame is still
/// sent.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<Outcome>);

impl Completion {
    pub(crate) fn pair() -> (OnComplete, Completion) {
        let (tx, rx) = oneshot::channel();
        (OnComplete::Channel(tx), Completion(rx))
    }

    /// Check without waiting. `None` if the frame is still queued.
    pub fn try_get(&mut self) -> Option<Outcome> {
        match self.0.try_recv() {
            Ok(v) => Some(v),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(abandoned())),
        }
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(abandoned())))
    }
}

// The sending half is always fired before being dropped, so this is unreachable in practice.
fn abandoned() -> QueueError {
    QueueError::Closed(Arc::new(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "completion abandoned",
    )))
}

/// What to do once a frame leaves the queue.
pub(crate) enum OnComplete {
    Channel(oneshot::Sender<Outcome>),
    Callback(Box<dyn FnOnce(Outcome) + Send>),
}

impl OnComplete {
    pub fn fire(self, outcome: Outcome) {
        match self {
            OnComplete::Channel(tx) => {
                // Receiver may be gone, which means nobody cares.
                let _ = tx.send(outcome);
            }
            OnComplete::Callback(f) => f(outcome),
        }
    }
}
