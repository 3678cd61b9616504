use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::log_stat;

mod completion;
pub use completion::Completion;
use completion::OnComplete;

/// Errors from the [`FrameQueue`].
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The queue is closed. Every observer sees the same error, the one given to
    /// the first call of [`FrameQueue::close`].
    #[error("queue closed: {0}")]
    Closed(Arc<io::Error>),
}

impl QueueError {
    /// The error the queue was closed with.
    pub fn reason(&self) -> &io::Error {
        match self {
            QueueError::Closed(e) => e,
        }
    }
}

struct QueuedFrame {
    payload: Bytes,
    enqueued_at: Instant,
    on_complete: OnComplete,
}

#[derive(Default)]
struct SendState {
    frames: VecDeque<QueuedFrame>,
    closed: Option<Arc<io::Error>>,
}

/// Bidirectional buffer of unreliable frames.
///
/// Outbound frames are held in FIFO order until the scheduler pulls them with
/// [`FrameQueue::dequeue_send`]. Inbound frames land in a bounded queue where overflow
/// drops the newest arrival.
///
/// The queue is meant to be shared, typically in an `Arc`. Any number of producers may
/// call `enqueue_send` and `close` concurrently. `dequeue_send` and `on_receive` never
/// block.
pub struct FrameQueue {
    send: Mutex<SendState>,
    has_data: Box<dyn Fn() + Send + Sync>,

    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    discarded: AtomicU64,

    is_closed: AtomicBool,
    closed_tx: watch::Sender<Option<Arc<io::Error>>>,
}

impl FrameQueue {
    /// Create a queue with room for `inbound_capacity` received frames.
    ///
    /// `has_data` is invoked once for every enqueued outbound frame, outside any lock.
    /// The transport uses it to wake its send loop.
    ///
    /// # Panics
    ///
    /// If `inbound_capacity` is 0. Use [`SessionConfig::validate`][crate::SessionConfig::validate]
    /// to catch this early.
    pub fn new(inbound_capacity: usize, has_data: impl Fn() + Send + Sync + 'static) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        let (closed_tx, _) = watch::channel(None);

        FrameQueue {
            send: Mutex::new(SendState::default()),
            has_data: Box::new(has_data),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            discarded: AtomicU64::new(0),
            is_closed: AtomicBool::new(false),
            closed_tx,
        }
    }

    /// Append a frame to the outbound queue.
    ///
    /// The returned [`Completion`] resolves once the frame is dequeued, or with the close
    /// error if the queue is closed before that.
    pub fn enqueue_send(&self, payload: impl Into<Bytes>) -> Result<Completion, QueueError> {
        let (on_complete, completion) = Completion::pair();
        self.do_enqueue(payload.into(), on_complete)?;
        Ok(completion)
    }

    /// Append a frame to the outbound queue, invoking `on_complete` exactly once when it
    /// leaves the queue.
    ///
    /// If the queue is already closed, `on_complete` is invoked immediately with the close
    /// error, and the same error is returned.
    pub fn enqueue_send_with<F>(&self, payload: impl Into<Bytes>, on_complete: F) -> Result<(), QueueError>
    where
        F: FnOnce(Result<(), QueueError>) + Send + 'static,
    {
        self.do_enqueue(payload.into(), OnComplete::Callback(Box::new(on_complete)))
    }

    fn do_enqueue(&self, payload: Bytes, on_complete: OnComplete) -> Result<(), QueueError> {
        let rejected = {
            let mut state = self.send.lock();

            if let Some(err) = &state.closed {
                Some((err.clone(), on_complete))
            } else {
                state.frames.push_back(QueuedFrame {
                    payload,
                    enqueued_at: Instant::now(),
                    on_complete,
                });
                None
            }
        };

        if let Some((err, on_complete)) = rejected {
            let err = QueueError::Closed(err);
            on_complete.fire(Err(err.clone()));
            return Err(err);
        }

        (self.has_data)();

        Ok(())
    }

    /// Whether the head frame fits in a DATAGRAM frame of `max_frame_size` bytes.
    ///
    /// False if the queue is empty.
    pub fn can_send_head(&self, max_frame_size: usize) -> bool {
        let state = self.send.lock();
        let Some(head) = state.frames.front() else {
            return false;
        };
        datagram_frame_len(head.payload.len()) <= max_frame_size
    }

    /// Pop the head frame. Never blocks.
    pub fn dequeue_send(&self) -> Option<Bytes> {
        let frame = self.send.lock().frames.pop_front()?;

        let delay = frame.enqueued_at.elapsed();
        trace!("Dequeue {} bytes after {:?}", frame.payload.len(), delay);
        log_stat!("QUEUE_DELAY", frame.payload.len(), delay.as_micros());

        frame.on_complete.fire(Ok(()));

        Some(frame.payload)
    }

    /// Number of frames waiting to be sent.
    pub fn send_len(&self) -> usize {
        self.send.lock().frames.len()
    }

    /// Hand a received frame to the inbound queue.
    ///
    /// The data is copied. If the inbound queue is full, the frame is dropped and
    /// [`FrameQueue::discarded`] is incremented. Frames arriving after close are ignored.
    pub fn on_receive(&self, data: &[u8]) {
        if self.is_closed() {
            trace!("Ignore {} bytes received after close", data.len());
            return;
        }

        match self.inbound_tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(v)) => {
                let n = self.discarded.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Inbound queue full, drop {} bytes (total discarded: {})", v.len(), n);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The receiver lives as long as self.
            }
        }
    }

    /// Number of received frames dropped because the inbound queue was full.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Wait for the next received frame.
    ///
    /// Close takes priority. Once closed, this returns the close error even if there are
    /// frames left in the inbound queue.
    pub async fn receive(&self) -> Result<Bytes, QueueError> {
        // Subscribe before checking, so a close in between is not missed.
        let mut closed = self.closed_tx.subscribe();

        if let Some(err) = self.close_reason() {
            return Err(QueueError::Closed(err));
        }

        tokio::select! {
            biased;

            _ = closed.changed() => {
                Err(self.closed_error())
            }

            v = async { self.inbound_rx.lock().await.recv().await } => {
                match v {
                    Some(v) => Ok(v),
                    None => Err(self.closed_error()),
                }
            }
        }
    }

    /// Non-waiting variant of [`FrameQueue::receive`].
    ///
    /// `Ok(None)` if nothing is queued, or if another task is currently inside `receive`.
    pub fn try_receive(&self) -> Result<Option<Bytes>, QueueError> {
        if let Some(err) = self.close_reason() {
            return Err(QueueError::Closed(err));
        }

        let Ok(mut rx) = self.inbound_rx.try_lock() else {
            return Ok(None);
        };

        Ok(rx.try_recv().ok())
    }

    /// Close the queue.
    ///
    /// Only the first call has an effect. Every pending completion and every waiting
    /// `receive` resolves with `err`. All later operations fail with the same error.
    ///
    /// Returns `true` for the call that closed the queue.
    pub fn close(&self, err: io::Error) -> bool {
        let (err, pending) = {
            let mut state = self.send.lock();
            if state.closed.is_some() {
                trace!("Ignore repeated close: {}", err);
                return false;
            }

            let err = Arc::new(err);
            state.closed = Some(err.clone());
            self.is_closed.store(true, Ordering::Release);

            (err, std::mem::take(&mut state.frames))
        };

        debug!("Close queue with {} pending frames: {}", pending.len(), err);

        for frame in pending {
            frame.on_complete.fire(Err(QueueError::Closed(err.clone())));
        }

        self.closed_tx.send_replace(Some(err));
        true
    }

    /// Whether [`FrameQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// The error the queue was closed with.
    pub fn close_reason(&self) -> Option<Arc<io::Error>> {
        self.send.lock().closed.clone()
    }

    pub(crate) fn closed_error(&self) -> QueueError {
        let err = self.close_reason().unwrap_or_else(|| {
            Arc::new(io::Error::new(io::ErrorKind::BrokenPipe, "inbound queue gone"))
        });
        QueueError::Closed(err)
    }
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameQueue")
            .field("send_len", &self.send_len())
            .field("discarded", &self.discarded())
            .field("closed", &self.close_reason())
            .finish()
    }
}

/// Serialized length of a DATAGRAM frame with explicit length, RFC 9221.
///
/// 1 byte frame type, the length as a QUIC variable-length integer, then the payload.
pub(crate) fn datagram_frame_len(payload_len: usize) -> usize {
    1 + varint_len(payload_len as u64) + payload_len
}

fn varint_len(v: u64) -> usize {
    if v < 1 << 6 {
        1
    } else if v < 1 << 14 {
        2
    } else if v < 1 << 30 {
        4
    } else {
        8
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn queue(cap: usize) -> (FrameQueue, Arc<AtomicUsize>) {
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let q = FrameQueue::new(cap, move || {
            n.fetch_add(1, Ordering::SeqCst);
        });
        (q, notified)
    }

    #[test]
    fn datagram_frame_len_boundaries() {
        assert_eq!(datagram_frame_len(0), 2);
        assert_eq!(datagram_frame_len(63), 65);
        assert_eq!(datagram_frame_len(64), 67);
        assert_eq!(datagram_frame_len(1200), 1203);
        assert_eq!(datagram_frame_len(16_384), 16_389);
    }

    #[test]
    fn can_send_head_checks_size() {
        let (q, _) = queue(4);
        assert!(!q.can_send_head(1500));

        q.enqueue_send(vec![0; 1200]).unwrap();
        assert!(q.can_send_head(1203));
        assert!(!q.can_send_head(1202));

        // Non-mutating.
        assert_eq!(q.send_len(), 1);
    }

    #[test]
    fn notifies_once_per_enqueue() {
        let (q, notified) = queue(4);

        q.enqueue_send(&b"a"[..]).unwrap();
        q.enqueue_send_with(&b"b"[..], |_| {}).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        q.close(io::Error::new(io::ErrorKind::Other, "done"));
        assert!(q.enqueue_send(&b"c"[..]).is_err());
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_on_closed_fires_immediately() {
        let (q, _) = queue(4);
        q.close(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let r = q.enqueue_send_with(&b"x"[..], move |r| {
            assert!(r.is_err());
            f.fetch_add(1, Ordering::SeqCst);
        });

        let err = r.unwrap_err();
        assert_eq!(err.reason().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dequeue_completes() {
        let (q, _) = queue(4);
        let mut c = q.enqueue_send(&b"hello"[..]).unwrap();
        assert!(c.try_get().is_none());

        let v = q.dequeue_send().unwrap();
        assert_eq!(&v[..], b"hello");
        assert!(matches!(c.try_get(), Some(Ok(()))));
        assert!(q.dequeue_send().is_none());
    }

    #[test]
    fn close_fails_pending() {
        let (q, _) = queue(4);
        let mut c1 = q.enqueue_send(&b"1"[..]).unwrap();
        let mut c2 = q.enqueue_send(&b"2"[..]).unwrap();

        q.close(io::Error::new(io::ErrorKind::TimedOut, "idle"));
        q.close(io::Error::new(io::ErrorKind::Other, "second"));

        for c in [&mut c1, &mut c2] {
            let err = c.try_get().unwrap().unwrap_err();
            assert_eq!(err.reason().kind(), io::ErrorKind::TimedOut);
        }
        assert_eq!(q.send_len(), 0);
        assert!(q.dequeue_send().is_none());
        assert_eq!(q.close_reason().unwrap().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn inbound_overflow_drops_newest() {
        let (q, _) = queue(2);
        q.on_receive(b"1");
        q.on_receive(b"2");
        q.on_receive(b"3");
        assert_eq!(q.discarded(), 1);

        assert_eq!(&q.try_receive().unwrap().unwrap()[..], b"1");
        assert_eq!(&q.try_receive().unwrap().unwrap()[..], b"2");
        assert!(q.try_receive().unwrap().is_none());
    }

    #[test]
    fn receive_after_close_ignored() {
        let (q, _) = queue(2);
        q.close(io::Error::new(io::ErrorKind::Other, "bye"));
        q.on_receive(b"1");
        assert_eq!(q.discarded(), 0);
        assert!(q.try_receive().is_err());
    }

    #[tokio::test]
    async fn close_has_priority_over_queued() {
        let (q, _) = queue(2);
        q.on_receive(b"1");
        q.close(io::Error::new(io::ErrorKind::Other, "bye"));

        let err = q.receive().await.unwrap_err();
        assert_eq!(err.reason().to_string(), "bye");
    }

    #[tokio::test]
    async fn receive_waits_for_data() {
        let (q, _) = queue(2);
        let q = Arc::new(q);

        let q2 = q.clone();
        let task = tokio::spawn(async move { q2.receive().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        q.on_receive(b"late");

        let v = task.await.unwrap().unwrap();
        assert_eq!(&v[..], b"late");
    }
}
