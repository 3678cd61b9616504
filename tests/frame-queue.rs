use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use roq::{FrameQueue, QueueError};

mod common;
use common::init_log;

fn queue(cap: usize) -> (Arc<FrameQueue>, Arc<AtomicUsize>) {
    let notified = Arc::new(AtomicUsize::new(0));
    let n = notified.clone();
    let q = FrameQueue::new(cap, move || {
        n.fetch_add(1, Ordering::SeqCst);
    });
    (Arc::new(q), notified)
}

#[tokio::test]
pub async fn send_receive_close() {
    init_log();

    let (q, notified) = queue(8);

    let fired = Arc::new(Mutex::new(vec![]));
    let mut completions = vec![];

    for size in [100, 200, 50] {
        let fired = fired.clone();
        q.enqueue_send_with(vec![1; size], move |r| fired.lock().push((size, r.is_ok())))
            .unwrap();
        completions.push(q.enqueue_send(vec![2; size]).unwrap());
    }
    assert_eq!(notified.load(Ordering::SeqCst), 6);

    let mut sizes = vec![];
    while let Some(frame) = q.dequeue_send() {
        sizes.push(frame.len());
    }
    assert_eq!(sizes, vec![100, 100, 200, 200, 50, 50]);

    assert_eq!(
        *fired.lock(),
        vec![(100, true), (200, true), (50, true)]
    );
    for c in completions {
        assert!(c.await.is_ok());
    }

    // A receiver parked before close wakes up with the close error.
    let rx = {
        let q = q.clone();
        tokio::spawn(async move { q.receive().await })
    };
    tokio::task::yield_now().await;

    assert!(q.close(io::Error::new(io::ErrorKind::ConnectionAborted, "peer gone")));
    assert!(!q.close(io::Error::new(io::ErrorKind::Other, "second")));

    let err = rx.await.unwrap().unwrap_err();
    assert_eq!(err.reason().kind(), io::ErrorKind::ConnectionAborted);

    // Callbacks never fire twice.
    assert_eq!(fired.lock().len(), 3);

    let err = q.enqueue_send(vec![0; 10]).unwrap_err();
    assert_eq!(err.reason().kind(), io::ErrorKind::ConnectionAborted);
}

#[tokio::test]
pub async fn pending_frames_fail_on_close() {
    init_log();

    let (q, _) = queue(8);

    let a = q.enqueue_send(vec![0; 10]).unwrap();
    let b = q.enqueue_send(vec![0; 20]).unwrap();

    q.close(io::Error::new(io::ErrorKind::TimedOut, "idle"));

    for c in [a, b] {
        let QueueError::Closed(err) = c.await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    assert_eq!(q.dequeue_send(), None);
    assert_eq!(q.send_len(), 0);
}

#[tokio::test]
pub async fn inbound_is_bounded() {
    init_log();

    let (q, _) = queue(2);

    q.on_receive(b"one");
    q.on_receive(b"two");
    q.on_receive(b"three");
    q.on_receive(b"four");

    assert_eq!(q.discarded(), 2);
    assert_eq!(&q.receive().await.unwrap()[..], b"one");
    assert_eq!(&q.try_receive().unwrap().unwrap()[..], b"two");
    assert_eq!(q.try_receive().unwrap(), None);

    // Room again.
    q.on_receive(b"five");
    assert_eq!(&q.receive().await.unwrap()[..], b"five");
    assert_eq!(q.discarded(), 2);
}

#[tokio::test]
pub async fn receive_wakes_on_data() {
    init_log();

    let (q, _) = queue(4);

    let rx = {
        let q = q.clone();
        tokio::spawn(async move { q.receive().await })
    };
    tokio::task::yield_now().await;

    q.on_receive(&[7; 30]);

    let frame = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.len(), 30);
}

#[test]
pub fn concurrent_producers_keep_their_order() {
    init_log();

    let (q, notified) = queue(4);

    let producers: Vec<_> = (0..4u8)
        .map(|id| {
            let q = q.clone();
            thread::spawn(move || {
                for n in 0..100u8 {
                    q.enqueue_send(vec![id, n]).unwrap();
                }
            })
        })
        .collect();

    let mut seen: Vec<Vec<u8>> = vec![vec![]; 4];
    let mut total = 0;

    while total < 400 {
        match q.dequeue_send() {
            Some(frame) => {
                seen[frame[0] as usize].push(frame[1]);
                total += 1;
            }
            None => thread::yield_now(),
        }
    }

    for p in producers {
        p.join().unwrap();
    }

    let expected: Vec<u8> = (0..100).collect();
    for s in seen {
        assert_eq!(s, expected);
    }
    assert_eq!(notified.load(Ordering::SeqCst), 400);
    assert_eq!(q.dequeue_send(), None);
}

#[test]
pub fn racing_close_settles_every_frame_once() {
    init_log();

    let (q, _) = queue(4);
    let fired = Arc::new(AtomicUsize::new(0));
    let closed_by = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let q = q.clone();
            let fired = fired.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let fired = fired.clone();
                    let _ = q.enqueue_send_with(vec![0; 8], move |_| {
                        fired.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();

    let closers: Vec<_> = (0..2)
        .map(|i| {
            let q = q.clone();
            let closed_by = closed_by.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    q.dequeue_send();
                }
                if q.close(io::Error::new(io::ErrorKind::Other, format!("closer {i}"))) {
                    closed_by.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for t in producers.into_iter().chain(closers) {
        t.join().unwrap();
    }

    assert!(q.is_closed());
    assert_eq!(closed_by.load(Ordering::SeqCst), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 800);
}
