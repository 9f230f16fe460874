//! Bounded drain queue between the write path and the disk.
//!
//! The write path never performs I/O: it copies the caller's bytes into a
//! pooled buffer and hands it to a single consumer thread over a bounded
//! channel. A full channel drops the buffer instead of blocking, which is
//! the declared loss-over-latency trade-off; drops are counted so the loss
//! is observable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Buffers kept on the free list; beyond this, drained buffers are freed.
const POOLED_BUFFERS: usize = 64;

/// Reusable byte buffers shared by the enqueue path and the consumer.
pub(crate) struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    /// An empty buffer with at least `capacity` reserved, pooled if one is
    /// available.
    fn get(&self, capacity: usize) -> Vec<u8> {
        let pooled = {
            let mut free = self.free.lock().unwrap_or_else(|poison| poison.into_inner());
            free.pop()
        };
        match pooled {
            Some(mut buf) => {
                buf.reserve(capacity);
                buf
            }
            None => Vec::with_capacity(capacity),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|poison| poison.into_inner());
        if free.len() < POOLED_BUFFERS {
            free.push(buf);
        }
    }
}

/// Sender half of the drain queue.
///
/// Dropping it is the shutdown signal: the consumer drains whatever is still
/// queued, then exits.
pub(crate) struct DrainQueue {
    tx: SyncSender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
    pool: Arc<BufferPool>,
}

impl DrainQueue {
    /// Spawns the consumer thread. `append` runs once per drained buffer, in
    /// enqueue order, until every sender is gone and the backlog is empty.
    pub fn spawn<F>(capacity: usize, dropped: Arc<AtomicU64>, append: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let pool = BufferPool::new();
        let consumer_pool = Arc::clone(&pool);
        let handle = thread::spawn(move || consume(rx, consumer_pool, append));
        (Self { tx, dropped, pool }, handle)
    }

    /// Non-blocking enqueue. Returns whether the bytes were accepted; a full
    /// queue drops them and bumps the drop counter.
    pub fn enqueue(&self, bytes: &[u8]) -> bool {
        let mut buf = self.pool.get(bytes.len());
        buf.extend_from_slice(bytes);
        match self.tx.try_send(buf) {
            Ok(()) => true,
            Err(TrySendError::Full(buf)) | Err(TrySendError::Disconnected(buf)) => {
                self.pool.put(buf);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

fn consume<F>(rx: Receiver<Vec<u8>>, pool: Arc<BufferPool>, mut append: F)
where
    F: FnMut(&[u8]),
{
    while let Ok(buf) = rx.recv() {
        append(&buf);
        pool.put(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn drains_in_enqueue_order() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let dropped = Arc::new(AtomicU64::new(0));

        let (queue, handle) = DrainQueue::spawn(16, Arc::clone(&dropped), move |bytes| {
            sink.lock().unwrap().extend_from_slice(bytes);
        });

        assert!(queue.enqueue(b"one "));
        assert!(queue.enqueue(b"two "));
        assert!(queue.enqueue(b"three"));
        drop(queue);
        handle.join().unwrap();

        assert_eq!(collected.lock().unwrap().as_slice(), b"one two three");
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        // Gate the consumer so the channel stays full.
        let (gate_tx, gate_rx) = channel::<()>();
        let dropped = Arc::new(AtomicU64::new(0));

        let (queue, handle) = DrainQueue::spawn(1, Arc::clone(&dropped), move |_bytes| {
            let _ = gate_rx.recv();
        });

        let mut rejected = 0u64;
        for _ in 0..4 {
            if !queue.enqueue(b"payload") {
                rejected += 1;
            }
        }
        assert!(rejected >= 1);
        assert_eq!(dropped.load(Ordering::Relaxed), rejected);

        for _ in 0..4 {
            let _ = gate_tx.send(());
        }
        drop(gate_tx);
        drop(queue);
        handle.join().unwrap();
    }

    #[test]
    fn consumer_drains_backlog_after_sender_drops() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let dropped = Arc::new(AtomicU64::new(0));

        let (queue, handle) = DrainQueue::spawn(128, dropped, move |bytes| {
            sink.lock().unwrap().push(bytes.to_vec());
        });
        for i in 0..100u8 {
            assert!(queue.enqueue(&[i]));
        }
        drop(queue);
        handle.join().unwrap();

        let collected = collected.lock().unwrap();
        assert_eq!(collected.len(), 100);
        assert_eq!(collected[99], vec![99]);
    }
}
