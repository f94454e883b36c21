//! Hand-rolled concurrency primitives shared by the scheduler and the
//! public API: a counting semaphore and the bounded output chunk queue.
//! Built on `parking_lot` rather than an async runtime's semaphore, since
//! the pipeline runs on plain native threads with no cooperative suspension.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::mux::MuxedGof;

/// A classic counting semaphore: `acquire` decrements unconditionally and
/// blocks while the count is negative, so the permit count below zero
/// reflects how many callers are currently waiting.
pub struct Semaphore {
    permits: Mutex<isize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: isize) -> Self {
        Self {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        *permits -= 1;
        while *permits < 0 {
            self.available.wait(&mut permits);
        }
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        if *permits <= 0 {
            self.available.notify_one();
        }
    }

    pub fn count(&self) -> isize {
        *self.permits.lock()
    }
}

/// The bounded, mutex-protected FIFO of finished GOF chunks consumed by an
/// external writer, signalled by a counting semaphore. Each chunk keeps the
/// V3C unit-size precision its GOF required; the running max across all
/// pushed chunks is the precision the final serialized bitstream uses.
pub struct OutputQueue {
    chunks: Mutex<VecDeque<MuxedGof>>,
    running_precision: Mutex<u8>,
    available: Semaphore,
    closed: Mutex<bool>,
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            running_precision: Mutex::new(1),
            available: Semaphore::new(0),
            closed: Mutex::new(false),
        }
    }
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: MuxedGof) {
        let mut precision = self.running_precision.lock();
        *precision = (*precision).max(chunk.precision);
        self.chunks.lock().push_back(chunk);
        self.available.release();
    }

    /// Block until a chunk is available, then pop it.
    pub fn pop(&self) -> MuxedGof {
        self.available.acquire();
        self.chunks
            .lock()
            .pop_front()
            .expect("semaphore permit guarantees a chunk is present")
    }

    /// Mark the queue as finished: no more chunks will ever be pushed. Wakes
    /// a consumer blocked in [`Self::pop_until_closed`] so it can observe the
    /// end of the stream instead of depending on momentary emptiness.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.available.release();
    }

    /// Block until either a chunk is available (`Some`) or the queue has
    /// been [`close`](Self::close)d and drained (`None`). Unlike checking
    /// [`Self::is_empty`] after a [`Self::pop`], this never mistakes a
    /// transient gap between a concurrent producer's pushes for the end of
    /// the stream.
    pub fn pop_until_closed(&self) -> Option<MuxedGof> {
        self.available.acquire();
        if let Some(chunk) = self.chunks.lock().pop_front() {
            return Some(chunk);
        }
        debug_assert!(*self.closed.lock(), "wakeup with no chunk implies close() fired");
        None
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The precision the final serialized sample stream should use: the max
    /// observed across every chunk pushed so far.
    pub fn running_precision(&self) -> u8 {
        *self.running_precision.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicIsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn semaphore_blocks_past_zero_and_releases() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire();
        assert_eq!(sem.count(), 0);

        let sem2 = Arc::clone(&sem);
        let blocked = Arc::new(AtomicIsize::new(0));
        let blocked2 = Arc::clone(&blocked);
        let handle = std::thread::spawn(move || {
            sem2.acquire();
            blocked2.store(1, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(blocked.load(Ordering::SeqCst), 0);
        assert_eq!(sem.count(), -1);

        sem.release();
        handle.join().unwrap();
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_queue_pop_blocks_until_pushed() {
        let queue = Arc::new(OutputQueue::new());
        let queue2 = Arc::clone(&queue);
        let handle = std::thread::spawn(move || queue2.pop());
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.push(MuxedGof {
            chunk: crate::model::V3cChunk {
                data: vec![1, 2, 3],
                unit_sizes: vec![3],
            },
            precision: 1,
        });
        let chunk = handle.join().unwrap();
        assert_eq!(chunk.chunk.data, vec![1, 2, 3]);
    }

    fn chunk(byte: u8) -> MuxedGof {
        MuxedGof {
            chunk: crate::model::V3cChunk {
                data: vec![byte],
                unit_sizes: vec![1],
            },
            precision: 1,
        }
    }

    #[test]
    fn pop_until_closed_drains_every_chunk_then_stops() {
        let queue = OutputQueue::new();
        queue.push(chunk(1));
        queue.push(chunk(2));
        queue.close();

        assert_eq!(queue.pop_until_closed().unwrap().chunk.data, vec![1]);
        assert_eq!(queue.pop_until_closed().unwrap().chunk.data, vec![2]);
        assert!(queue.pop_until_closed().is_none());
    }

    #[test]
    fn pop_until_closed_survives_a_transient_gap_before_the_next_push() {
        // A consumer racing a concurrent producer must not mistake a
        // momentary empty queue for the end of the stream.
        let queue = Arc::new(OutputQueue::new());
        let queue2 = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            let first = queue2.pop_until_closed().unwrap();
            let second = queue2.pop_until_closed().unwrap();
            assert!(queue2.pop_until_closed().is_none());
            (first.chunk.data, second.chunk.data)
        });

        queue.push(chunk(1));
        std::thread::sleep(std::time::Duration::from_millis(30)); // queue goes empty here
        queue.push(chunk(2));
        queue.close();

        let (first, second) = handle.join().unwrap();
        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2]);
    }
}
