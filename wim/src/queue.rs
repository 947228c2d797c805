//! A bounded blocking queue for handing work between the I/O thread and the compressor
//! threads.
//!
//! Backed by a bounded channel whose two endpoints are kept together, so a clone can both put
//! and get. `put` blocks while the queue is full, `get` while it is empty; that is the entire
//! back-pressure mechanism of the parallel pipeline. Shutdown is by value: the pipeline sends
//! one `None` sentinel per consumer.

use crossbeam_channel::{bounded, Receiver, Sender};

pub(crate) struct SharedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> SharedQueue<T> {
    /// A queue holding at most `size` values.
    pub(crate) fn new(size: usize) -> Self {
        assert!(size != 0);
        let (tx, rx) = bounded(size);
        Self { tx, rx }
    }

    /// Enqueues a value, blocking while the queue is full.
    pub(crate) fn put(&self, value: T) {
        // Cannot disconnect: every clone holds both endpoints.
        self.tx.send(value).expect("queue endpoints dropped");
    }

    /// Dequeues a value, blocking while the queue is empty.
    pub(crate) fn get(&self) -> T {
        self.rx.recv().expect("queue endpoints dropped")
    }
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = SharedQueue::new(4);
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.get(), 1);
        assert_eq!(q.get(), 2);
        assert_eq!(q.get(), 3);
    }

    #[test]
    fn put_blocks_when_full_until_a_get() {
        let q = SharedQueue::new(1);
        q.put(1u32);

        let q2 = q.clone();
        let producer = std::thread::spawn(move || {
            // Blocks until the main thread drains a slot.
            q2.put(2);
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished(), "put must block while full");
        assert_eq!(q.get(), 1);
        producer.join().unwrap();
        assert_eq!(q.get(), 2);
    }

    #[test]
    fn sentinels_wake_every_consumer() {
        let q: SharedQueue<Option<u32>> = SharedQueue::new(4);
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || while q.get().is_some() {})
            })
            .collect();
        for _ in 0..3 {
            q.put(None);
        }
        for c in consumers {
            c.join().unwrap();
        }
    }
}
