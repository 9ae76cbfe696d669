//! Lock-free single-producer single-consumer ring buffer.
//!
//! Enqueue is wait-free and allocation-free, so it is safe to call from an
//! interrupt handler; a full queue is reported back to the producer, which
//! decides whether to drop and count. Capacity is fixed at construction
//! (drivers size their queues from the hardware channel count).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct SpscQueue<T: Copy> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// One producer and one consumer may touch the queue from different contexts;
// slot handoff is ordered by the head/tail release stores.
unsafe impl<T: Copy + Send> Send for SpscQueue<T> {}
unsafe impl<T: Copy + Send> Sync for SpscQueue<T> {}

impl<T: Copy> SpscQueue<T> {
    /// Create a queue holding up to `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        // One slot is sacrificed to distinguish full from empty.
        let slots = capacity.max(1) + 1;
        let mut buf = Vec::with_capacity(slots);
        buf.resize_with(slots, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            buf: buf.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Usable capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.buf.len() - head) % self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Returns the value back if the queue is full.
    pub fn try_enqueue(&self, v: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let next = (tail + 1) % self.buf.len();
        if next == head {
            return Err(v);
        }
        unsafe {
            (*self.buf[tail].get()).write(v);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn try_dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let v = unsafe { (*self.buf[head].get()).assume_init() };
        self.head.store((head + 1) % self.buf.len(), Ordering::Release);
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = SpscQueue::new(4);
        for i in 0..4u32 {
            q.try_enqueue(i).unwrap();
        }
        for i in 0..4u32 {
            assert_eq!(q.try_dequeue(), Some(i));
        }
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn test_overflow_reports_value() {
        let q = SpscQueue::new(2);
        q.try_enqueue(1u8).unwrap();
        q.try_enqueue(2u8).unwrap();
        assert_eq!(q.try_enqueue(3u8), Err(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_wraparound() {
        let q = SpscQueue::new(3);
        for round in 0..10u32 {
            q.try_enqueue(round).unwrap();
            assert_eq!(q.try_dequeue(), Some(round));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_cross_thread() {
        use std::sync::Arc;
        let q = Arc::new(SpscQueue::new(64));
        let prod = q.clone();
        let t = std::thread::spawn(move || {
            for i in 0..1000u32 {
                while prod.try_enqueue(i).is_err() {
                    std::thread::yield_now();
                }
            }
        });
        let mut next = 0u32;
        while next < 1000 {
            if let Some(v) = q.try_dequeue() {
                assert_eq!(v, next);
                next += 1;
            }
        }
        t.join().unwrap();
    }
}
