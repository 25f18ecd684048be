// SIGPORT — ENGINE: SPSC LOCK-FREE RING
// Wait-free bounded FIFO, power-of-two capacity, DPDK-style cached positions.
//
// Carries the endpoint's in-process hand-offs: payload records between the
// application threads and the TX/RX engines, outstanding-TX frame handles
// between the SRP engines, and freed frame indices back to the pool owner.
// Entries move through the ring by ownership transfer; the ring itself never
// owns what a popped entry refers to.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::engine::runtime::CachePadded;

struct SpscRing<T> {
    head: CachePadded<AtomicUsize>, // producer-written, consumer-read
    tail: CachePadded<AtomicUsize>, // consumer-written, producer-read
    capacity: usize,
    mask: usize,
    buffer: *mut T,
}

// SAFETY: single producer and single consumer, each on its own thread; both
// hold an Arc to the ring, so Sync is required alongside Send.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        // Both handles are gone by now, so the atomics hold final positions.
        // Entries still in flight must be dropped before the buffer is freed.
        let head = self.head.value.load(Ordering::Relaxed);
        let mut tail = self.tail.value.load(Ordering::Relaxed);
        while tail != head {
            // SAFETY: slots in [tail, head) were written and never read out.
            unsafe { std::ptr::drop_in_place(self.buffer.add(tail & self.mask)) };
            tail = tail.wrapping_add(1);
        }
        // SAFETY: buffer came from Vec::with_capacity(capacity) + forget.
        unsafe { drop(Vec::from_raw_parts(self.buffer, 0, self.capacity)) };
    }
}

pub struct Producer<T> {
    ring: Arc<SpscRing<T>>,
    local_head: usize,
    cached_tail: usize, // avoids a cross-core Acquire on every push
    capacity: usize,
    mask: usize,
}

pub struct Consumer<T> {
    ring: Arc<SpscRing<T>>,
    local_tail: usize,
    cached_head: usize, // avoids a cross-core Acquire on every pop
    mask: usize,
}

// SAFETY: each handle is used by exactly one thread.
unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

/// Create an SPSC ring pair. Capacity must be a power of two and at least 2.
pub fn make_spsc<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(
        capacity.is_power_of_two() && capacity >= 2,
        "spsc capacity must be a power of two >= 2, got {}",
        capacity
    );
    let mut vec: Vec<T> = Vec::with_capacity(capacity);
    let buffer = vec.as_mut_ptr();
    std::mem::forget(vec);

    let ring = Arc::new(SpscRing {
        head: CachePadded { value: AtomicUsize::new(0) },
        tail: CachePadded { value: AtomicUsize::new(0) },
        capacity,
        mask: capacity - 1,
        buffer,
    });

    (
        Producer { ring: ring.clone(), local_head: 0, cached_tail: 0, capacity, mask: capacity - 1 },
        Consumer { ring, local_tail: 0, cached_head: 0, mask: capacity - 1 },
    )
}

impl<T> Producer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free for staging. Refreshes the cached consumer
    /// position, so the answer reflects real cross-core availability.
    #[inline(always)]
    pub fn free_slots(&mut self) -> usize {
        self.cached_tail = self.ring.tail.value.load(Ordering::Acquire);
        self.capacity - self.local_head.wrapping_sub(self.cached_tail)
    }

    /// Entries staged (committed or not) and not yet consumed.
    #[inline(always)]
    pub fn len(&mut self) -> usize {
        self.cached_tail = self.ring.tail.value.load(Ordering::Acquire);
        self.local_head.wrapping_sub(self.cached_tail)
    }

    #[inline(always)]
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Write an entry without publishing it. Only crosses the interconnect
    /// when the cached consumer position says the ring looks full.
    #[inline(always)]
    pub fn stage(&mut self, item: T) -> Result<(), T> {
        if self.local_head.wrapping_sub(self.cached_tail) == self.capacity {
            self.cached_tail = self.ring.tail.value.load(Ordering::Acquire);
            if self.local_head.wrapping_sub(self.cached_tail) == self.capacity {
                return Err(item);
            }
        }
        // SAFETY: the slot at local_head is free (checked above) and masked
        // into buffer bounds.
        unsafe { self.ring.buffer.add(self.local_head & self.mask).write(item) };
        self.local_head = self.local_head.wrapping_add(1);
        Ok(())
    }

    /// Publish everything staged so far. One Release barrier per batch.
    #[inline(always)]
    pub fn commit(&mut self) {
        self.ring.head.value.store(self.local_head, Ordering::Release);
    }

    /// Stage and publish a single entry.
    #[inline(always)]
    pub fn push(&mut self, item: T) -> Result<(), T> {
        self.stage(item)?;
        self.commit();
        Ok(())
    }
}

impl<T: Copy> Producer<T> {
    /// Copy out every published-but-unconsumed entry, oldest first.
    ///
    /// The consumer may pop concurrently; both sides only read the slots
    /// (pop does not write), so the worst outcome is that the snapshot
    /// includes an entry consumed a moment later. SRP retransmission relies
    /// on exactly that tolerance: a just-acknowledged frame may be resent
    /// once and is dropped by the peer as stale.
    pub fn snapshot_unconsumed(&mut self, out: &mut Vec<T>) -> usize {
        out.clear();
        self.cached_tail = self.ring.tail.value.load(Ordering::Acquire);
        let mut pos = self.cached_tail;
        while pos != self.local_head {
            // SAFETY: slots in [tail, local_head) hold initialized T; T: Copy
            // so the read does not duplicate ownership of a resource.
            out.push(unsafe { self.ring.buffer.add(pos & self.mask).read() });
            pos = pos.wrapping_add(1);
        }
        out.len()
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        // Publish staged entries so the ring's Drop sees (and drops) them.
        self.commit();
    }
}

impl<T> Consumer<T> {
    /// Entries available to pop. Refreshes the cached producer position.
    #[inline(always)]
    pub fn len(&mut self) -> usize {
        self.cached_head = self.ring.head.value.load(Ordering::Acquire);
        self.cached_head.wrapping_sub(self.local_tail)
    }

    #[inline(always)]
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Option<T> {
        if self.cached_head == self.local_tail {
            self.cached_head = self.ring.head.value.load(Ordering::Acquire);
            if self.cached_head == self.local_tail {
                return None;
            }
        }
        // SAFETY: the slot at local_tail was published by the producer.
        let item = unsafe { self.ring.buffer.add(self.local_tail & self.mask).read() };
        self.local_tail = self.local_tail.wrapping_add(1);
        self.ring.tail.value.store(self.local_tail, Ordering::Release);
        Some(item)
    }

    /// Pop up to `max` entries into `out`. One Release barrier per batch.
    pub fn pop_batch(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let mut avail = self.cached_head.wrapping_sub(self.local_tail);
        if avail == 0 {
            self.cached_head = self.ring.head.value.load(Ordering::Acquire);
            avail = self.cached_head.wrapping_sub(self.local_tail);
        }
        let n = avail.min(max);
        for _ in 0..n {
            // SAFETY: slots in [local_tail, head) were published.
            out.push(unsafe { self.ring.buffer.add(self.local_tail & self.mask).read() });
            self.local_tail = self.local_tail.wrapping_add(1);
        }
        if n > 0 {
            self.ring.tail.value.store(self.local_tail, Ordering::Release);
        }
        n
    }
}

impl<T: Copy> Consumer<T> {
    /// Zero-copy dequeue, phase one: borrow the available entries as up to
    /// two contiguous spans (second span is the wraparound). Nothing is
    /// consumed until `release`.
    pub fn peek_spans(&mut self) -> (&[T], &[T]) {
        self.cached_head = self.ring.head.value.load(Ordering::Acquire);
        let avail = self.cached_head.wrapping_sub(self.local_tail);
        let start = self.local_tail & self.mask;
        let first = avail.min(self.mask + 1 - start);
        // SAFETY: [start, start+first) and [0, avail-first) cover exactly the
        // published-unconsumed slots; the producer cannot overwrite them
        // until local_tail advances.
        unsafe {
            (
                std::slice::from_raw_parts(self.ring.buffer.add(start), first),
                std::slice::from_raw_parts(self.ring.buffer, avail - first),
            )
        }
    }

    /// Zero-copy dequeue, phase two: hand the first `n` peeked slots back to
    /// the producer.
    pub fn release(&mut self, n: usize) {
        debug_assert!(n <= self.cached_head.wrapping_sub(self.local_tail));
        self.local_tail = self.local_tail.wrapping_add(n);
        self.ring.tail.value.store(self.local_tail, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let (mut p, mut c) = make_spsc::<u32>(8);
        for i in 0..8 {
            p.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(c.pop(), Some(i));
        }
        assert_eq!(c.pop(), None);
    }

    #[test]
    fn full_ring_rejects_then_accepts() {
        let (mut p, mut c) = make_spsc::<u32>(2);
        p.push(1).unwrap();
        p.push(2).unwrap();
        assert_eq!(p.push(3), Err(3));
        assert_eq!(c.pop(), Some(1));
        p.push(3).unwrap();
        assert_eq!(c.pop(), Some(2));
        assert_eq!(c.pop(), Some(3));
    }

    #[test]
    fn wraparound_many_times() {
        let (mut p, mut c) = make_spsc::<usize>(4);
        for i in 0..1000 {
            p.push(i).unwrap();
            assert_eq!(c.pop(), Some(i));
        }
    }

    #[test]
    fn staged_invisible_until_commit() {
        let (mut p, mut c) = make_spsc::<u32>(8);
        p.stage(7).unwrap();
        assert_eq!(c.pop(), None);
        p.commit();
        assert_eq!(c.pop(), Some(7));
    }

    #[test]
    fn batch_pop_respects_max() {
        let (mut p, mut c) = make_spsc::<u32>(8);
        for i in 0..6 {
            p.push(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(c.pop_batch(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(c.pop_batch(&mut out, 4), 2);
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn snapshot_sees_unconsumed() {
        let (mut p, mut c) = make_spsc::<u32>(8);
        for i in 0..5 {
            p.push(i).unwrap();
        }
        c.pop();
        c.pop();
        let mut snap = Vec::new();
        assert_eq!(p.snapshot_unconsumed(&mut snap), 3);
        assert_eq!(snap, vec![2, 3, 4]);
    }

    #[test]
    fn peek_spans_cover_wraparound() {
        let (mut p, mut c) = make_spsc::<u32>(4);
        for i in 0..4 {
            p.push(i).unwrap();
        }
        c.pop();
        c.pop();
        p.push(4).unwrap();
        p.push(5).unwrap();
        let (a, b) = c.peek_spans();
        let joined: Vec<u32> = a.iter().chain(b.iter()).copied().collect();
        assert_eq!(joined, vec![2, 3, 4, 5]);
        let n = a.len();
        c.release(n);
        assert_eq!(c.pop(), Some(4));
    }

    #[test]
    fn owned_entries_dropped_with_ring() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        #[derive(Debug)]
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }
        let (mut p, c) = make_spsc::<Tracked>(4);
        p.push(Tracked).unwrap();
        p.push(Tracked).unwrap();
        drop(p);
        drop(c);
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
    }

    #[test]
    #[should_panic]
    fn capacity_one_rejected() {
        let _ = make_spsc::<u32>(1);
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_rejected() {
        let _ = make_spsc::<u32>(6);
    }

    #[test]
    fn cross_thread_fifo() {
        let (mut p, mut c) = make_spsc::<u64>(256);
        let t = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                let mut v = i;
                while let Err(back) = p.push(v) {
                    v = back;
                    std::hint::spin_loop();
                }
            }
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = c.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        t.join().unwrap();
    }
}
