//! Timer queue: task terjadwal berdasarkan absolute due time
//!
//! Min-heap by (due, seq). `seq` menjaga urutan FIFO untuk due time yang sama.
//! Cancel hanya set flag; entry yang cancelled dibuang saat di-pop.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle untuk membatalkan timer, aman dipakai dari thread mana pun
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Batalkan timer. Kalau task sedang jalan, repeat berikutnya tidak dijadwalkan.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Satu task terjadwal. `interval == 0` berarti one-shot.
pub struct TimerEvent {
    due: Instant,
    interval: Duration,
    task: Box<dyn FnMut()>,
    handle: TimerHandle,
}

impl TimerEvent {
    pub fn new<F>(due: Instant, interval: Duration, task: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self::with_handle(due, interval, task, TimerHandle::new())
    }

    pub(crate) fn with_handle<F>(due: Instant, interval: Duration, task: F, handle: TimerHandle) -> Self
    where
        F: FnMut() + 'static,
    {
        Self {
            due,
            interval,
            task: Box::new(task),
            handle,
        }
    }

    #[inline(always)]
    pub fn due(&self) -> Instant {
        self.due
    }

    #[inline(always)]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline(always)]
    pub fn is_repeating(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    fn run(&mut self) {
        (self.task)();
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Antrian timer milik satu `EventLoop`
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TimerEvent) -> TimerHandle {
        let handle = event.handle();
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse(Entry {
            due: event.due,
            seq,
            event,
        }));
        handle
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Due time timer terdekat yang belum cancelled
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.event.handle.is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(top.due);
        }
        None
    }

    /// Waktu tunggu sampai timer terdekat, untuk timeout poll
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.next_due()
            .map(|due| due.saturating_duration_since(now))
    }

    /// Pop semua timer yang sudah jatuh tempo (cancelled dibuang)
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.due > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                if !entry.event.handle.is_cancelled() {
                    expired.push(entry.event);
                }
            }
        }
        expired
    }
}

/// Jalankan timer yang expired lalu kembalikan yang harus dijadwalkan ulang.
///
/// Dipisah dari `TimerQueue` supaya task boleh menambah timer baru ke queue
/// yang sama tanpa konflik borrow.
pub fn run_expired(expired: Vec<TimerEvent>, now: Instant) -> Vec<TimerEvent> {
    let mut again = Vec::new();
    for mut event in expired {
        if event.handle.is_cancelled() {
            continue;
        }
        event.run();
        if event.is_repeating() && !event.handle.is_cancelled() {
            event.due = now + event.interval;
            again.push(event);
        }
    }
    again
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_pop_in_due_order() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (i, ms) in [30u64, 10, 20].iter().enumerate() {
            let o = order.clone();
            q.push(TimerEvent::new(
                base + Duration::from_millis(*ms),
                Duration::ZERO,
                move || o.borrow_mut().push(i),
            ));
        }

        let expired = q.pop_expired(base + Duration::from_millis(25));
        assert_eq!(expired.len(), 2);
        assert!(run_expired(expired, base).is_empty());
        assert_eq!(*order.borrow(), vec![1, 0]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_cancelled_timer_is_skipped() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let handle = q.push(TimerEvent::new(now, Duration::ZERO, move || h.set(h.get() + 1)));
        handle.cancel();

        assert_eq!(q.next_due(), None);
        let expired = q.pop_expired(now + Duration::from_millis(1));
        run_expired(expired, now);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_repeating_timer_is_rescheduled_from_now() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        q.push(TimerEvent::new(now, Duration::from_millis(50), move || {
            h.set(h.get() + 1)
        }));

        let later = now + Duration::from_millis(5);
        let again = run_expired(q.pop_expired(later), later);
        assert_eq!(hits.get(), 1);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].due(), later + Duration::from_millis(50));
    }

    #[test]
    fn test_poll_timeout() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        assert_eq!(q.poll_timeout(now), None);
        q.push(TimerEvent::new(now + Duration::from_millis(40), Duration::ZERO, || {}));
        assert_eq!(q.poll_timeout(now), Some(Duration::from_millis(40)));
        // Sudah lewat -> nol, bukan underflow
        assert_eq!(
            q.poll_timeout(now + Duration::from_millis(100)),
            Some(Duration::ZERO)
        );
    }
}
