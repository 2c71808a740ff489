//! Multi-level priority queue with anti-starvation promotion (spec.md §4.3).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

/// A queued payload: either a concrete packet, or a lazy producer that may not have anything to
/// hand back yet. Modeled as a tagged variant rather than a trait object with a `materialize`
/// method so `PriorityQueue` doesn't need to know anything about `T` beyond moving it around
/// (spec.md §9 Design Notes).
pub enum Item<T> {
    Ready(T),
    Lazy(Box<dyn FnMut() -> Option<T> + Send>),
}

impl<T> Item<T> {
    /// Attempts to produce the queued value. `Ready` always succeeds. `Lazy` may decline — in
    /// that case the `Item` is handed back unchanged so the queue can retry it later without
    /// losing its place.
    fn try_materialize(mut self) -> Result<T, Item<T>> {
        match self {
            Item::Ready(value) => Ok(value),
            Item::Lazy(ref mut producer) => match producer() {
                Some(value) => Ok(value),
                None => Err(self),
            },
        }
    }
}

/// An `N`-level multi-queue. Ties within a level are FIFO; across levels, strict priority order
/// applies at dequeue subject to promotion.
pub struct PriorityQueue<T> {
    levels: Vec<VecDeque<Item<T>>>,
    promotion_counters: Vec<u32>,
    promotion_mask: u32,
    count: AtomicU32,
}

impl<T> PriorityQueue<T> {
    pub fn new(level_count: usize, promotion_mask: u32) -> PriorityQueue<T> {
        let mut levels = Vec::with_capacity(level_count);
        for _ in 0..level_count {
            levels.push(VecDeque::new());
        }

        PriorityQueue {
            levels,
            promotion_counters: vec![0; level_count],
            promotion_mask,
            count: AtomicU32::new(0),
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Best-effort queue depth — see spec.md §5: not safe to use for correctness, only as a
    /// backpressure hint.
    pub fn len(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `false` iff `priority >= N`, in which case the item is not enqueued.
    pub fn enqueue(&mut self, priority: u8, item: Item<T>) -> bool {
        let level = priority as usize;
        if level >= self.levels.len() {
            return false;
        }

        self.levels[level].push_back(item);
        self.count.fetch_add(1, Ordering::Relaxed);

        self.promotion_counters[level] = self.promotion_counters[level].wrapping_add(1);
        if self.promotion_counters[level] & self.promotion_mask == 0 {
            self.promote_below(level);
        }

        true
    }

    /// After every `(promotion_mask + 1)`th enqueue at `level`, lift one head item from every
    /// non-empty level below it up by exactly one level. This is what keeps a low-priority item
    /// moving toward the top instead of stalling behind a steady stream of higher-priority work.
    fn promote_below(&mut self, level: usize) {
        let mut i = level;
        while i > 0 {
            i -= 1;
            if let Some(item) = self.levels[i].pop_front() {
                self.levels[i + 1].push_back(item);
            }
        }
    }

    /// Removes and returns the highest-priority available item. Scans from the top level down;
    /// within a level, items that decline to materialize are retried (bounded by the level's
    /// size at the start of the scan) before moving to the next level down, without decrementing
    /// `count` for the ones that declined.
    pub fn dequeue(&mut self) -> Option<T> {
        for level in (0..self.levels.len()).rev() {
            let attempts = self.levels[level].len();
            for _ in 0..attempts {
                if let Some(item) = self.levels[level].pop_front() {
                    match item.try_materialize() {
                        Ok(value) => {
                            self.count.fetch_sub(1, Ordering::Relaxed);
                            return Some(value);
                        }
                        Err(item) => self.levels[level].push_back(item),
                    }
                }
            }
        }

        None
    }
}
