//! TokenBucket hierarchy (spec.md §4.1/§4.2).
//!
//! The donor's `TokenBucket` parent link is a non-owning weak reference on the assumption the
//! client root outlives every child bucket. Modeling that directly in safe Rust means either a
//! reference-counted cycle or a borrow tied to the owner's lifetime — spec.md §9 explicitly asks
//! us not to do the former. Instead every bucket lives in a `BucketSlab` and refers to its parent
//! by `BucketId` index; the slab is owned by `ClientEgress` for exactly as long as the buckets
//! are valid, and indices are meaningless once the slab that produced them is dropped.

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BucketId(usize);

/// A single-rate token bucket. Tokens consumed from a child also debit every ancestor in the
/// chain (`BucketSlab::remove_tokens`); this struct alone just tracks one node's accounting.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    requested_drip_rate: f64,
    current_drip_rate: f64,
    burst_rate: f64,
    tokens: f64,
    last_drip_tick: i32,
    parent: Option<BucketId>,
}

impl TokenBucket {
    pub fn requested_drip_rate(&self) -> f64 {
        self.requested_drip_rate
    }

    pub fn current_drip_rate(&self) -> f64 {
        self.current_drip_rate
    }

    pub fn burst_rate(&self) -> f64 {
        self.burst_rate
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Computes the elapsed milliseconds between two tick-clock readings, tolerant of the wraparound
/// described in spec.md §6 (`clock.tick_count()` is masked with `0x7FFF_FFFF`).
fn elapsed_ms(last: i32, now: i32) -> f64 {
    let diff = now as i64 - last as i64;
    let diff = if diff < 0 { diff + 0x8000_0000i64 } else { diff };
    diff as f64
}

/// Owns every `TokenBucket` in one client's hierarchy, addressed by `BucketId`.
#[derive(Debug, Default)]
pub struct BucketSlab {
    buckets: Vec<TokenBucket>,
}

impl BucketSlab {
    pub fn new() -> BucketSlab {
        BucketSlab { buckets: Vec::new() }
    }

    /// Inserts a new bucket. `parent` must have been returned by this same slab.
    pub fn insert(&mut self, parent: Option<BucketId>, requested_drip_rate: f64, now: i32) -> BucketId {
        let id = BucketId(self.buckets.len());
        self.buckets.push(TokenBucket {
            requested_drip_rate,
            current_drip_rate: requested_drip_rate,
            burst_rate: requested_drip_rate,
            tokens: 0.0,
            last_drip_tick: now,
            parent,
        });
        id
    }

    pub fn get(&self, id: BucketId) -> &TokenBucket {
        &self.buckets[id.0]
    }

    pub fn requested_drip_rate(&self, id: BucketId) -> f64 {
        self.buckets[id.0].requested_drip_rate
    }

    pub fn burst_rate(&self, id: BucketId) -> f64 {
        self.buckets[id.0].burst_rate
    }

    /// Stores a new target rate. `current_drip_rate` is recomputed lazily the next time the
    /// chain drips, clamped against the parent's *then-current* rate (spec.md §4.1).
    pub fn set_requested_drip_rate(&mut self, id: BucketId, rate: f64) {
        self.buckets[id.0].requested_drip_rate = rate;
    }

    /// Explicit drip with no token consumption, mirroring the donor's `drip()` entry point.
    pub fn drip(&mut self, id: BucketId, now: i32) {
        self.drip_chain(id, now);
    }

    fn drip_chain(&mut self, id: BucketId, now: i32) {
        if let Some(parent) = self.buckets[id.0].parent {
            self.drip_chain(parent, now);
        }

        let parent_rate = self.buckets[id.0].parent.map(|p| self.buckets[p.0].current_drip_rate);

        let bucket = &mut self.buckets[id.0];
        bucket.current_drip_rate = match parent_rate {
            Some(parent_rate) => bucket.requested_drip_rate.min(parent_rate),
            None => bucket.requested_drip_rate,
        };
        bucket.burst_rate = bucket.current_drip_rate;
        bucket.tokens = bucket.tokens.min(bucket.burst_rate);

        let elapsed = elapsed_ms(bucket.last_drip_tick, now);
        bucket.tokens = (bucket.tokens + bucket.current_drip_rate * elapsed / 1000.0).min(bucket.burst_rate);
        bucket.last_drip_tick = now;
    }

    /// Attempts to consume `n` tokens from `id` and every ancestor. Returns `true` iff the whole
    /// chain currently holds at least `n` tokens, in which case all of them are debited
    /// atomically (with respect to this call — see spec.md §5 for the concurrency caveat under
    /// real contention).
    pub fn remove_tokens(&mut self, id: BucketId, n: u32, now: i32) -> bool {
        self.drip_chain(id, now);

        let mut chain = Vec::with_capacity(4);
        chain.push(id);
        let mut cursor = self.buckets[id.0].parent;
        while let Some(parent) = cursor {
            chain.push(parent);
            cursor = self.buckets[parent.0].parent;
        }

        let n = n as f64;
        if chain.iter().all(|bid| self.buckets[bid.0].tokens >= n) {
            for bid in &chain {
                self.buckets[bid.0].tokens -= n;
            }
            true
        } else {
            false
        }
    }
}

/// The client-root bucket. Adds a floor/ceiling and the `slow_down`/`ramp_up` adaptation hooks
/// the dequeue loop drives off observed send pressure (spec.md §4.2).
#[derive(Debug, Copy, Clone)]
pub struct AdaptiveTokenBucket {
    root: BucketId,
    min_rate: f64,
    max_rate: f64,
    start_rate: f64,
}

impl AdaptiveTokenBucket {
    pub fn new(
        slab: &mut BucketSlab,
        start_rate: f64,
        min_rate: f64,
        max_rate: f64,
        now: i32,
    ) -> AdaptiveTokenBucket {
        let clamped_start = start_rate.max(min_rate).min(max_rate);
        let root = slab.insert(None, clamped_start, now);
        AdaptiveTokenBucket {
            root,
            min_rate,
            max_rate,
            start_rate: clamped_start,
        }
    }

    pub fn root(&self) -> BucketId {
        self.root
    }

    pub fn start_rate(&self) -> f64 {
        self.start_rate
    }

    /// Called under detected loss/congestion: `requested <- max(MIN, burst * 0.95)`.
    pub fn slow_down(&self, slab: &mut BucketSlab, now: i32) {
        slab.drip(self.root, now);
        let burst = slab.burst_rate(self.root);
        let new_rate = (burst * 0.95).max(self.min_rate).min(self.max_rate);
        slab.set_requested_drip_rate(self.root, new_rate);
    }

    /// `requested <- requested * 1.005`, clamped to `MAX`. Per spec.md §4.2 this is only called
    /// by the dequeue loop after a successful send while the rate is still below
    /// `start_rate` — that gating lives in `ClientEgress`, not here, so this always applies the
    /// multiplicative increase unconditionally once invoked.
    pub fn ramp_up(&self, slab: &mut BucketSlab) {
        let requested = slab.requested_drip_rate(self.root);
        let new_rate = (requested * 1.005).min(self.max_rate).max(self.min_rate);
        slab.set_requested_drip_rate(self.root, new_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drip_accrues_tokens_over_time() {
        let mut slab = BucketSlab::new();
        let id = slab.insert(None, 1_000.0, 0);

        // 500 ms at 1000 B/s should add ~500 tokens.
        slab.drip(id, 500);
        assert!((slab.get(id).tokens() - 500.0).abs() < 1e-6);
    }

    #[test]
    fn tokens_saturate_at_burst_rate() {
        let mut slab = BucketSlab::new();
        let id = slab.insert(None, 1_000.0, 0);

        slab.drip(id, 10_000);
        assert_eq!(slab.get(id).tokens(), slab.get(id).burst_rate());
    }

    #[test]
    fn remove_tokens_requires_the_whole_chain() {
        let mut slab = BucketSlab::new();
        let parent = slab.insert(None, 100.0, 0);
        let child = slab.insert(Some(parent), 100.0, 0);

        // Not enough time has passed to accrue any tokens yet.
        assert!(!slab.remove_tokens(child, 1, 0));

        // After a second, both parent and child should have ~100 tokens.
        assert!(slab.remove_tokens(child, 50, 1_000));
        assert!((slab.get(parent).tokens() - 50.0).abs() < 1e-6);
        assert!((slab.get(child).tokens() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn child_rate_is_clamped_to_parent_rate() {
        let mut slab = BucketSlab::new();
        let parent = slab.insert(None, 1_000.0, 0);
        let child = slab.insert(Some(parent), 5_000.0, 0);

        slab.drip(child, 1);
        assert_eq!(slab.get(child).current_drip_rate(), 1_000.0);
    }

    #[test]
    fn hierarchical_clamp_bounds_sibling_totals() {
        // S3: parent rate 10_000 B/s, two children each requesting 8_000 B/s.
        let mut slab = BucketSlab::new();
        let parent = slab.insert(None, 10_000.0, 0);
        let a = slab.insert(Some(parent), 8_000.0, 0);
        let b = slab.insert(Some(parent), 8_000.0, 0);

        let mut admitted_a = 0u32;
        let mut admitted_b = 0u32;
        let mut now = 0;
        while now <= 10_000 {
            if slab.remove_tokens(a, 100, now) {
                admitted_a += 100;
            }
            if slab.remove_tokens(b, 100, now) {
                admitted_b += 100;
            }
            now += 100;
        }

        let burst = slab.get(parent).burst_rate();
        assert!((admitted_a + admitted_b) as f64 <= 10_000.0 * 10.0 + burst + 1.0);
    }

    #[test]
    fn adaptive_bucket_never_escapes_bounds() {
        let mut slab = BucketSlab::new();
        let bucket = AdaptiveTokenBucket::new(&mut slab, 25_000.0, 6_250.0, 625_000.0, 0);

        for tick in 0..200 {
            bucket.slow_down(&mut slab, tick * 100);
        }
        assert!(slab.requested_drip_rate(bucket.root()) >= 6_250.0);

        for tick in 0..5_000 {
            bucket.ramp_up(&mut slab);
            slab.drip(bucket.root(), tick * 100);
        }
        assert_eq!(slab.requested_drip_rate(bucket.root()), 625_000.0);
    }
}
