//! Tunables and runtime collaborators for the egress subsystem. Mirrors `gamecore::config::
//! GameConfig`'s shape: a `serde`-deserializable struct with a `Default` that reproduces every
//! constant the spec hardcodes, loadable from a TOML file via `serdeconv` so a deployment can
//! override individual values without touching code.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Number of priority levels in the `PriorityQueue` (priorities `0..=7`).
pub const PRIORITY_LEVELS: usize = 8;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct EgressConfig {
    /// Floor on `AdaptiveTokenBucket`'s requested drip rate, bytes/sec.
    pub min_per_client_rate: u32,
    /// Ceiling on `AdaptiveTokenBucket`'s requested drip rate, bytes/sec.
    pub max_per_client_rate: u32,
    /// Starting requested drip rate for a freshly connected client, bytes/sec.
    pub start_per_client_rate: u32,
    /// Bitmask tested against the per-level enqueue counter to decide when to promote.
    /// `0x01` promotes every 2 enqueues at a level; `0xFFFF_FFFF` never promotes.
    pub promotion_mask: u32,
    /// RTO floor, per RFC 2988.
    pub default_rto_ms: u32,
    /// RTO ceiling; backoff saturates here.
    pub max_rto_ms: u32,
    /// `tick_resolution` term in the RTO formula: `RTO = clamp(SRTT + max(res, K*RTTVAR), ...)`.
    pub tick_resolution_ms: u32,
    /// Minimum spacing between two `on_queue_empty` dispatches.
    pub min_callback_ms: u32,
    /// Baseline packet count requested per `on_queue_empty` callback.
    pub prim_updates_per_callback: i64,
    /// Queue depth at/below which the empty-queue signal is considered for firing.
    pub queue_low_water_mark: u32,
    /// Number of dequeue ticks spent above the low-water mark before firing anyway.
    pub queue_empty_tick_threshold: u32,
}

impl Default for EgressConfig {
    fn default() -> EgressConfig {
        EgressConfig {
            min_per_client_rate: 6_250,
            max_per_client_rate: 625_000,
            start_per_client_rate: 25_000,
            promotion_mask: 0x01,
            default_rto_ms: 1_000,
            max_rto_ms: 60_000,
            tick_resolution_ms: 100,
            min_callback_ms: 50,
            prim_updates_per_callback: 100,
            queue_low_water_mark: 100,
            queue_empty_tick_threshold: 10,
        }
    }
}

impl EgressConfig {
    /// Loads a config from a TOML file, falling back to nothing — callers that want defaults
    /// should just use `EgressConfig::default()`.
    pub fn load<P: AsRef<Path>>(path: P) -> EgressConfig {
        serdeconv::from_toml_file(path).expect("Error loading egress configuration file")
    }
}

/// Monotonic millisecond tick source. Spec.md §6: `clock.tick_count() -> i32`, wraparound
/// tolerant, always masked with `0x7FFF_FFFF`.
pub trait Clock {
    fn tick_count(&self) -> i32;
}

/// Fire-and-forget background task submission. Spec.md §6: `executor.spawn(closure)`.
pub trait Executor {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>);
}

/// Default `Clock` backed by a process-wide monotonic `Instant`, masked into the spec's
/// wraparound-tolerant `i32` space.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> SystemClock {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn tick_count(&self) -> i32 {
        let millis = self.epoch.elapsed().as_millis() as i64;
        (millis & 0x7FFF_FFFF) as i32
    }
}

/// Test/bench `Clock` whose value is set explicitly rather than read off the wall clock, so
/// scenarios involving RTO/callback timing are deterministic.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i32) -> ManualClock {
        ManualClock { now: AtomicI64::new(start as i64) }
    }

    pub fn advance(&self, delta_ms: i32) {
        self.now.fetch_add(delta_ms as i64, Ordering::SeqCst);
    }

    pub fn set(&self, value: i32) {
        self.now.store(value as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn tick_count(&self) -> i32 {
        (self.now.load(Ordering::SeqCst) & 0x7FFF_FFFF) as i32
    }
}

/// Synchronous `Executor` for tests: runs the task immediately on the calling thread instead of
/// handing it to a background pool.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Lets a `Clock` be shared between a `ClientEgress` and the test/bench code driving it (e.g. an
/// `Arc<ManualClock>` advanced from outside while also owned by the egress instance).
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn tick_count(&self) -> i32 {
        (**self).tick_count()
    }
}

/// Same sharing rationale as the `Clock` impl above, for executors backed by shared state.
impl<T: Executor + ?Sized> Executor for Arc<T> {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) {
        (**self).spawn(task);
    }
}
