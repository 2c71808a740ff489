//! `ClientEgress` — the orchestrator that ties the priority queue, token-bucket tree, and RTT
//! estimator into the per-client dequeue loop (spec.md §4.5).

use crate::category::{Category, OutgoingPacket};
use crate::config::{Clock, EgressConfig, Executor, PRIORITY_LEVELS};
use crate::priority_queue::{Item, PriorityQueue};
use crate::rtt::RttEstimator;
use crate::throttle::Throttles;
use crate::token_bucket::{AdaptiveTokenBucket, BucketId, BucketSlab};
use flux::logging;
use flux::logging::Logger;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Fire-and-forget UDP emit. Implementations are expected to be non-blocking (spec.md §5).
pub trait SendSink {
    fn send_packet_final(&self, packet: OutgoingPacket);
}

type QueueEmptyCallback = Arc<dyn Fn(i64) + Send + Sync>;
type PacketStatsCallback = Arc<dyn Fn(i32, i32, i32) + Send + Sync>;

/// One entry in the unacked-packet table: sequence number, the tick it was first sent at, and
/// how many times it has been retransmitted. Kept in insertion order for cheap timeout scanning
/// (spec.md §3).
#[derive(Debug, Clone)]
struct UnackedEntry {
    sequence: u32,
    first_send_tick: i32,
    resend_count: u32,
    payload_len: u32,
}

/// Owns one client's entire egress state: the bucket hierarchy rooted at an
/// `AdaptiveTokenBucket`, the priority queue, the RTT estimator, and the bookkeeping the
/// dequeue loop needs to reconcile all three (spec.md §2, component 5).
pub struct ClientEgress<C, E, S> {
    agent_id: u64,
    remote_endpoint: SocketAddr,
    circuit_code: u32,

    is_connected: bool,
    is_paused: bool,

    current_sequence: u32,
    current_ping_sequence: u8,
    last_packet_received_tick: i32,
    bytes_since_last_ack: u32,

    packets_sent: u32,
    packets_received: u32,
    unacked_bytes: u32,
    reported_packets_sent: u32,
    reported_packets_received: u32,

    rtt: RttEstimator,

    slab: BucketSlab,
    root_bucket: AdaptiveTokenBucket,
    // Indexed by `Category as usize`; `None` only for `OutBand`, which bypasses throttling.
    category_buckets: [Option<BucketId>; 11],

    queue: PriorityQueue<OutgoingPacket>,
    waiting: VecDeque<(u8, OutgoingPacket)>,
    unacked: VecDeque<UnackedEntry>,

    packed_throttles_cache: Option<[u8; 28]>,
    // 0 means "callback currently running" (spec.md §3, §4.5).
    next_queue_empty_tick: Arc<AtomicI32>,
    empty_tick_counter: u32,

    config: EgressConfig,
    clock: C,
    executor: E,
    send_sink: S,
    log: Logger,

    on_queue_empty: Option<QueueEmptyCallback>,
    on_packet_stats: Option<PacketStatsCallback>,
}

impl<C: Clock, E: Executor, S: SendSink> ClientEgress<C, E, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        agent_id: u64,
        remote_endpoint: SocketAddr,
        circuit_code: u32,
        config: EgressConfig,
        clock: C,
        executor: E,
        send_sink: S,
        log: L,
    ) -> ClientEgress<C, E, S> {
        let now = clock.tick_count();

        let mut slab = BucketSlab::new();
        let root_bucket = AdaptiveTokenBucket::new(
            &mut slab,
            config.start_per_client_rate as f64,
            config.min_per_client_rate as f64,
            config.max_per_client_rate as f64,
            now,
        );

        let mut category_buckets: [Option<BucketId>; 11] = [None; 11];
        for &category in &[
            Category::Wind,
            Category::Cloud,
            Category::Land,
            Category::Texture,
            Category::Asset,
            Category::Task,
            Category::Resend,
        ] {
            category_buckets[category as usize] = Some(slab.insert(Some(root_bucket.root()), 0.0, now));
        }

        let asset_id = category_buckets[Category::Asset as usize].expect("asset bucket just inserted");
        category_buckets[Category::Transfer as usize] = Some(slab.insert(Some(asset_id), 0.0, now));

        let task_id = category_buckets[Category::Task as usize].expect("task bucket just inserted");
        category_buckets[Category::State as usize] = Some(slab.insert(Some(task_id), 0.0, now));

        let state_id = category_buckets[Category::State as usize].expect("state bucket just inserted");
        category_buckets[Category::AvatarInfo as usize] = Some(slab.insert(Some(state_id), 0.0, now));

        let log = match log.into() {
            Some(parent) => parent.new(logging::o!()),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        ClientEgress {
            agent_id,
            remote_endpoint,
            circuit_code,
            is_connected: true,
            is_paused: false,
            current_sequence: 0,
            current_ping_sequence: 0,
            last_packet_received_tick: now,
            bytes_since_last_ack: 0,
            packets_sent: 0,
            packets_received: 0,
            unacked_bytes: 0,
            reported_packets_sent: 0,
            reported_packets_received: 0,
            rtt: RttEstimator::new(config.default_rto_ms, config.max_rto_ms, config.tick_resolution_ms),
            slab,
            root_bucket,
            category_buckets,
            queue: PriorityQueue::new(PRIORITY_LEVELS, config.promotion_mask),
            waiting: VecDeque::new(),
            unacked: VecDeque::new(),
            packed_throttles_cache: None,
            // -1 reads as "ready to fire immediately": any tick_count() is >= it, yet it's
            // nonzero so it isn't mistaken for the "callback currently running" sentinel.
            next_queue_empty_tick: Arc::new(AtomicI32::new(-1)),
            empty_tick_counter: 0,
            config,
            clock,
            executor,
            send_sink,
            log,
            on_queue_empty: None,
            on_packet_stats: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.is_paused = paused;
    }

    pub fn agent_id(&self) -> u64 {
        self.agent_id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    pub fn circuit_code(&self) -> u32 {
        self.circuit_code
    }

    pub fn queue_len(&self) -> u32 {
        self.queue.len()
    }

    pub fn packets_sent(&self) -> u32 {
        self.packets_sent
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn bytes_since_last_ack(&self) -> u32 {
        self.bytes_since_last_ack
    }

    pub fn last_packet_received_tick(&self) -> i32 {
        self.last_packet_received_tick
    }

    pub fn set_on_queue_empty<F: Fn(i64) + Send + Sync + 'static>(&mut self, callback: F) {
        self.on_queue_empty = Some(Arc::new(callback));
    }

    pub fn set_on_packet_stats<F: Fn(i32, i32, i32) + Send + Sync + 'static>(&mut self, callback: F) {
        self.on_packet_stats = Some(Arc::new(callback));
    }

    /// Monotonically allocates the next outgoing sequence number.
    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.current_sequence;
        self.current_sequence = self.current_sequence.wrapping_add(1);
        seq
    }

    /// Monotonically allocates the next ping sequence number (wraps at `u8`, per the wire
    /// protocol's single-byte ping sequence field).
    pub fn next_ping_sequence(&mut self) -> u8 {
        let seq = self.current_ping_sequence;
        self.current_ping_sequence = self.current_ping_sequence.wrapping_add(1);
        seq
    }

    /// Hook for the inbound reader thread: records that a packet was successfully parsed, ahead
    /// of any ACK correlation (which is out of this core's scope, spec.md §1).
    pub fn note_packet_received(&mut self, now: i32) {
        self.packets_received = self.packets_received.wrapping_add(1);
        self.last_packet_received_tick = now;
    }

    /// Records a packet as awaiting acknowledgement. Caller (the reliability collaborator) owns
    /// timeout scanning against `first_send_tick`.
    pub fn register_unacked(&mut self, sequence: u32, payload_len: u32, now: i32) {
        self.unacked.push_back(UnackedEntry {
            sequence,
            first_send_tick: now,
            resend_count: 0,
            payload_len,
        });
        self.unacked_bytes = self.unacked_bytes.saturating_add(payload_len);
        self.bytes_since_last_ack = self.bytes_since_last_ack.saturating_add(payload_len);
    }

    /// Bumps `resend_count` and resets `first_send_tick` for a packet the reliability
    /// collaborator has just retransmitted after an RTO expiry. Returns `false` if `sequence` is
    /// no longer in the table (e.g. an ACK raced the timeout).
    pub fn mark_resent(&mut self, sequence: u32, now: i32) -> bool {
        if let Some(entry) = self.unacked.iter_mut().find(|entry| entry.sequence == sequence) {
            entry.resend_count = entry.resend_count.saturating_add(1);
            entry.first_send_tick = now;
            true
        } else {
            false
        }
    }

    /// Removes `sequence` from the unacked table, if present. Scans from the front since acks
    /// overwhelmingly arrive for the oldest outstanding packets first.
    pub fn acknowledge(&mut self, sequence: u32) -> bool {
        if let Some(pos) = self.unacked.iter().position(|entry| entry.sequence == sequence) {
            let entry = self.unacked.remove(pos).expect("position just found");
            self.unacked_bytes = self.unacked_bytes.saturating_sub(entry.payload_len);
            self.bytes_since_last_ack = 0;
            true
        } else {
            false
        }
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Resend count currently recorded for `sequence`, if it is still outstanding. Exposed for
    /// the reliability collaborator and for tests.
    pub fn resend_count(&self, sequence: u32) -> Option<u32> {
        self.unacked.iter().find(|entry| entry.sequence == sequence).map(|entry| entry.resend_count)
    }

    /// Maps `packet.category` to its priority and pushes onto the queue. Returns `false` for a
    /// closed connection; `Category` is a closed enum, so every variant maps to a priority level
    /// or the `OutBand` bypass, and `UnknownCategory` is otherwise unreachable here (spec.md
    /// §4.5). Per spec.md §7 the core never propagates this as an error — it folds into the same
    /// `bool` no-op contract as `dequeue_outgoing`/`set_throttles`/`send_packet_stats`.
    pub fn enqueue_outgoing(&mut self, packet: OutgoingPacket) -> bool {
        if !self.is_connected {
            return false;
        }

        let priority = packet.category.priority();
        self.queue.enqueue(priority, Item::Ready(packet))
    }

    /// Drains up to `max_n` packets. `OutBand` packets and packets whose bucket currently has
    /// enough tokens are submitted to the send sink; everything else is parked and re-enqueued
    /// one priority level up once the budget is spent, so a bucket-starved packet does not
    /// livelock behind a steady stream of new arrivals at its old level (spec.md §9 bullet 2).
    /// Returns `true` iff at least one packet was dispatched.
    pub fn dequeue_outgoing(&mut self, max_n: u32) -> bool {
        if !self.is_connected {
            return false;
        }

        let now = self.clock.tick_count();
        let mut dispatched_any = false;

        for _ in 0..max_n {
            let packet = match self.queue.dequeue() {
                Some(packet) => packet,
                None => break,
            };

            if packet.category.bypasses_throttle() {
                self.dispatch(packet);
                dispatched_any = true;
                continue;
            }

            let bucket_id = self.category_buckets[packet.category as usize];
            let admitted = match bucket_id {
                Some(id) => self.slab.remove_tokens(id, packet.payload_len, now),
                None => true,
            };

            if admitted {
                self.dispatch(packet);
                dispatched_any = true;
                self.maybe_ramp_up();
            } else {
                let priority = packet.category.priority();
                self.waiting.push_back((priority, packet));
            }
        }

        while let Some((priority, packet)) = self.waiting.pop_front() {
            let bumped = (priority + 1).min(PRIORITY_LEVELS as u8 - 1);
            self.queue.enqueue(bumped, Item::Ready(packet));
        }

        self.evaluate_queue_empty_signal(now);

        dispatched_any
    }

    fn dispatch(&mut self, packet: OutgoingPacket) {
        self.send_sink.send_packet_final(packet);
        self.packets_sent = self.packets_sent.wrapping_add(1);
    }

    /// Called by the dequeue loop after a successful throttled send while the root bucket's
    /// requested rate is still below its start rate (spec.md §4.2) — see the
    /// `ramp_up` gating discussion for why the gate lives here, not inside `AdaptiveTokenBucket`.
    fn maybe_ramp_up(&mut self) {
        if self.slab.requested_drip_rate(self.root_bucket.root()) < self.root_bucket.start_rate() {
            self.root_bucket.ramp_up(&mut self.slab);
        }
    }

    fn evaluate_queue_empty_signal(&mut self, now: i32) {
        let count = self.queue.len();

        if count <= self.config.queue_low_water_mark || self.empty_tick_counter > self.config.queue_empty_tick_threshold {
            let mut num_packets = self.config.prim_updates_per_callback;
            if count > self.config.queue_low_water_mark {
                let count = count as i64;
                let empty_tick = self.empty_tick_counter as i64;
                num_packets = num_packets * (num_packets / count.max(1)) * (empty_tick / 10);
            }

            if num_packets < 20 {
                return;
            }

            self.empty_tick_counter = 0;
            self.begin_fire_queue_empty(num_packets, now);
        } else {
            self.empty_tick_counter += 1;
        }
    }

    /// Guarded by `next_queue_empty_tick`: `0` means a dispatch is already in flight. Otherwise,
    /// once `now` reaches the cooldown deadline, flips the gate to `0` and hands the callback to
    /// the executor; the background task re-arms the gate to `now + MIN_CALLBACK_MS` on
    /// completion, swallowing (and logging) any panic from the callback (spec.md §4.5, §7).
    fn begin_fire_queue_empty(&mut self, n: i64, now: i32) {
        let deadline = self.next_queue_empty_tick.load(Ordering::SeqCst);
        if deadline == 0 || now < deadline {
            return;
        }

        let callback = match &self.on_queue_empty {
            Some(callback) => Arc::clone(callback),
            None => return,
        };

        self.next_queue_empty_tick.store(0, Ordering::SeqCst);

        let gate = Arc::clone(&self.next_queue_empty_tick);
        let min_callback_ms = self.config.min_callback_ms as i32;
        let log = self.log.clone();

        self.executor.spawn(Box::new(move || {
            if catch_unwind(AssertUnwindSafe(|| (*callback)(n))).is_err() {
                logging::error!(log, "on_queue_empty callback panicked"; "context" => "begin_fire_queue_empty");
            }
            gate.store((now + min_callback_ms).max(1), Ordering::SeqCst);
        }));
    }

    /// Seven little-endian `f32` bits/sec values (order: resend, land, wind, cloud, task,
    /// texture, asset). Derives the `state`/`transfer`/`avatar_info` sub-categories, applies
    /// each as the corresponding bucket's requested drip rate, and invalidates the packed-report
    /// cache (spec.md §4.5).
    pub fn set_throttles(&mut self, bytes: [u8; 28]) {
        if !self.is_connected {
            return;
        }

        let throttles = Throttles::from_wire_bits(&bytes, self.config.min_per_client_rate, self.config.max_per_client_rate);
        let now = self.clock.tick_count();

        for &category in &Category::ALL {
            if let (Some(bucket_id), Some(rate)) = (self.category_buckets[category as usize], throttles.rate_for(category)) {
                self.slab.set_requested_drip_rate(bucket_id, rate);
                self.slab.drip(bucket_id, now);
            }
        }

        self.packed_throttles_cache = None;
    }

    /// Cached packed report; recomputed from the buckets' current requested rates on a cache
    /// miss, re-aggregating `task`/`asset` back to the viewer's original seven categories
    /// (spec.md §4.5, §6). A closed connection never recomputes from bucket state — it serves
    /// whatever was last cached (or a zeroed blob if nothing ever was), per spec.md §7.
    pub fn get_throttles_packed(&mut self) -> [u8; 28] {
        if !self.is_connected {
            return self.packed_throttles_cache.unwrap_or([0u8; 28]);
        }

        if let Some(cached) = self.packed_throttles_cache {
            return cached;
        }

        let throttles = Throttles {
            resend: self.bucket_rate(Category::Resend),
            land: self.bucket_rate(Category::Land),
            wind: self.bucket_rate(Category::Wind),
            cloud: self.bucket_rate(Category::Cloud),
            task: self.bucket_rate(Category::Task),
            texture: self.bucket_rate(Category::Texture),
            asset: self.bucket_rate(Category::Asset),
            transfer: self.bucket_rate(Category::Transfer),
            state: self.bucket_rate(Category::State),
            avatar_info: self.bucket_rate(Category::AvatarInfo),
        };

        let packed = throttles.to_report_bytes();
        self.packed_throttles_cache = Some(packed);
        packed
    }

    fn bucket_rate(&self, category: Category) -> f64 {
        self.category_buckets[category as usize]
            .map(|id| self.slab.requested_drip_rate(id))
            .unwrap_or(0.0)
    }

    pub fn update_round_trip(&mut self, r_ms: f64) {
        if !self.is_connected {
            return;
        }
        self.rtt.update(r_ms);
    }

    pub fn backoff_rto(&mut self) {
        if !self.is_connected {
            return;
        }
        self.rtt.backoff();
    }

    pub fn slow_down_send(&mut self) {
        if !self.is_connected {
            return;
        }
        let now = self.clock.tick_count();
        self.root_bucket.slow_down(&mut self.slab, now);
    }

    /// Computes in/out packet deltas against the last reported counters, invokes
    /// `on_packet_stats` if registered, then advances the reported counters (spec.md §4.5).
    pub fn send_packet_stats(&mut self) {
        if !self.is_connected {
            return;
        }

        let in_delta = self.packets_received.wrapping_sub(self.reported_packets_received) as i32;
        let out_delta = self.packets_sent.wrapping_sub(self.reported_packets_sent) as i32;
        let unacked = self.unacked_bytes as i32;

        if let Some(callback) = &self.on_packet_stats {
            (**callback)(in_delta, out_delta, unacked);
        }

        self.reported_packets_received = self.packets_received;
        self.reported_packets_sent = self.packets_sent;
    }

    /// Flips `is_connected`, drains every category outbox, and clears listener references.
    /// Idempotent: a second call is a no-op (spec.md §3 Lifecycle, §8 Property 7).
    pub fn shutdown(&mut self) {
        if !self.is_connected {
            return;
        }

        self.is_connected = false;
        self.queue = PriorityQueue::new(PRIORITY_LEVELS, self.config.promotion_mask);
        self.waiting.clear();
        self.unacked.clear();
        self.unacked_bytes = 0;
        self.on_queue_empty = None;
        self.on_packet_stats = None;

        logging::debug!(self.log, "client egress shut down";
                        "context" => "shutdown",
                        "agent_id" => self.agent_id,
                        "circuit_code" => self.circuit_code);
    }
}
