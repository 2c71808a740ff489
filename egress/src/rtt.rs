//! RTT/RTO estimation per RFC 2988 (spec.md §4.4).

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const K: f64 = 4.0;

/// Tracks smoothed round-trip time and the derived retransmission timeout for one client.
/// `default_rto`/`max_rto` are fixed at construction; `tick_resolution` is the clock's tick
/// granularity, used as the RFC 2988 floor on the RTTVAR contribution.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: f64,
    rttvar: f64,
    rto: f64,
    default_rto: f64,
    max_rto: f64,
    tick_resolution: f64,
}

impl RttEstimator {
    /// `default_rto_ms`/`max_rto_ms` of `0` fall back to the RFC 2988 defaults of 1000ms and
    /// 60000ms respectively.
    pub fn new(default_rto_ms: u32, max_rto_ms: u32, tick_resolution_ms: u32) -> RttEstimator {
        let default_rto = if default_rto_ms == 0 { 1_000.0 } else { default_rto_ms as f64 };
        let max_rto = if max_rto_ms == 0 { 60_000.0 } else { max_rto_ms as f64 };

        RttEstimator {
            srtt: 0.0,
            rttvar: 0.0,
            rto: default_rto,
            default_rto,
            max_rto,
            tick_resolution: tick_resolution_ms as f64,
        }
    }

    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    pub fn rttvar(&self) -> f64 {
        self.rttvar
    }

    pub fn rto(&self) -> f64 {
        self.rto
    }

    /// Folds a fresh RTT sample `r` (milliseconds) into the estimator and recomputes `rto`.
    /// `rttvar == 0` is treated as "no prior measurement" exactly as RFC 2988 specifies, which is
    /// also what a post-`backoff_rto` reset leaves behind.
    pub fn update(&mut self, r: f64) {
        if self.rttvar == 0.0 {
            self.srtt = r;
            self.rttvar = r / 2.0;
        } else {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * r;
        }

        self.rto = (self.srtt + (self.tick_resolution).max(K * self.rttvar))
            .max(self.default_rto)
            .min(self.max_rto);
    }

    /// On detected loss/timeout: the next `update` is treated as a first measurement, and `rto`
    /// doubles (saturating at `max_rto`).
    pub fn backoff(&mut self) {
        self.srtt = 0.0;
        self.rttvar = 0.0;
        self.rto = (self.rto * 2.0).min(self.max_rto);
    }
}
