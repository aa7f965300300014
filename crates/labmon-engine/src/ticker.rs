//! Drift-corrected periodic ticker with bounded catch-up.
//!
//! Deadlines are `start + k · period`, computed by exact `Duration`
//! accumulation rather than sampling the clock after each sleep, so tick
//! times do not drift with handler runtime. When a handler overruns its
//! period the next tick fires immediately (at most one "queued" tick);
//! deadlines missed beyond that are dropped and counted instead of piling
//! up.

use std::time::Duration;

use tokio::time::Instant;

pub struct DriftTicker {
    period: Duration,
    next_deadline: Instant,
    coalesced: u64,
}

impl DriftTicker {
    /// The first tick fires immediately; subsequent deadlines follow at
    /// exact multiples of `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_deadline: Instant::now(),
            coalesced: 0,
        }
    }

    /// Wait for the next deadline. Cancel-safe: dropping the future leaves
    /// the deadline unconsumed.
    pub async fn tick(&mut self) {
        tokio::time::sleep_until(self.next_deadline).await;
        self.next_deadline += self.period;

        // Coalesce any backlog: one late tick already fired above, anything
        // further behind is dropped.
        let now = Instant::now();
        while self.next_deadline <= now {
            self.next_deadline += self.period;
            self.coalesced += 1;
        }
    }

    /// Number of deadlines dropped so far because the handler overran.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
