// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use log::{info, warn};

use crate::broker::Broker;
use crate::store::RequestCounter;

#[derive(Default)]
pub struct Stats {
    // Public requests accepted for tunneling
    pub tunneled: AtomicU64,

    // Responses delivered back to a public caller
    pub completed: AtomicU64,

    // Waits that hit their deadline, on either side
    pub timed_out: AtomicU64,

    // Control requests refused before reaching the broker
    pub rejected: AtomicU64,

    // Requests currently being served
    pub active_public: AtomicUsize,
    pub active_agents: AtomicUsize,
}

impl Stats {
    pub fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy)]
pub enum ConnKind {
    Public,
    Agent,
}

/// Counts an in-flight request for as long as it lives.
pub struct ConnGuard {
    kind: ConnKind,
    stats: Arc<Stats>,
}

impl ConnGuard {
    pub fn new(kind: ConnKind, stats: Arc<Stats>) -> Self {
        match kind {
            ConnKind::Public => {
                stats.active_public.fetch_add(1, Ordering::Relaxed);
            }
            ConnKind::Agent => {
                stats.active_agents.fetch_add(1, Ordering::Relaxed);
            }
        }
        Self { kind, stats }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        match self.kind {
            ConnKind::Public => {
                self.stats.active_public.fetch_sub(1, Ordering::Relaxed);
            }
            ConnKind::Agent => {
                self.stats.active_agents.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

/// Logs one summary line per interval and persists the request counter.
pub async fn stats_reporter(
            stats: Arc<Stats>,
            broker: Broker,
            counter: Arc<RequestCounter>,
            every: Duration
        ) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut last_tunneled = 0u64;
    let mut last_completed = 0u64;
    let mut last_timed_out = 0u64;

    loop {
        ticker.tick().await;

        let tunneled = stats.tunneled.load(Ordering::Relaxed);
        let completed = stats.completed.load(Ordering::Relaxed);
        let timed_out = stats.timed_out.load(Ordering::Relaxed);
        let rejected = stats.rejected.load(Ordering::Relaxed);

        let d_tunneled = tunneled - last_tunneled;
        let d_completed = completed - last_completed;
        let d_timed_out = timed_out - last_timed_out;

        last_tunneled = tunneled;
        last_completed = completed;
        last_timed_out = timed_out;

        let public = stats.active_public.load(Ordering::Relaxed);
        let agents = stats.active_agents.load(Ordering::Relaxed);
        let t = broker.counts();

        info!(
            "[stats] +{d_tunneled} tunneled | +{d_completed} completed | +{d_timed_out} timed out | \
             stage1 waitlist={} consumers={} | stage2 waitlist={} consumers={} | \
             public={public} agents={agents} | totals: requests={} completed={completed} rejected={rejected}",
            t.stage1_waitlist,
            t.stage1_consumers,
            t.stage2_waitlist,
            t.stage2_consumers,
            counter.get(),
        );

        if let Err(e) = counter.flush() {
            warn!("request counter not persisted: {}", e);
        }
    }
}
