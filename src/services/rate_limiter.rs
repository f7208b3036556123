//! Per-address sliding-window rate limiter for downloads.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Allows at most `limit` requests per address within any `window`.
/// Rejected requests are not recorded.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::with_window(limit, DEFAULT_WINDOW)
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut hits = self.hits.lock();
        let recent = hits.entry(ip).or_default();
        evict(recent, now, self.window);

        if recent.len() >= self.limit {
            return false;
        }
        recent.push_back(now);
        true
    }

    /// Drop addresses with no activity inside the window.
    pub fn prune(&self, now: Instant) {
        let mut hits = self.hits.lock();
        hits.retain(|_, recent| {
            evict(recent, now, self.window);
            !recent.is_empty()
        });
    }

    pub fn tracked_addresses(&self) -> usize {
        self.hits.lock().len()
    }

    /// Prune once per window until the runtime shuts down.
    pub fn spawn_pruner(limiter: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.window);
            loop {
                ticker.tick().await;
                limiter.prune(Instant::now());
                debug!(tracked = limiter.tracked_addresses(), "pruned rate limiter");
            }
        })
    }
}

fn evict(recent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = recent.front() {
        if now.duration_since(*oldest) >= window {
            recent.pop_front();
        } else {
            break;
        }
    }
}
