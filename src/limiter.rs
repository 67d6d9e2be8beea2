//! Per-inbox rolling-hour rate limiter.
//!
//! Tracks sends per inbox per wall-clock hour bucket. `reserve` is an atomic
//! compare-and-increment under a per-inbox lock, so concurrent callers on
//! different inboxes never contend and callers on the same inbox serialize.
//! Buckets reset by comparing timestamps truncated to the hour, not by timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Timelike, Utc};

/// Truncate a timestamp to the start of its wall-clock hour.
pub fn hour_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

#[derive(Debug)]
struct HourWindow {
    bucket_start: DateTime<Utc>,
    count: u32,
}

/// In-memory per-inbox hour windows. Seed from persisted send history on
/// startup so a restart within the same hour cannot overshoot the budget.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: RwLock<HashMap<i64, Arc<Mutex<HourWindow>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, inbox_id: i64, now: DateTime<Utc>) -> Arc<Mutex<HourWindow>> {
        if let Some(w) = self.windows.read().expect("limiter lock").get(&inbox_id) {
            return Arc::clone(w);
        }
        let mut map = self.windows.write().expect("limiter lock");
        Arc::clone(map.entry(inbox_id).or_insert_with(|| {
            Arc::new(Mutex::new(HourWindow {
                bucket_start: hour_bucket(now),
                count: 0,
            }))
        }))
    }

    /// Pre-load an inbox's current-hour count from persisted send records.
    /// Keeps the larger of the seeded and already-observed counts.
    pub fn seed(&self, inbox_id: i64, count: u32, now: DateTime<Utc>) {
        let window = self.window(inbox_id, now);
        let mut w = window.lock().expect("window lock");
        let bucket = hour_bucket(now);
        if w.bucket_start != bucket {
            w.bucket_start = bucket;
            w.count = count;
        } else {
            w.count = w.count.max(count);
        }
    }

    /// Reserve one send slot for this inbox's current hour.
    ///
    /// Returns true and increments the counter iff it is below `max_per_hour`;
    /// otherwise returns false with no state change.
    pub fn reserve(&self, inbox_id: i64, max_per_hour: u32, now: DateTime<Utc>) -> bool {
        let window = self.window(inbox_id, now);
        let mut w = window.lock().expect("window lock");
        let bucket = hour_bucket(now);
        if w.bucket_start != bucket {
            w.bucket_start = bucket;
            w.count = 0;
        }
        if w.count >= max_per_hour {
            return false;
        }
        w.count += 1;
        true
    }

    /// Current count for an inbox's hour bucket.
    pub fn current_count(&self, inbox_id: i64, now: DateTime<Utc>) -> u32 {
        let window = self.window(inbox_id, now);
        let w = window.lock().expect("window lock");
        if w.bucket_start == hour_bucket(now) {
            w.count
        } else {
            0
        }
    }
}
