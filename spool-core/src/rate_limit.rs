// ABOUTME: Fixed-window publish counter keyed by (direction, channel, chat_id).
// ABOUTME: In-memory and best-effort; at its bound the table sweeps expired windows, then evicts the oldest.

use crate::event::{ConversationKey, Direction};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

type WindowKey = (Direction, ConversationKey);

#[derive(Debug)]
struct Windows {
    by_key: HashMap<WindowKey, Window>,
    last_sweep: Instant,
}

/// Per-conversation fixed-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_per_window: u32,
    max_keys: usize,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    /// `max_per_window == 0` disables limiting entirely
    pub fn new(window: Duration, max_per_window: u32, max_keys: usize) -> Self {
        Self {
            window,
            max_per_window,
            max_keys: max_keys.max(1),
            windows: Mutex::new(Windows {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_per_window > 0 && !self.window.is_zero()
    }

    /// Count one publish against the key's current window.
    /// Returns false when the window's cap is already used up.
    pub fn try_acquire(&self, direction: Direction, key: &ConversationKey) -> bool {
        self.try_acquire_at(direction, key, Instant::now())
    }

    pub fn try_acquire_at(&self, direction: Direction, key: &ConversationKey, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }
        // A poisoned limiter only loses counts; fail open.
        let Ok(mut windows) = self.windows.lock() else {
            return true;
        };

        let window_key = (direction, key.clone());
        if !windows.by_key.contains_key(&window_key) && windows.by_key.len() >= self.max_keys {
            self.make_room(&mut windows, now);
        }

        let entry = windows.by_key.entry(window_key).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= self.max_per_window {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Free space for one new window. Expired windows are swept at most once per
    /// window length; if the table is still full, the oldest windows are evicted
    /// in one batch so the next inserts don't each pay for a scan.
    fn make_room(&self, windows: &mut Windows, now: Instant) {
        if now.saturating_duration_since(windows.last_sweep) >= self.window {
            let window = self.window;
            windows
                .by_key
                .retain(|_, w| now.saturating_duration_since(w.started) < window);
            windows.last_sweep = now;
        }
        if windows.by_key.len() < self.max_keys {
            return;
        }

        let target = self.max_keys - (self.max_keys / 10).max(1);
        let excess = windows.by_key.len() - target;
        let mut oldest: Vec<(Instant, WindowKey)> = windows
            .by_key
            .iter()
            .map(|(k, w)| (w.started, k.clone()))
            .collect();
        oldest.sort_by_key(|(started, _)| *started);
        for (_, k) in oldest.into_iter().take(excess) {
            windows.by_key.remove(&k);
        }
        tracing::debug!(
            evicted = excess,
            tracked = windows.by_key.len(),
            "Rate limiter at capacity, evicted oldest windows"
        );
    }

    /// Number of tracked windows, expired or not
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().map(|w| w.by_key.len()).unwrap_or(0)
    }
}
