//! The sliding-window algorithm, independent of any storage technology.
//!
//! [`SlidingWindow`] is the state of one counter key. Stores that cannot run the
//! algorithm server-side (the in-memory store, tests) apply it under their own lock;
//! scripted stores run an equivalent script. Both must produce identical replies.

use std::collections::BTreeSet;

/// Arguments of one atomic check, as sent to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHit {
    /// Caller's wall-clock time in epoch milliseconds.
    pub now_ms: u64,
    pub window_ms: u64,
    pub limit: u64,
    /// Penalty duration; 0 means "until the window frees a slot".
    pub block_ms: u64,
    /// Unique member for this hit (timestamp plus random tiebreaker).
    pub member: String,
}

/// What the store reports back for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReply {
    pub total_hits: u64,
    pub time_to_expire_ms: u64,
    pub is_blocked: bool,
    pub time_to_block_expire_ms: u64,
}

/// Ordered, scored, expiring state of one counter key.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    entries: BTreeSet<(u64, String)>,
    expires_at: Option<u64>,
    blocked_until: Option<u64>,
}

impl SlidingWindow {
    /// Whether the key has outlived its expiry at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.map_or(true, |at| at <= now_ms)
    }

    /// Apply one hit: purge, count, then either block or record the hit.
    pub fn hit(&mut self, hit: &WindowHit) -> WindowReply {
        let now = hit.now_ms;
        if self.is_expired(now) {
            *self = Self::default();
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }

        self.purge(now.saturating_sub(hit.window_ms));
        let count = self.entries.len() as u64;

        if let Some(until) = self.blocked_until {
            let ttl = until - now;
            return WindowReply {
                total_hits: count,
                time_to_expire_ms: ttl,
                is_blocked: true,
                time_to_block_expire_ms: ttl,
            };
        }

        if count >= hit.limit {
            return self.block(now, count, hit);
        }

        self.entries.insert((now, hit.member.clone()));
        self.expires_at = Some(now.saturating_add(hit.window_ms));
        WindowReply {
            total_hits: count + 1,
            time_to_expire_ms: hit.window_ms,
            is_blocked: false,
            time_to_block_expire_ms: 0,
        }
    }

    /// Read the key without mutating it. `None` when the key does not exist.
    pub fn peek(&self, now_ms: u64, window_ms: u64) -> Option<WindowReply> {
        if self.is_expired(now_ms) {
            return None;
        }
        let window_start = now_ms.saturating_sub(window_ms);
        let total_hits = self.entries.range((window_start, String::new())..).count() as u64;
        let block_ttl = self.blocked_until.map_or(0, |until| until.saturating_sub(now_ms));
        let key_ttl = self.expires_at.map_or(0, |at| at.saturating_sub(now_ms));
        Some(WindowReply {
            total_hits,
            time_to_expire_ms: if block_ttl > 0 { block_ttl } else { key_ttl },
            is_blocked: block_ttl > 0,
            time_to_block_expire_ms: block_ttl,
        })
    }

    fn block(&mut self, now: u64, count: u64, hit: &WindowHit) -> WindowReply {
        let ttl = if hit.block_ms > 0 {
            self.blocked_until = Some(now.saturating_add(hit.block_ms));
            hit.block_ms
        } else {
            self.remaining_window(now, hit.window_ms)
        };
        // An empty, unpenalised key is not materialised.
        if count > 0 || hit.block_ms > 0 {
            let expires_at = now.saturating_add(ttl.max(hit.window_ms));
            self.expires_at = Some(self.expires_at.map_or(expires_at, |at| at.max(expires_at)));
        }
        WindowReply {
            total_hits: count,
            time_to_expire_ms: ttl,
            is_blocked: true,
            time_to_block_expire_ms: ttl,
        }
    }

    /// Time until the oldest entry leaves the window and frees a slot.
    fn remaining_window(&self, now: u64, window_ms: u64) -> u64 {
        match self.entries.first() {
            Some((oldest, _)) => oldest.saturating_add(window_ms).saturating_sub(now).max(1),
            None => window_ms,
        }
    }

    /// Drop entries scored strictly below `window_start`.
    fn purge(&mut self, window_start: u64) {
        self.entries = self.entries.split_off(&(window_start, String::new()));
    }
}
