//! Connection-related data models.
//!
//! Per-connection bookkeeping kept by the pool and the status snapshot it
//! reports.

use serde::Serialize;
use std::time::Instant;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// In the idle set, ready to be handed out.
    Idle,
    /// Checked out by exactly one caller.
    InUse,
    /// Failed a health probe, timed out, or lost its socket; discarded on release.
    Broken,
}

/// Tracking data for a single pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique (per pool) identifier, used in log fields.
    pub id: u64,
    pub created_at: Instant,
    pub last_used_at: Instant,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            checkout_count: 0,
            state: ConnectionState::Idle,
        }
    }

    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
        self.state = ConnectionState::InUse;
    }

    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
        self.state = ConnectionState::Idle;
    }

    pub fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectionState::Broken
    }
}

/// Point-in-time snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Connections that exist: idle plus checked out plus being opened.
    pub live: u32,
    pub idle: u32,
    pub in_use: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub initialized: bool,
    pub closed: bool,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "live={} idle={} in_use={} min={} max={}{}",
            self.live,
            self.idle,
            self.in_use,
            self.min_size,
            self.max_size,
            if self.closed { " (closed)" } else { "" }
        )
    }
}
