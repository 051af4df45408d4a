//! Channel-access counters, kept per session and for the lifetime of a station

use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsmaEvent {
    /// Carrier request went unanswered. Counts as an attempt.
    Busy,
    /// Collision observed mid-frame. Counts as an attempt.
    Collision,
    JamSent,
    /// Frame went through without a collision. Counts as an attempt.
    PacketSent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsmaCounters {
    pub packets_sent: u64,
    pub busy_events: u64,
    pub collisions: u64,
    pub jam_sent: u64,
    pub total_attempts: u64,
}

impl CsmaCounters {
    fn apply(&mut self, event: CsmaEvent) {
        match event {
            CsmaEvent::Busy => {
                self.busy_events += 1;
                self.total_attempts += 1;
            }
            CsmaEvent::Collision => {
                self.collisions += 1;
                self.total_attempts += 1;
            }
            CsmaEvent::JamSent => self.jam_sent += 1,
            CsmaEvent::PacketSent => {
                self.packets_sent += 1;
                self.total_attempts += 1;
            }
        }
    }
}

impl fmt::Display for CsmaCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} attempts={} busy={} collisions={} jam={}",
            self.packets_sent, self.total_attempts, self.busy_events, self.collisions, self.jam_sent
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub lifetime: CsmaCounters,
    /// Counters of the most recent send operation.
    pub session: CsmaCounters,
}

/// Shared handle to the counters. Clones observe the same values.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    inner: Arc<Mutex<StatsSnapshot>>,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, event: CsmaEvent) {
        let mut stats = self.inner.lock().await;
        stats.lifetime.apply(event);
        stats.session.apply(event);
    }

    /// Zeroes the session counters; lifetime counters carry on.
    pub async fn begin_session(&self) {
        self.inner.lock().await.session = CsmaCounters::default();
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock().await
    }

    pub async fn reset(&self) {
        *self.inner.lock().await = StatsSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attempt_accounting() {
        let stats = ChannelStats::new();
        stats.record(CsmaEvent::Busy).await;
        stats.record(CsmaEvent::Collision).await;
        stats.record(CsmaEvent::JamSent).await;
        stats.record(CsmaEvent::PacketSent).await;

        let snapshot = stats.snapshot().await;
        assert_eq!(
            snapshot.session,
            CsmaCounters {
                packets_sent: 1,
                busy_events: 1,
                collisions: 1,
                jam_sent: 1,
                total_attempts: 3,
            }
        );
        assert_eq!(snapshot.lifetime, snapshot.session);
    }

    #[tokio::test]
    async fn test_session_resets_lifetime_persists() {
        let stats = ChannelStats::new();
        let handle = stats.clone();
        stats.record(CsmaEvent::PacketSent).await;
        stats.begin_session().await;
        stats.record(CsmaEvent::PacketSent).await;

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.session.packets_sent, 1);
        assert_eq!(snapshot.lifetime.packets_sent, 2);

        handle.reset().await;
        assert_eq!(stats.snapshot().await, StatsSnapshot::default());
    }

    #[test]
    fn test_display() {
        let counters = CsmaCounters {
            packets_sent: 2,
            total_attempts: 3,
            collisions: 1,
            ..Default::default()
        };
        assert_eq!(counters.to_string(), "sent=2 attempts=3 busy=0 collisions=1 jam=0");
    }
}
