//! CSMA/CD sender: carrier sense, per-byte collision detection, jam and
//! binary exponential backoff for one frame at a time.

use std::sync::Arc;
use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::Rng;
use tokio::time::{sleep, Instant};

use serial_link_core::{SeqNumber, CARRIER_CLEAR, CARRIER_REQUEST, COLLISION, JAM};

use crate::channel::ByteChannel;
use crate::stats::{ChannelStats, CsmaEvent};
use crate::{LinkConfig, LinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsmaState {
    Listening,
    Transmitting,
    Backoff { collisions: u32 },
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Carrier {
    Clear,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transmission {
    Complete,
    Collided { at: usize },
}

/// Number of slots to wait after the `collisions`-th collision: uniform in
/// `[0, 2^min(collisions, cap)]`.
pub fn backoff_slots<R: Rng>(collisions: u32, cap: u32, rng: &mut R) -> u32 {
    // the window 2^k has to fit in u32
    let k = collisions.min(cap).min(u32::BITS - 1);
    rng.random_range(0..=(1u32 << k))
}

pub struct CsmaSender {
    channel: Arc<dyn ByteChannel>,
    config: LinkConfig,
    stats: ChannelStats,
    rng: StdRng,
}

impl CsmaSender {
    pub fn new(channel: Arc<dyn ByteChannel>, config: LinkConfig, stats: ChannelStats, rng: StdRng) -> Self {
        Self {
            channel,
            config,
            stats,
            rng,
        }
    }

    /// Puts one stuffed frame on the line. Returns the number of collisions
    /// it took.
    pub async fn transmit(&mut self, seq: SeqNumber, wire: &[u8]) -> Result<u32, LinkError> {
        let mut state = CsmaState::Listening;
        let mut collisions = 0u32;
        let mut busy_polls = 0u32;

        loop {
            trace!("Frame {} state {:?}", seq, state);
            state = match state {
                CsmaState::Listening => match self.sense_carrier().await? {
                    Carrier::Clear => CsmaState::Transmitting,
                    Carrier::Busy => {
                        busy_polls += 1;
                        self.stats.record(CsmaEvent::Busy).await;
                        debug!("Channel busy for frame {} (poll {})", seq, busy_polls);
                        if busy_polls >= self.config.max_busy_polls {
                            warn!("Giving up on frame {} after {} busy polls", seq, busy_polls);
                            return Err(LinkError::ChannelBusyExceeded { polls: busy_polls });
                        }
                        sleep(self.config.slot_time).await;
                        CsmaState::Listening
                    }
                },
                CsmaState::Transmitting => match self.send_frame_bytes(wire).await? {
                    Transmission::Complete => CsmaState::Sent,
                    Transmission::Collided { at } => {
                        collisions += 1;
                        self.stats.record(CsmaEvent::Collision).await;
                        debug!("Collision on frame {} at byte {}/{} (attempt {})", seq, at + 1, wire.len(), collisions);
                        self.send_jam().await?;
                        self.stats.record(CsmaEvent::JamSent).await;
                        if collisions >= self.config.max_attempts {
                            CsmaState::Failed
                        } else {
                            CsmaState::Backoff { collisions }
                        }
                    }
                },
                CsmaState::Backoff { collisions } => {
                    let slots = backoff_slots(collisions, self.config.backoff_limit, &mut self.rng);
                    debug!("Backing off {} slots after collision {}", slots, collisions);
                    sleep(self.config.slot_time * slots).await;
                    CsmaState::Listening
                }
                CsmaState::Sent => {
                    self.stats.record(CsmaEvent::PacketSent).await;
                    debug!("Frame {} sent ({} bytes, {} collisions)", seq, wire.len(), collisions);
                    return Ok(collisions);
                }
                CsmaState::Failed => {
                    warn!("Frame {} failed after {} collisions", seq, collisions);
                    return Err(LinkError::CollisionRetriesExhausted {
                        seq,
                        attempts: collisions,
                    });
                }
            };
        }
    }

    async fn sense_carrier(&self) -> Result<Carrier, LinkError> {
        self.channel.clear_input().await?;
        self.write_all(&[CARRIER_REQUEST]).await?;

        let deadline = Instant::now() + self.config.slot_time;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Carrier::Busy);
            }
            match self.channel.read_byte(deadline - now).await? {
                Some(CARRIER_CLEAR) => return Ok(Carrier::Clear),
                Some(other) => trace!("Ignoring {:#04x} while sensing carrier", other),
                None => return Ok(Carrier::Busy),
            }
        }
    }

    async fn send_frame_bytes(&self, wire: &[u8]) -> Result<Transmission, LinkError> {
        for (i, &b) in wire.iter().enumerate() {
            self.write_all(&[b]).await?;
            match self.channel.read_byte(self.config.collision_check).await? {
                Some(COLLISION) => return Ok(Transmission::Collided { at: i }),
                Some(other) => trace!("Ignoring {:#04x} during transmission", other),
                None => {}
            }
        }
        Ok(Transmission::Complete)
    }

    async fn send_jam(&self) -> Result<(), LinkError> {
        let burst = vec![JAM; self.config.jam_length];
        self.write_all(&burst).await
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut written = 0;
        while written < bytes.len() {
            let n = self.channel.write(&bytes[written..]).await?;
            if n == 0 {
                return Err(LinkError::ChannelUnavailable(format!(
                    "{}: write accepted no bytes",
                    self.channel.name()
                )));
            }
            written += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rand::SeedableRng;
    use tokio_test::assert_ok;

    use crate::channel::null_modem;

    #[test]
    fn test_backoff_window_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for collisions in 1..=16u32 {
            let window = 1u32 << collisions.min(10);
            let mut max_seen = 0;
            for _ in 0..2000 {
                let slots = backoff_slots(collisions, 10, &mut rng);
                assert!(slots <= window, "{} slots after collision {}", slots, collisions);
                max_seen = max_seen.max(slots);
            }
            if collisions <= 3 {
                // small windows get hit at the top edge
                assert_eq!(max_seen, window);
            }
        }
    }

    #[test]
    fn test_backoff_window_with_unbounded_cap() {
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..100 {
            assert!(backoff_slots(u32::MAX, u32::MAX, &mut rng) <= 1 << 31);
        }
        assert!(backoff_slots(0, u32::MAX, &mut rng) <= 1);
    }

    fn sender(channel: Arc<dyn ByteChannel>, config: LinkConfig) -> (CsmaSender, ChannelStats) {
        let stats = ChannelStats::new();
        let sender = CsmaSender::new(channel, config, stats.clone(), StdRng::seed_from_u64(1));
        (sender, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_carrier_request_is_busy() {
        let (port, _peer) = null_modem("COM3", "COM4");
        let config = LinkConfig {
            max_busy_polls: 3,
            ..LinkConfig::quiet()
        };
        let (mut csma, stats) = sender(port, config);

        let result = csma.transmit(1, &[0x08, 0x7E]).await;
        assert!(matches!(result, Err(LinkError::ChannelBusyExceeded { polls: 3 })));
        let session = stats.snapshot().await.session;
        assert_eq!(session.busy_events, 3);
        assert_eq!(session.total_attempts, 3);
        assert_eq!(session.collisions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_line_sends_frame_bytes() {
        let (port, peer) = null_modem("COM3", "COM4");
        assert_ok!(peer.write(&[CARRIER_CLEAR]).await);
        let (mut csma, stats) = sender(port, LinkConfig::quiet());

        // the stale carrier-clear above must not count as an answer
        let responder = tokio::spawn(async move {
            let request = peer.read_byte(Duration::from_secs(1)).await;
            assert!(matches!(request, Ok(Some(CARRIER_REQUEST))));
            peer.write(&[CARRIER_CLEAR]).await.unwrap();
            let mut seen = Vec::new();
            while let Ok(Some(b)) = peer.read_byte(Duration::from_millis(100)).await {
                seen.push(b);
            }
            seen
        });

        assert_eq!(assert_ok!(csma.transmit(1, &[0x08, 0x41, 0x7E]).await), 0);
        assert_eq!(responder.await.unwrap(), vec![0x08, 0x41, 0x7E]);
        assert_eq!(stats.snapshot().await.session.packets_sent, 1);
        assert_eq!(stats.snapshot().await.session.total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collision_jams_then_retries() {
        let (port, peer) = null_modem("COM3", "COM4");
        let (mut csma, stats) = sender(port, LinkConfig::quiet());

        // collide on the first attempt, let the second through
        let responder = tokio::spawn(async move {
            let mut attempts = 0;
            let mut jam = 0;
            while let Ok(Some(b)) = peer.read_byte(Duration::from_secs(1)).await {
                match b {
                    CARRIER_REQUEST => {
                        attempts += 1;
                        peer.write(&[CARRIER_CLEAR]).await.unwrap();
                    }
                    JAM => jam += 1,
                    0x41 if attempts == 1 => {
                        peer.write(&[COLLISION]).await.unwrap();
                    }
                    _ => {}
                }
            }
            (attempts, jam)
        });

        assert_eq!(assert_ok!(csma.transmit(7, &[0x08, 0x41, 0x7E]).await), 1);
        assert_eq!(responder.await.unwrap(), (2, 4));

        let session = stats.snapshot().await.session;
        assert_eq!(session.collisions, 1);
        assert_eq!(session.jam_sent, 1);
        assert_eq!(session.packets_sent, 1);
        assert_eq!(session.total_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collisions_exhaust_attempts() {
        let (port, peer) = null_modem("COM3", "COM4");
        let config = LinkConfig {
            max_attempts: 4,
            ..LinkConfig::quiet()
        };
        let (mut csma, stats) = sender(port, config);

        tokio::spawn(async move {
            while let Ok(Some(b)) = peer.read_byte(Duration::from_secs(600)).await {
                let reply = if b == CARRIER_REQUEST { CARRIER_CLEAR } else { COLLISION };
                if b != JAM && peer.write(&[reply]).await.is_err() {
                    break;
                }
            }
        });

        let result = csma.transmit(2, &[0x08, 0x41, 0x7E]).await;
        assert!(matches!(
            result,
            Err(LinkError::CollisionRetriesExhausted { seq: 2, attempts: 4 })
        ));
        let session = stats.snapshot().await.session;
        assert_eq!(session.collisions, 4);
        assert_eq!(session.jam_sent, 4);
        assert_eq!(session.packets_sent, 0);
    }

    #[tokio::test]
    async fn test_closed_channel_aborts() {
        let (port, _peer) = null_modem("COM3", "COM4");
        port.close();
        let (mut csma, _) = sender(port, LinkConfig::quiet());
        assert!(matches!(
            csma.transmit(1, &[0x08, 0x7E]).await,
            Err(LinkError::ChannelUnavailable(_))
        ));
    }
}
