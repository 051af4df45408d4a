//! Caller-facing link station: endpoint selection, chunked sending and
//! message assembly from the background receiver's queue.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use serial_link_core::{describe_wire, station_id_from_name, Frame, SeqNumber, TimestampMs};

use crate::channel::ByteChannel;
use crate::csma::CsmaSender;
use crate::receiver::{DeliveryQueue, ReceiverHandle};
use crate::stats::{ChannelStats, CsmaCounters};
use crate::{LinkConfig, LinkError, DEFAULT_BAUD_RATE};

/// Outcome of one successful `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub frames_sent: usize,
    /// Stuffed frame bytes that made it onto the line, control bytes excluded.
    pub wire_bytes: usize,
    pub session: CsmaCounters,
}

/// Every drained frame, decoded and concatenated in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub data: Vec<u8>,
    pub frames: usize,
    pub corrected_frames: usize,
    /// At least one frame carried an error the FCS could not correct.
    pub corrupted: bool,
}

impl ReceivedMessage {
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

pub struct LinkStation {
    config: LinkConfig,
    send_port: Option<Arc<dyn ByteChannel>>,
    receive_port: Option<Arc<dyn ByteChannel>>,
    receiver: Option<ReceiverHandle>,
    queue: DeliveryQueue,
    stats: ChannelStats,
    baud_rate: u32,
    last_sent_frame: Vec<u8>,
    rng: StdRng,
}

impl LinkStation {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic station: backoff draws and channel simulation derive
    /// from `seed`.
    pub fn with_seed(config: LinkConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: LinkConfig, rng: StdRng) -> Self {
        Self {
            config,
            send_port: None,
            receive_port: None,
            receiver: None,
            queue: DeliveryQueue::default(),
            stats: ChannelStats::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            last_sent_frame: Vec::new(),
            rng,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn set_send_endpoint(&mut self, channel: Arc<dyn ByteChannel>) {
        info!("Send endpoint set to {}", channel.name());
        channel.set_baud_rate(self.baud_rate);
        self.send_port = Some(channel);
    }

    /// Replaces the receive endpoint. The previous receiver is stopped and
    /// joined before the new one starts.
    pub async fn set_receive_endpoint(&mut self, channel: Arc<dyn ByteChannel>) {
        self.stop_receiver().await;
        info!("Receive endpoint set to {}", channel.name());
        channel.set_baud_rate(self.baud_rate);
        let rng = StdRng::from_rng(&mut self.rng);
        self.receiver = Some(ReceiverHandle::spawn(
            channel.clone(),
            self.config.clone(),
            self.queue.clone(),
            rng,
        ));
        self.receive_port = Some(channel);
    }

    pub fn send_endpoint(&self) -> Option<&str> {
        self.send_port.as_ref().map(|p| p.name())
    }

    pub fn receive_endpoint(&self) -> Option<&str> {
        self.receive_port.as_ref().map(|p| p.name())
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) {
        debug!("Baud rate set to {}", baud_rate);
        self.baud_rate = baud_rate;
        for port in self.send_port.iter().chain(self.receive_port.iter()) {
            port.set_baud_rate(baud_rate);
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Stuffed bytes of the most recent frame put on the line.
    pub fn last_sent_frame(&self) -> Option<&[u8]> {
        if self.last_sent_frame.is_empty() {
            None
        } else {
            Some(&self.last_sent_frame)
        }
    }

    pub fn describe_last_frame(&self) -> Option<String> {
        self.last_sent_frame().map(describe_wire)
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats.clone()
    }

    pub async fn reset_stats(&self) {
        self.stats.reset().await;
    }

    /// Splits `message` into frames of at most `max_payload` bytes and sends
    /// them in order. Frames already on the line stay sent if a later one
    /// fails.
    pub async fn send_message(&mut self, message: &[u8]) -> Result<SendReport, LinkError> {
        if message.is_empty() {
            return Err(LinkError::EmptyMessage);
        }
        let port = self
            .send_port
            .clone()
            .ok_or_else(|| LinkError::ChannelUnavailable("send endpoint not configured".into()))?;

        let sender_id = station_id_from_name(port.name());
        let receiver_id = self.receive_endpoint().map_or(0, station_id_from_name);

        self.stats.begin_session().await;
        let rng = StdRng::from_rng(&mut self.rng);
        let mut csma = CsmaSender::new(port.clone(), self.config.clone(), self.stats.clone(), rng);

        let mut seq: SeqNumber = 1;
        let mut wire_bytes = 0;
        let mut frames_sent = 0;
        for chunk in message.chunks(self.config.max_payload.max(1)) {
            let frame = Frame::new(sender_id, receiver_id, now_ms(), seq, chunk.to_vec());
            let wire = frame.create_frame()?;
            self.last_sent_frame = wire.clone();

            if let Err(e) = csma.transmit(seq, &wire).await {
                warn!("Send via {} failed after {} frames: {}", port.name(), frames_sent, e);
                return Err(e);
            }
            wire_bytes += wire.len();
            frames_sent += 1;
            seq = seq.wrapping_add(1);
        }

        let session = self.stats.snapshot().await.session;
        info!(
            "Sent {} bytes in {} frames via {} ({})",
            message.len(),
            frames_sent,
            port.name(),
            session
        );
        Ok(SendReport {
            frames_sent,
            wire_bytes,
            session,
        })
    }

    /// Empties the delivery queue. Frames keep their noise; nothing is
    /// corrected here.
    pub async fn drain_frames(&self) -> Vec<Frame> {
        self.queue.lock().await.drain(..).collect()
    }

    /// Drains the queue and assembles the corrected payloads.
    pub async fn receive_message(&self) -> Result<ReceivedMessage, LinkError> {
        if self.receive_port.is_none() {
            return Err(LinkError::ChannelUnavailable(
                "receive endpoint not configured".into(),
            ));
        }
        let frames = self.drain_frames().await;
        let message = assemble(&frames);
        if message.corrupted {
            warn!("Received message is corrupted (uncorrectable error in a frame)");
        }
        debug!(
            "Assembled {} bytes from {} frames ({} corrected)",
            message.data.len(),
            message.frames,
            message.corrected_frames
        );
        Ok(message)
    }

    async fn stop_receiver(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            debug!("Stopping receiver on {}", receiver.port());
            receiver.stop().await;
        }
        self.receive_port = None;
    }

    /// Stops the receiver and releases both endpoints.
    pub async fn shutdown(&mut self) {
        self.stop_receiver().await;
        self.send_port = None;
        info!("Link station shut down");
    }
}

fn assemble(frames: &[Frame]) -> ReceivedMessage {
    let mut message = ReceivedMessage {
        frames: frames.len(),
        ..Default::default()
    };
    for frame in frames {
        let result = frame.decode();
        message.corrected_frames += result.single_error_corrected as usize;
        message.corrupted |= result.double_error_detected;
        message.data.extend_from_slice(&result.corrected_data);
    }
    message
}

fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_link_core::{flip_bit, FrameError};

    use crate::channel::null_modem;

    #[test]
    fn test_assemble_flags_corrupted_frames() {
        let clean = Frame::new(3, 4, 1, 1, b"HEL".to_vec());
        let mut single = Frame::new(3, 4, 2, 2, b"LO ".to_vec());
        flip_bit(&mut single.payload, 9);
        let mut double = Frame::new(3, 4, 3, 3, b"OK".to_vec());
        flip_bit(&mut double.payload, 0);
        flip_bit(&mut double.payload, 12);

        let message = assemble(&[clean.clone(), single]);
        assert_eq!(message.text(), "HELLO ");
        assert_eq!(message.frames, 2);
        assert_eq!(message.corrected_frames, 1);
        assert!(!message.corrupted);

        let message = assemble(&[clean, double]);
        assert!(message.corrupted);
        assert_eq!(message.frames, 2);
    }

    #[test]
    fn test_assemble_nothing() {
        let message = assemble(&[]);
        assert!(message.is_empty());
        assert_eq!(message.text(), "");
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (port, _peer) = null_modem("COM3", "COM4");
        let mut station = LinkStation::with_seed(LinkConfig::quiet(), 1);
        station.set_send_endpoint(port);
        assert!(matches!(station.send_message(b"").await, Err(LinkError::EmptyMessage)));
        assert!(station.last_sent_frame().is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_endpoints() {
        let mut station = LinkStation::with_seed(LinkConfig::quiet(), 1);
        assert!(matches!(
            station.send_message(b"HI").await,
            Err(LinkError::ChannelUnavailable(_))
        ));
        assert!(matches!(
            station.receive_message().await,
            Err(LinkError::ChannelUnavailable(_))
        ));
        assert!(station.describe_last_frame().is_none());
    }

    #[tokio::test]
    async fn test_baud_rate_reaches_endpoints() {
        let (port, _peer) = null_modem("COM3", "COM4");
        let mut station = LinkStation::with_seed(LinkConfig::quiet(), 1);
        assert_eq!(station.baud_rate(), DEFAULT_BAUD_RATE);

        station.set_send_endpoint(port.clone());
        assert_eq!(port.baud_rate(), DEFAULT_BAUD_RATE);
        station.set_baud_rate(57_600);
        assert_eq!(port.baud_rate(), 57_600);
        assert_eq!(station.send_endpoint(), Some("COM3"));
    }

    #[tokio::test]
    async fn test_oversized_chunk_fails_before_any_io() {
        let (port, _peer) = null_modem("COM3", "COM4");
        let config = LinkConfig {
            max_payload: 70_000,
            ..LinkConfig::quiet()
        };
        let mut station = LinkStation::with_seed(config, 1);
        station.set_send_endpoint(port.clone());

        let result = station.send_message(&vec![0x41; 70_000]).await;
        assert!(matches!(
            result,
            Err(LinkError::Frame(FrameError::PayloadTooLarge { len: 70_000, .. }))
        ));
        assert_eq!(port.bytes_written(), 0);
    }
}
