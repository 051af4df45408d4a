//! Byte channel seam and an in-memory null-modem pair

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::LinkError;

/// Bounded-timeout byte I/O the link runs on. Opening, closing and device
/// settings belong to the implementor.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Returns how many bytes the channel accepted.
    async fn write(&self, bytes: &[u8]) -> Result<usize, LinkError>;

    /// `Ok(None)` when nothing arrived within `timeout`.
    async fn read_byte(&self, timeout: Duration) -> Result<Option<u8>, LinkError>;

    /// Discards everything already received.
    async fn clear_input(&self) -> Result<(), LinkError> {
        while self.read_byte(Duration::ZERO).await?.is_some() {}
        Ok(())
    }

    /// Opaque pass-through of the line rate.
    fn set_baud_rate(&self, _baud_rate: u32) {}
}

/// One end of a cross-connected pair: what one port writes, the other reads.
pub struct NullModemPort {
    name: String,
    tx: mpsc::UnboundedSender<u8>,
    rx: Mutex<mpsc::UnboundedReceiver<u8>>,
    baud_rate: AtomicU32,
    bytes_written: AtomicU64,
    closed: AtomicBool,
}

/// Creates two connected ports, e.g. `null_modem("COM3", "COM4")`.
pub fn null_modem(a: &str, b: &str) -> (Arc<NullModemPort>, Arc<NullModemPort>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Arc::new(NullModemPort::new(a, a_tx, a_rx)),
        Arc::new(NullModemPort::new(b, b_tx, b_rx)),
    )
}

impl NullModemPort {
    fn new(name: &str, tx: mpsc::UnboundedSender<u8>, rx: mpsc::UnboundedReceiver<u8>) -> Self {
        Self {
            name: name.to_string(),
            tx,
            rx: Mutex::new(rx),
            baud_rate: AtomicU32::new(0),
            bytes_written: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Every later read or write on this port fails.
    pub fn close(&self) {
        debug!("Closing port {}", self.name);
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn unavailable(&self, reason: &str) -> LinkError {
        LinkError::ChannelUnavailable(format!("{}: {}", self.name, reason))
    }
}

#[async_trait]
impl ByteChannel for NullModemPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, LinkError> {
        if self.is_closed() {
            return Err(self.unavailable("port closed"));
        }
        for &b in bytes {
            self.tx.send(b).map_err(|_| self.unavailable("peer disconnected"))?;
        }
        self.bytes_written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        trace!("{} wrote {} bytes", self.name, bytes.len());
        Ok(bytes.len())
    }

    async fn read_byte(&self, wait: Duration) -> Result<Option<u8>, LinkError> {
        if self.is_closed() {
            return Err(self.unavailable("port closed"));
        }
        let mut rx = self.rx.lock().await;
        if wait.is_zero() {
            return match rx.try_recv() {
                Ok(b) => Ok(Some(b)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(self.unavailable("peer disconnected")),
            };
        }
        match timeout(wait, rx.recv()).await {
            Ok(Some(b)) => Ok(Some(b)),
            Ok(None) => Err(self.unavailable("peer disconnected")),
            Err(_) => Ok(None),
        }
    }

    async fn clear_input(&self) -> Result<(), LinkError> {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            trace!("{} discarded {} stale bytes", self.name, discarded);
        }
        Ok(())
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate.store(baud_rate, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_bytes_cross_over() {
        let (a, b) = null_modem("COM3", "COM4");
        assert_eq!(assert_ok!(a.write(&[1, 2]).await), 2);
        assert_eq!(assert_ok!(b.read_byte(Duration::from_millis(10)).await), Some(1));
        assert_eq!(assert_ok!(b.read_byte(Duration::ZERO).await), Some(2));
        assert_eq!(assert_ok!(b.read_byte(Duration::from_millis(10)).await), None);
        assert_eq!(assert_ok!(a.read_byte(Duration::ZERO).await), None);
        assert_eq!(a.bytes_written(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_input_discards_backlog() {
        let (a, b) = null_modem("COM3", "COM4");
        assert_ok!(b.write(&[9, 9, 9]).await);
        assert_ok!(a.clear_input().await);
        assert_eq!(assert_ok!(a.read_byte(Duration::from_millis(5)).await), None);
    }

    #[tokio::test]
    async fn test_closed_port_is_unavailable() {
        let (a, _b) = null_modem("COM3", "COM4");
        a.close();
        assert!(matches!(a.write(&[1]).await, Err(LinkError::ChannelUnavailable(_))));
        assert_err!(a.read_byte(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_dropped_peer_is_unavailable() {
        let (a, b) = null_modem("COM3", "COM4");
        drop(b);
        assert_err!(a.write(&[1]).await);
        assert_err!(a.read_byte(Duration::ZERO).await);
    }

    #[test]
    fn test_baud_rate_pass_through() {
        let (a, _b) = null_modem("COM3", "COM4");
        a.set_baud_rate(115_200);
        assert_eq!(a.baud_rate(), 115_200);
    }
}
