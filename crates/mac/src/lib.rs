//! CSMA/CD medium access over a raw duplex byte channel

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use serial_link_core::{FrameError, SeqNumber, MAX_PAYLOAD_LEN};

pub mod channel;
pub mod csma;
pub mod receiver;
pub mod station;
pub mod stats;

pub use channel::{null_modem, ByteChannel, NullModemPort};
pub use csma::{backoff_slots, CsmaSender, CsmaState};
pub use receiver::{distort_payload, DeliveryQueue, ReceiverHandle};
pub use station::{LinkStation, ReceivedMessage, SendReport};
pub use stats::{ChannelStats, CsmaCounters, CsmaEvent, StatsSnapshot};

/// Line rates a station offers; the link passes them through untouched.
pub const STANDARD_BAUD_RATES: [u32; 16] = [
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Channel busy after {polls} carrier polls")]
    ChannelBusyExceeded { polls: u32 },

    #[error("Frame {seq} dropped after {attempts} collisions")]
    CollisionRetriesExhausted { seq: SeqNumber, attempts: u32 },

    #[error("Refusing to send an empty message")]
    EmptyMessage,

    #[error("Cannot build frame: {0}")]
    Frame(#[from] FrameError),
}

/// Protocol timing and the receiver's channel simulation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Carrier-sense wait and backoff unit.
    pub slot_time: Duration,
    /// Wait for a collision code after each transmitted byte.
    pub collision_check: Duration,
    /// Receiver read timeout; the stop flag is checked once per timeout.
    pub receive_poll: Duration,
    pub jam_length: usize,
    pub max_attempts: u32,
    pub backoff_limit: u32,
    pub max_busy_polls: u32,
    pub max_payload: usize,
    pub busy_probability: f64,
    pub collision_probability: f64,
    pub noise_enabled: bool,
    pub single_flip_probability: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            slot_time: Duration::from_millis(30),
            collision_check: Duration::from_millis(2),
            receive_poll: Duration::from_millis(50),
            jam_length: 4,
            max_attempts: 16,
            backoff_limit: 10,
            max_busy_polls: 256,
            max_payload: MAX_PAYLOAD_LEN,
            busy_probability: 0.75,
            collision_probability: 0.10,
            noise_enabled: true,
            single_flip_probability: 0.85,
        }
    }
}

impl LinkConfig {
    /// A line that is always free and never collides or corrupts.
    pub fn quiet() -> Self {
        Self {
            busy_probability: 0.0,
            collision_probability: 0.0,
            noise_enabled: false,
            ..Default::default()
        }
    }
}
