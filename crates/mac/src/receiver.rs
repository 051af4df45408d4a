//! Background receiver: answers carrier requests, simulates contention and
//! line noise, and reassembles frames into the delivery queue.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use serial_link_core::{
    fcs_len, flip_bit, is_control_code, Frame, CARRIER_CLEAR, CARRIER_REQUEST, COLLISION, END_FLAG, ESCAPE,
    HEADER_LEN, JAM, START_FLAG,
};

use crate::channel::ByteChannel;
use crate::LinkConfig;

pub type DeliveryQueue = Arc<Mutex<VecDeque<Frame>>>;

/// `random_bool` for a configured probability; out-of-range values saturate
/// and NaN never fires.
fn chance<R: Rng>(rng: &mut R, p: f64) -> bool {
    if p.is_nan() {
        return false;
    }
    rng.random_bool(p.clamp(0.0, 1.0))
}

/// Flips one random bit of `payload` with probability `single_flip_probability`,
/// otherwise two distinct random bits. Returns the flipped bit indices.
pub fn distort_payload<R: Rng>(payload: &mut [u8], single_flip_probability: f64, rng: &mut R) -> Vec<usize> {
    let bits = payload.len() * 8;
    if bits == 0 {
        return Vec::new();
    }
    let first = rng.random_range(0..bits);
    let mut flipped = vec![first];
    if !chance(rng, single_flip_probability) {
        let mut second = rng.random_range(0..bits - 1);
        if second >= first {
            second += 1;
        }
        flipped.push(second);
    }
    for &bit in &flipped {
        flip_bit(payload, bit);
    }
    flipped
}

#[derive(Debug, Default)]
enum ReceiverState {
    #[default]
    Idle,
    InFrame { buffer: Vec<u8>, escaped: bool },
}

/// Owns the running receiver task. Dropping it signals the task to stop;
/// [`ReceiverHandle::stop`] also waits for it.
pub struct ReceiverHandle {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    port: String,
}

impl ReceiverHandle {
    pub fn spawn(channel: Arc<dyn ByteChannel>, config: LinkConfig, queue: DeliveryQueue, rng: StdRng) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let port = channel.name().to_string();
        let max_frame_len = 2 + 2 * (HEADER_LEN + config.max_payload + fcs_len(config.max_payload));
        let task = ReceiverTask {
            channel,
            config,
            queue,
            rng,
            stop: stop.clone(),
            state: ReceiverState::Idle,
            in_jam: false,
            max_frame_len,
        };
        Self {
            stop,
            task: Some(tokio::spawn(task.run())),
            port,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signals the task and waits until it has released the port.
    pub async fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Receiver on {} ended abnormally: {}", self.port, e);
            }
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

struct ReceiverTask {
    channel: Arc<dyn ByteChannel>,
    config: LinkConfig,
    queue: DeliveryQueue,
    rng: StdRng,
    stop: Arc<AtomicBool>,
    state: ReceiverState,
    in_jam: bool,
    max_frame_len: usize,
}

impl ReceiverTask {
    async fn run(mut self) {
        info!("Receiver started on {}", self.channel.name());
        while !self.stop.load(Ordering::Relaxed) {
            match self.channel.read_byte(self.config.receive_poll).await {
                Ok(Some(byte)) => self.on_byte(byte).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("Receiver stopping: {}", e);
                    break;
                }
            }
        }
        info!("Receiver on {} stopped", self.channel.name());
    }

    async fn on_byte(&mut self, byte: u8) {
        // control codes only mean something between frames
        if matches!(self.state, ReceiverState::Idle) {
            match byte {
                CARRIER_REQUEST => return self.on_carrier_request().await,
                JAM => return self.on_jam(),
                other if is_control_code(other) => {
                    trace!("Ignoring control code {:#04x}", other);
                    return;
                }
                _ => {}
            }
        }
        self.in_jam = false;

        if chance(&mut self.rng, self.config.collision_probability) {
            debug!("Simulating collision on byte {:#04x}", byte);
            self.state = ReceiverState::Idle;
            self.reply(COLLISION).await;
            return;
        }

        if let Some(raw) = self.on_frame_byte(byte) {
            self.deliver(raw).await;
        }
    }

    async fn on_carrier_request(&mut self) {
        self.in_jam = false;
        if chance(&mut self.rng, self.config.busy_probability) {
            debug!("Simulating busy channel");
            return;
        }
        trace!("Carrier clear");
        self.reply(CARRIER_CLEAR).await;
    }

    fn on_jam(&mut self) {
        if !self.in_jam {
            warn!("Jam signal on {}", self.channel.name());
            self.in_jam = true;
        }
        self.state = ReceiverState::Idle;
    }

    /// Feeds one framing byte; returns the raw frame once the end flag closes it.
    fn on_frame_byte(&mut self, byte: u8) -> Option<Vec<u8>> {
        match &mut self.state {
            ReceiverState::Idle => {
                if byte == START_FLAG {
                    self.state = ReceiverState::InFrame {
                        buffer: vec![START_FLAG],
                        escaped: false,
                    };
                } else {
                    trace!("Discarding stray byte {:#04x}", byte);
                }
                None
            }
            ReceiverState::InFrame { buffer, escaped } => {
                if byte == START_FLAG {
                    debug!("Start flag inside frame, dropping {} buffered bytes", buffer.len());
                    buffer.clear();
                    buffer.push(START_FLAG);
                    *escaped = false;
                    return None;
                }
                buffer.push(byte);
                if *escaped {
                    *escaped = false;
                } else if byte == ESCAPE {
                    *escaped = true;
                } else if byte == END_FLAG {
                    let raw = mem::take(buffer);
                    self.state = ReceiverState::Idle;
                    return Some(raw);
                }
                if buffer.len() > self.max_frame_len {
                    debug!("Frame exceeds {} bytes, dropping", self.max_frame_len);
                    self.state = ReceiverState::Idle;
                }
                None
            }
        }
    }

    async fn deliver(&mut self, raw: Vec<u8>) {
        let mut frame = match Frame::parse(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", raw.len(), e);
                return;
            }
        };
        if self.config.noise_enabled {
            let flipped = distort_payload(&mut frame.payload, self.config.single_flip_probability, &mut self.rng);
            trace!("Noise flipped bits {:?} of frame {}", flipped, frame.seq);
        }
        debug!("Received frame {} ({} payload bytes)", frame.seq, frame.payload.len());
        self.queue.lock().await.push_back(frame);
    }

    async fn reply(&self, code: u8) {
        if let Err(e) = self.channel.write(&[code]).await {
            warn!("Failed to send {:#04x}: {}", code, e);
        }
    }
}
