//! simulation tools for the serial link

pub mod scenarios;

use std::time::Duration;
use serial_link_mac::LinkConfig;

pub struct ChannelPresets;

impl ChannelPresets {
    /// Always free, never collides, no noise.
    pub fn clear_line() -> LinkConfig {
        LinkConfig::quiet()
    }

    pub fn light_traffic() -> LinkConfig {
        LinkConfig {
            busy_probability: 0.30,
            collision_probability: 0.01,
            noise_enabled: true,
            single_flip_probability: 0.95,
            ..LinkConfig::default()
        }
    }

    /// The lab setup: busy three polls out of four, a collision on one byte in ten.
    pub fn lab_defaults() -> LinkConfig {
        LinkConfig::default()
    }

    pub fn heavy_traffic() -> LinkConfig {
        LinkConfig {
            busy_probability: 0.90,
            collision_probability: 0.05,
            noise_enabled: true,
            single_flip_probability: 0.60,
            max_busy_polls: 1024,
            slot_time: Duration::from_millis(10),
            ..LinkConfig::default()
        }
    }
}
