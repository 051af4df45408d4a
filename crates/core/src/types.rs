pub type StationId = u8;
pub type SeqNumber = u8;
pub type TimestampMs = u64;

pub const START_FLAG: u8 = 0x08;
pub const END_FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x1B;
pub const ESCAPE_MASK: u8 = 0x20;

/// Out-of-frame control codes. Never stuffed.
pub const CARRIER_REQUEST: u8 = 0x05;
pub const CARRIER_CLEAR: u8 = 0x06;
pub const COLLISION: u8 = 0x15;
pub const JAM: u8 = 0x18;

pub const MAX_PAYLOAD_LEN: usize = 32;

/// sender + receiver + timestamp + seq + length
pub const HEADER_LEN: usize = 1 + 1 + 8 + 1 + 2;

pub fn is_control_code(byte: u8) -> bool {
    matches!(byte, CARRIER_REQUEST | CARRIER_CLEAR | COLLISION | JAM)
}

pub fn needs_escape(byte: u8) -> bool {
    matches!(byte, START_FLAG | ESCAPE | END_FLAG)
}

/// Derives a station id from an endpoint name by accumulating its decimal
/// digits, e.g. `COM11` -> 11.
pub fn station_id_from_name(name: &str) -> StationId {
    name.chars()
        .filter_map(|c| c.to_digit(10))
        .fold(0u8, |acc, d| acc.wrapping_mul(10).wrapping_add(d as u8))
}
