//! Hamming SECDED check sequence over arbitrary-length payloads.
//!
//! The payload is viewed as a bit string (bytes in order, LSB-first within a
//! byte) laid out over the composite positions `1..=n+p` of a Hamming code,
//! skipping the power-of-two positions that belong to the `p` check bits. The
//! check bits are not interleaved with the data on the wire: they travel as a
//! separate FCS, packed LSB-first and followed by one overall parity bit.
//!
//! ```text
//! FCS bit:   0    1    ..  p-1   p          p+1 ..
//!           [c1] [c2] ..  [cP]  [overall]  [zero padding to a byte]
//! ```

use serde::{Deserialize, Serialize};

/// Outcome of [`decode_and_correct`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeResult {
    pub corrected_data: Vec<u8>,
    pub single_error_corrected: bool,
    pub double_error_detected: bool,
}

impl DecodeResult {
    fn clean(data: &[u8]) -> Self {
        Self {
            corrected_data: data.to_vec(),
            single_error_corrected: false,
            double_error_detected: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.single_error_corrected && !self.double_error_detected
    }
}

/// Minimal `p` with `2^p >= data_bits + p + 1`. Zero for an empty payload.
pub fn parity_bit_count(data_bits: usize) -> usize {
    if data_bits == 0 {
        return 0;
    }
    let mut p = 0;
    while (1usize << p) < data_bits + p + 1 {
        p += 1;
    }
    p
}

/// Size in bytes of the FCS carried for a payload of `payload_len` bytes.
pub fn fcs_len(payload_len: usize) -> usize {
    if payload_len == 0 {
        return 0;
    }
    let p = parity_bit_count(payload_len * 8);
    (p + 1 + 7) / 8
}

fn get_bit(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .map_or(false, |b| (b >> (index % 8)) & 1 == 1)
}

fn set_bit(bytes: &mut [u8], index: usize) {
    if let Some(b) = bytes.get_mut(index / 8) {
        *b |= 1 << (index % 8);
    }
}

pub fn flip_bit(bytes: &mut [u8], index: usize) {
    if let Some(b) = bytes.get_mut(index / 8) {
        *b ^= 1 << (index % 8);
    }
}

/// Data-bit index stored at composite `position`, or `None` for a check-bit
/// position. Counts the non-power-of-two positions strictly before it.
pub fn data_index_for_position(position: usize) -> Option<usize> {
    if position == 0 || position.is_power_of_two() {
        return None;
    }
    // powers of two below a non-power `position`: 1, 2, .., 2^floor(log2)
    let check_bits_before = position.ilog2() as usize + 1;
    Some(position - 1 - check_bits_before)
}

/// XOR of the composite positions of every set data bit. Bit `j` of the
/// result is check bit `j`.
fn check_bits(data: &[u8], p: usize) -> usize {
    let data_bits = data.len() * 8;
    let mut acc = 0usize;
    let mut data_idx = 0;
    for position in 1..=data_bits + p {
        if position.is_power_of_two() {
            continue;
        }
        if get_bit(data, data_idx) {
            acc ^= position;
        }
        data_idx += 1;
    }
    acc
}

fn ones_parity(data: &[u8]) -> bool {
    data.iter().map(|b| b.count_ones()).sum::<u32>() % 2 == 1
}

pub fn generate_fcs(data: &[u8]) -> Vec<u8> {
    let data_bits = data.len() * 8;
    if data_bits == 0 {
        return Vec::new();
    }
    let p = parity_bit_count(data_bits);
    let checks = check_bits(data, p);
    let overall = ones_parity(data) ^ (checks.count_ones() % 2 == 1);

    let mut fcs = vec![0u8; (p + 1 + 7) / 8];
    for j in 0..p {
        if (checks >> j) & 1 == 1 {
            set_bit(&mut fcs, j);
        }
    }
    if overall {
        set_bit(&mut fcs, p);
    }
    fcs
}

/// Checks `data` against a received `fcs`, correcting a single-bit error and
/// flagging anything worse.
///
/// The overall parity check covers the received data, the received check bits
/// and the received overall bit, so a flipped data bit is always seen as an
/// odd number of errors regardless of how many check bits its position feeds.
/// Set padding bits after the overall bit count as one more error: alone they
/// are reported as a corrected single error, next to any other error they make
/// the frame uncorrectable.
pub fn decode_and_correct(data: &[u8], fcs: &[u8]) -> DecodeResult {
    let mut result = DecodeResult::clean(data);
    let data_bits = data.len() * 8;
    if data_bits == 0 {
        return result;
    }

    let p = parity_bit_count(data_bits);
    if fcs.len() * 8 < p + 1 {
        result.double_error_detected = true;
        return result;
    }

    let received_checks = (0..p)
        .filter(|&j| get_bit(fcs, j))
        .fold(0usize, |acc, j| acc | (1 << j));
    let syndrome = received_checks ^ check_bits(data, p);

    let received_overall = get_bit(fcs, p);
    let expected_overall = ones_parity(data) ^ (received_checks.count_ones() % 2 == 1);
    let parity_match = received_overall == expected_overall;

    let padding_error = (p + 1..fcs.len() * 8).any(|i| get_bit(fcs, i));

    match (syndrome, parity_match) {
        (0, true) => {
            result.single_error_corrected = padding_error;
        }
        (0, false) => {
            if padding_error {
                result.double_error_detected = true;
            } else {
                result.single_error_corrected = true;
            }
        }
        (position, false) if !padding_error && position <= data_bits + p => {
            result.single_error_corrected = true;
            if let Some(index) = data_index_for_position(position) {
                flip_bit(&mut result.corrected_data, index);
            }
        }
        _ => {
            result.double_error_detected = true;
        }
    }

    result
}
