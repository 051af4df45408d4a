//! Wire format for the serial link: control codes, byte-stuffed frames and
//! the Hamming SECDED check sequence they carry.

pub mod frame;
pub mod hamming;
pub mod types;

pub use frame::{describe_wire, Frame, FrameError};
pub use hamming::{decode_and_correct, fcs_len, flip_bit, generate_fcs, DecodeResult};
pub use types::*;
