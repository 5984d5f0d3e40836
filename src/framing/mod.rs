// ABOUTME: Length-prefixed TCP framing: header encode/decode helpers plus the Fragment state machine
// ABOUTME: Fragment tracks header/payload progress across arbitrary TCP read boundaries

mod fragment;

pub use fragment::Fragment;

/// Default ceiling on a single frame's declared payload length. Guards against a
/// desynchronized peer whose header decodes to an implausibly large count
/// (see `FramingError::FrameTooLarge`).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Encode a 32-bit big-endian length header.
pub fn encode_header_u32(len: u32) -> [u8; 4] {
    len.to_be_bytes()
}

/// Encode a 64-bit big-endian length header, used for file transfers.
pub fn encode_header_u64(len: u64) -> [u8; 8] {
    len.to_be_bytes()
}
