//! CRC16/XMODEM key-slot hashing, with `{hashtag}` extraction.

use crc16::{State, XMODEM};

pub const SLOT_COUNT: u16 = 16384;

/// If `key` contains a `{...}` hash tag with non-empty contents, only the
/// bytes between the first `{` and the following `}` determine the slot.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let after_open = open + 1;
    match key[after_open..].iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close_offset) => &key[after_open..after_open + close_offset],
    }
}

/// The cluster slot (0..16384) a key hashes to.
pub fn key_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT
}
