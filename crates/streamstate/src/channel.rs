//! Maps logical channel names onto the notification transport's identifier space.
//!
//! Names that already fit are passed through. Longer names keep a readable prefix and
//! append a base-36 rendering of a 32-bit rolling hash computed over the whole name.
//! The hash is a checksum, not a collision-free encoding: two long names with the same
//! prefix and the same hash share an identifier and observe each other's messages.

/// Longest identifier the transport accepts, in bytes.
pub const MAX_CHANNEL_LEN: usize = 63;

/// Bytes of the original name kept in front of the hash suffix.
pub const CHANNEL_PREFIX_LEN: usize = 40;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn normalize_channel(channel: &str) -> String {
    if channel.len() <= MAX_CHANNEL_LEN {
        return channel.to_string();
    }

    let hash = rolling_hash(channel).unsigned_abs();
    format!("{}_{}", prefix(channel), to_base36(hash))
}

/// `hash = hash * 31 + unit` over UTF-16 code units, wrapping at 32 bits.
fn rolling_hash(channel: &str) -> i32 {
    channel.encode_utf16().fold(0_i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    })
}

fn prefix(channel: &str) -> &str {
    let mut end = CHANNEL_PREFIX_LEN.min(channel.len());
    while !channel.is_char_boundary(end) {
        end -= 1;
    }
    &channel[..end]
}

fn to_base36(mut value: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(7);
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}
