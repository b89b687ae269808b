//! Result codes and attention codes as they appear on the wire. AFP result codes are negative
//!  32 bit numbers, carried in the `code` field of a reply frame in two's complement.

use crate::util::safe_converter::PrecheckedCast;

pub const NO_ERR: u32 = 0;
/// generic error, e.g. for frames that violate the protocol
pub const ERR_MISC: u32 = -5014i32 as u32;
/// the command table has no handler for an opcode
pub const ERR_NOT_SUPPORTED: u32 = -5024i32 as u32;

pub const ATTN_SHUTDOWN: u16 = 0x8000;
pub const ATTN_MESSAGE: u16 = 0x2000;
pub const ATTN_TIME_MASK: u16 = 0x0fff;

/// the 'minutes' part of an attention code, saturating at the field's maximum
pub fn attn_time(minutes: u32) -> u16 {
    let minutes: u16 = minutes.min(ATTN_TIME_MASK as u32).prechecked_cast();
    minutes & ATTN_TIME_MASK
}
