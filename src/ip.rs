//! IPv4 dotted-quad ↔ `i64` conversion.
//!
//! Storing addresses as integers keeps per-visitor state small. The decoder
//! maps every failure to `0`, and `0.0.0.0` also encodes to `0`; callers
//! treat the sentinel as "unparseable", so `0.0.0.0` is never admitted.

use std::net::Ipv4Addr;

/// Decode a dotted-quad address to its big-endian integer form.
///
/// Returns `0` when the string is not a valid IPv4 address. Note that
/// `"0.0.0.0"` yields `0` as well and is therefore indistinguishable from a
/// parse failure.
pub fn ip4_to_i64(ip: &str) -> i64 {
    match ip.parse::<Ipv4Addr>() {
        Ok(addr) => u32::from(addr) as i64,
        Err(_) => 0,
    }
}

/// Render the low 32 bits of `v` as a dotted-quad address.
pub fn i64_to_ip4(v: i64) -> String {
    Ipv4Addr::from(v as u32).to_string()
}
