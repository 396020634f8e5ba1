//! Deterministic MAC and TAP name derivation.

use crate::error::ConfigError;
use sha2::{Digest, Sha256};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_IFNAME_LEN: usize = 15;

const TAP_HASH_LEN: usize = 8;

/// Parse a colon-separated MAC prefix such as `52:54:00`.
///
/// At most five octets are allowed so the name hash contributes at least
/// one byte. The first octet must be unicast.
pub fn parse_mac_prefix(prefix: &str) -> Result<Vec<u8>, ConfigError> {
    let invalid = || ConfigError::Invalid(format!("invalid MAC prefix {prefix:?}"));
    if prefix.trim().is_empty() {
        return Ok(Vec::new());
    }
    let octets = prefix
        .split(':')
        .map(|part| {
            if part.len() != 2 {
                return Err(invalid());
            }
            u8::from_str_radix(part, 16).map_err(|_| invalid())
        })
        .collect::<Result<Vec<_>, _>>()?;
    if octets.len() > 5 || octets[0] & 0x01 != 0 {
        return Err(invalid());
    }
    Ok(octets)
}

/// MAC address for a VM, stable across restarts of the same name.
///
/// Without a prefix the first octet comes from the hash and is forced to a
/// locally administered unicast address.
pub fn derive_mac(prefix: &[u8], name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut octets: Vec<u8> = prefix
        .iter()
        .copied()
        .chain(digest.iter().copied())
        .take(6)
        .collect();
    if prefix.is_empty() {
        octets[0] = (octets[0] & 0xfe) | 0x02;
    }
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// TAP name unique per launch: `prefix` plus eight hex digits of a hash of
/// the name and launch time, cut to the interface-name limit.
pub fn derive_tap_name(prefix: &str, name: &str, nanos: i64) -> String {
    let digest = Sha256::digest(format!("{name}-{nanos}").as_bytes());
    let hash: String = digest
        .iter()
        .take(TAP_HASH_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    let keep = MAX_IFNAME_LEN - TAP_HASH_LEN;
    let prefix: String = prefix.chars().take(keep).collect();
    format!("{prefix}{hash}")
}
