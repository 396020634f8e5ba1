//! dnsmasq lease file lookup, used only when a guest address cannot be
//! learned any other way.

use crate::error::PortForwardError;
use std::net::Ipv4Addr;
use std::path::Path;

pub const DEFAULT_LEASE_FILE: &str = "/var/lib/misc/dnsmasq.leases";

/// Find the address leased to `mac`.
///
/// Lines are `expiry ip mac hostname client-id`. MACs compare without
/// colons and case-insensitively; a lease counts only while `expiry > now`.
pub fn lookup_lease(path: &Path, mac: &str, now: i64) -> Result<Ipv4Addr, PortForwardError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PortForwardError::LeaseFileMissing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(PortForwardError::LeaseRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    find_lease(&contents, mac, now).ok_or_else(|| PortForwardError::NoActiveLease(mac.to_string()))
}

fn normalize(mac: &str) -> String {
    mac.replace(':', "").to_ascii_lowercase()
}

fn find_lease(contents: &str, mac: &str, now: i64) -> Option<Ipv4Addr> {
    let target = normalize(mac);
    contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || normalize(fields[2]) != target {
            return None;
        }
        let expiry: i64 = fields[0].parse().ok()?;
        if expiry <= now {
            return None;
        }
        let ip = fields[1].parse().ok()?;
        tracing::debug!(%ip, mac, "Found active lease");
        Some(ip)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LEASES: &str = "\
1700000000 192.168.254.20 52:54:00:aa:bb:cc old *
1900000000 192.168.254.21 52:54:00:aa:bb:cc vm1 *
1900000000 192.168.254.22 52:54:00:dd:ee:ff vm2 01:52:54:00:dd:ee:ff
";

    #[test]
    fn test_skips_expired_leases() {
        let ip = find_lease(LEASES, "52:54:00:aa:bb:cc", 1_800_000_000).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 254, 21));
    }

    #[test]
    fn test_mac_comparison_ignores_colons_and_case() {
        let ip = find_lease(LEASES, "525400DDEEFF", 1_800_000_000).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 254, 22));
    }

    #[test]
    fn test_everything_expired() {
        assert!(find_lease(LEASES, "52:54:00:aa:bb:cc", 2_000_000_000).is_none());
    }

    #[test]
    fn test_lookup_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LEASES.as_bytes()).unwrap();

        let ip = lookup_lease(file.path(), "52:54:00:dd:ee:ff", 1_800_000_000).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 254, 22));

        let err = lookup_lease(file.path(), "52:54:00:00:00:01", 1_800_000_000).unwrap_err();
        assert!(matches!(err, PortForwardError::NoActiveLease(_)));
    }

    #[test]
    fn test_missing_file_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let err = lookup_lease(&dir.path().join("none.leases"), "52:54:00:aa:bb:cc", 0).unwrap_err();
        assert!(matches!(err, PortForwardError::LeaseFileMissing(_)));
    }
}
