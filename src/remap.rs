//! Address remapping between overlapping pod ranges
//!
//! When two peered clusters use overlapping pod CIDRs, one side is presented
//! to the other under a substitute range. An address keeps its host bits and
//! takes the network bits of the substitute range.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::PodStatus;

use crate::{Error, NO_REMAP};

/// Returns true when `cidr` carries the "no remap" sentinel (or nothing at all).
pub fn is_no_remap(cidr: &str) -> bool {
    let cidr = cidr.trim();
    cidr.is_empty() || cidr == NO_REMAP
}

/// Parse an IPv4 CIDR, rejecting anything else with `InvalidAddress`.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, Error> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map_err(|e| Error::invalid_address(format!("{cidr}: {e}")))
}

/// Parse an IPv4 address. A valid trailing prefix length (`10.0.0.1/24`) is
/// accepted and dropped.
pub fn parse_addr(addr: &str) -> Result<Ipv4Addr, Error> {
    let trimmed = addr.trim();
    let invalid = |e: &dyn std::fmt::Display| Error::invalid_address(format!("{addr}: {e}"));
    if trimmed.contains('/') {
        trimmed
            .parse::<Ipv4Net>()
            .map(|net| net.addr())
            .map_err(|e| invalid(&e))
    } else {
        trimmed.parse::<Ipv4Addr>().map_err(|e| invalid(&e))
    }
}

/// Copy the network bits of `target` and the host bits of `source`.
pub fn remap_addr(target: Ipv4Net, source: Ipv4Addr) -> Ipv4Addr {
    let mask = target.netmask().octets();
    let mut out = target.network().octets();
    let src = source.octets();
    for i in 0..4 {
        out[i] |= (mask[i] ^ 0xff) & src[i];
    }
    Ipv4Addr::from(out)
}

/// Translate `source` into the address space of `target_cidr`.
///
/// The sentinel `"None"` means no remap is in effect and `source` is
/// returned unchanged.
///
/// ```
/// use peernet::remap::remap;
///
/// assert_eq!(remap("10.0.0.0/16", "192.168.5.42").unwrap(), "10.0.5.42");
/// assert_eq!(remap("None", "192.168.5.42").unwrap(), "192.168.5.42");
/// ```
pub fn remap(target_cidr: &str, source: &str) -> Result<String, Error> {
    if target_cidr == NO_REMAP {
        return Ok(source.to_string());
    }
    let target = parse_cidr(target_cidr)?;
    let source = parse_addr(source)?;
    Ok(remap_addr(target, source).to_string())
}

/// Base of a NETMAP translation from `native` into `remapped`.
///
/// The result is the image of the native network address inside the
/// remapped range, with the remapped prefix length.
pub fn netmap_target(remapped: &str, native: &str) -> Result<Ipv4Net, Error> {
    let remapped = parse_cidr(remapped)?;
    let native = parse_cidr(native)?;
    let base = remap_addr(remapped, native.network());
    Ipv4Net::new(base, remapped.prefix_len()).map_err(|e| Error::invalid_address(e.to_string()))
}

/// Normalize a CIDR to its network address (`10.1.2.3/16` becomes `10.1.0.0/16`).
///
/// The kernel reports rule and route destinations in this form, so rule text
/// built from it matches what a later check or delete looks for.
pub fn canonical_cidr(cidr: &str) -> Result<Ipv4Net, Error> {
    Ok(parse_cidr(cidr)?.trunc())
}

/// Rewrite the pod IPs reported in `status` into the address space of
/// `target_cidr`. A no-remap target leaves the status untouched.
pub fn remap_pod_status(status: &mut PodStatus, target_cidr: &str) -> Result<(), Error> {
    if is_no_remap(target_cidr) {
        return Ok(());
    }

    if let Some(ip) = status.pod_ip.as_mut() {
        *ip = remap(target_cidr, ip)?;
    }
    if let Some(ips) = status.pod_ips.as_mut() {
        for pod_ip in ips.iter_mut() {
            pod_ip.ip = remap(target_cidr, &pod_ip.ip)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodIP;
    use rstest::rstest;

    #[test]
    fn test_remap_replaces_network_bits() {
        assert_eq!(remap("10.0.0.0/16", "192.168.5.42").unwrap(), "10.0.5.42");
    }

    #[test]
    fn test_no_remap_sentinel_is_identity() {
        assert_eq!(remap("None", "192.168.5.42").unwrap(), "192.168.5.42");
        assert_eq!(remap(NO_REMAP, "172.16.0.9").unwrap(), "172.16.0.9");
    }

    #[rstest]
    #[case::slash_zero("0.0.0.0/0", "192.168.5.42", "192.168.5.42")]
    #[case::slash_eight("10.0.0.0/8", "192.168.5.42", "10.168.5.42")]
    #[case::non_octet_boundary("10.96.0.0/12", "172.31.255.7", "10.111.255.7")]
    #[case::slash_thirty_two("10.9.9.9/32", "192.168.5.42", "10.9.9.9")]
    #[case::host_bits_in_target_ignored("10.0.77.1/16", "192.168.5.42", "10.0.5.42")]
    #[case::source_with_prefix("10.0.0.0/16", "192.168.5.42/24", "10.0.5.42")]
    fn test_remap_prefix_lengths(#[case] target: &str, #[case] source: &str, #[case] expected: &str) {
        assert_eq!(remap(target, source).unwrap(), expected);
    }

    #[rstest]
    #[case::bad_target("10.0.0.0/33", "192.168.5.42")]
    #[case::garbage_target("not-a-cidr", "192.168.5.42")]
    #[case::bad_source("10.0.0.0/16", "192.168.5.420")]
    #[case::ipv6_source("10.0.0.0/16", "fd00::1")]
    #[case::garbage_source_prefix("10.0.0.0/16", "192.168.5.42/garbage")]
    #[case::oversized_source_prefix("10.0.0.0/16", "192.168.5.42/99")]
    fn test_remap_rejects_malformed_input(#[case] target: &str, #[case] source: &str) {
        assert!(matches!(
            remap(target, source),
            Err(Error::InvalidAddress(_))
        ));
    }

    /// Story: a remapped address stays put when remapped again under the same range
    #[test]
    fn story_remap_is_idempotent_and_stays_in_range() {
        let targets = ["10.0.0.0/16", "10.96.0.0/12", "100.64.0.0/10", "192.168.7.0/24"];
        let sources = ["192.168.5.42", "10.244.3.17", "0.0.0.0", "255.255.255.255"];

        for target in targets {
            let net = parse_cidr(target).unwrap();
            for source in sources {
                let once = remap(target, source).unwrap();
                let twice = remap(target, &once).unwrap();
                assert_eq!(once, twice, "remap({target}, {source}) not idempotent");
                assert!(
                    net.contains(&parse_addr(&once).unwrap()),
                    "{once} not within {target}"
                );
            }
        }
    }

    #[test]
    fn test_netmap_target_is_remapped_network() {
        let target = netmap_target("10.99.0.0/16", "10.244.0.0/16").unwrap();
        assert_eq!(target.to_string(), "10.99.0.0/16");
    }

    #[test]
    fn test_canonical_cidr_truncates_host_bits() {
        assert_eq!(canonical_cidr("10.1.2.3/16").unwrap().to_string(), "10.1.0.0/16");
        assert!(canonical_cidr("10.1.2.3").is_err());
    }

    #[test]
    fn test_remap_pod_status_rewrites_all_reported_ips() {
        let mut status = PodStatus {
            pod_ip: Some("10.244.1.7".to_string()),
            pod_ips: Some(vec![PodIP {
                ip: "10.244.1.7".to_string(),
            }]),
            ..Default::default()
        };

        remap_pod_status(&mut status, "10.99.0.0/16").unwrap();

        assert_eq!(status.pod_ip.as_deref(), Some("10.99.1.7"));
        assert_eq!(status.pod_ips.unwrap()[0].ip, "10.99.1.7");
    }

    #[test]
    fn test_remap_pod_status_without_remap_is_untouched() {
        let mut status = PodStatus {
            pod_ip: Some("10.244.1.7".to_string()),
            ..Default::default()
        };

        remap_pod_status(&mut status, "None").unwrap();
        remap_pod_status(&mut status, "").unwrap();

        assert_eq!(status.pod_ip.as_deref(), Some("10.244.1.7"));
    }
}
