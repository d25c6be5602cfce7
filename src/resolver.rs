//! Guest IP discovery.
//!
//! Freshly booted guests surface their IPv4 address at wildly different
//! speeds depending on the image (Alpine in seconds, Rocky in a minute), and
//! no single discovery mechanism works for all of them. The resolver polls
//! four sources at a fixed interval until one answers or the deadline
//! passes:
//!
//! 1. The hypervisor's DHCP-lease view of the domain's interfaces.
//! 2. The bridge's dnsmasq lease file, matched by MAC — catches races where
//!    the hypervisor API lags the file.
//! 3. The host neighbor (ARP) table, matched by MAC — works as soon as the
//!    guest has sent any packet, even before DHCP completes.
//! 4. The in-guest agent — only after a grace period, because cloud-init
//!    typically takes tens of seconds to install it and every failed query
//!    costs a libvirt round trip.
//!
//! The whole poll runs with the libvirt stderr handler suppressed; failed
//! probes are expected noise, not errors.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::{self, Config};
use crate::domain_xml;
use crate::error::ForgeError;
use crate::hypervisor::{AddrSource, Hypervisor};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const AGENT_GRACE: Duration = Duration::from_secs(30);
const PROGRESS_EVERY: Duration = Duration::from_secs(10);

/// Block until the domain's IPv4 address is known, or the deadline passes.
///
/// Synchronous by design: every probe blocks, so callers dispatch the whole
/// resolve onto a blocking worker. The deadline is honored here regardless
/// of what the caller does.
pub fn resolve_ip(
    hypervisor: &Hypervisor,
    config: &Config,
    vm_id: &str,
    timeout: Duration,
) -> Result<String, ForgeError> {
    let _quiet = crate::hypervisor::suppress_stderr();

    // The MAC is known deterministically from the VM id; the live XML is
    // still consulted first so a drifted definition would be caught by the
    // lease/ARP matchers rather than silently missed.
    let mac = hypervisor
        .domain_xml(vm_id)
        .ok()
        .and_then(|xml| domain_xml::mac_from_xml(&xml))
        .unwrap_or_else(|| domain_xml::generate_mac(vm_id));

    tracing::info!(vm_id, mac = %mac, "polling for guest IP");

    let started = Instant::now();
    let deadline = started + timeout;
    let lease_file = config::lease_file_path(&config.vm_network);
    let mut last_progress = started;

    loop {
        if let Some(ip) = ip_from_lease_source(hypervisor, vm_id) {
            tracing::info!(vm_id, ip = %ip, "found IP via DHCP lease");
            return Ok(ip);
        }

        if let Some(ip) = ip_from_lease_file(&lease_file, &mac) {
            tracing::info!(vm_id, ip = %ip, "found IP via dnsmasq lease file");
            return Ok(ip);
        }

        if let Some(ip) = ip_from_neighbor_table(&mac) {
            tracing::info!(vm_id, ip = %ip, "found IP via neighbor table");
            return Ok(ip);
        }

        if started.elapsed() >= AGENT_GRACE
            && let Some(ip) = ip_from_agent_source(hypervisor, vm_id)
        {
            tracing::info!(vm_id, ip = %ip, "found IP via guest agent");
            return Ok(ip);
        }

        if last_progress.elapsed() >= PROGRESS_EVERY {
            tracing::info!(
                vm_id,
                elapsed_s = started.elapsed().as_secs(),
                timeout_s = timeout.as_secs(),
                "still waiting for guest IP"
            );
            last_progress = Instant::now();
        }

        if Instant::now() + POLL_INTERVAL > deadline {
            return Err(ForgeError::IpDiscoveryTimeout {
                vm_id: vm_id.to_string(),
                timeout_s: timeout.as_secs(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Source 1: hypervisor lease view. First address that is not loopback.
fn ip_from_lease_source(hypervisor: &Hypervisor, vm_id: &str) -> Option<String> {
    let ifaces = hypervisor
        .interface_addresses(vm_id, AddrSource::Lease)
        .ok()?;
    for iface in &ifaces {
        for addr in &iface.addrs {
            if !addr.addr.starts_with("127.") {
                return Some(addr.addr.clone());
            }
        }
    }
    None
}

/// Source 4: guest agent. First IPv4 that is not loopback.
fn ip_from_agent_source(hypervisor: &Hypervisor, vm_id: &str) -> Option<String> {
    let ifaces = hypervisor
        .interface_addresses(vm_id, AddrSource::Agent)
        .ok()?;
    for iface in &ifaces {
        for addr in &iface.addrs {
            // IPv4 is type 0 in libvirt.
            if addr.typed == 0 && !addr.addr.starts_with("127.") {
                return Some(addr.addr.clone());
            }
        }
    }
    None
}

fn ip_from_lease_file(lease_file: &Path, mac: &str) -> Option<String> {
    let content = std::fs::read_to_string(lease_file).ok()?;
    find_lease(&content, mac)
}

/// Parse dnsmasq lease lines: `<expiry> <mac> <ip> <hostname> <client-id>`.
fn find_lease(content: &str, mac: &str) -> Option<String> {
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 3 && parts[1].eq_ignore_ascii_case(mac) {
            return Some(parts[2].to_string());
        }
    }
    None
}

fn ip_from_neighbor_table(mac: &str) -> Option<String> {
    let output = std::process::Command::new("ip")
        .args(["neigh", "show"])
        .output()
        .ok()?;
    find_neighbor(&String::from_utf8_lossy(&output.stdout), mac)
}

/// Parse `ip neigh show` lines: `<ip> dev <if> lladdr <mac> <state>`.
/// The guest only needs to have ARPed; a DHCP lease is not required yet.
fn find_neighbor(output: &str, mac: &str) -> Option<String> {
    let mac_lower = mac.to_ascii_lowercase();
    for line in output.lines() {
        if line.to_ascii_lowercase().contains(&mac_lower) {
            let first = line.split_whitespace().next()?;
            if !first.starts_with("127.") {
                return Some(first.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: &str = "52:54:00:aa:bb:cc";

    #[test]
    fn lease_file_matches_mac_case_insensitively() {
        let content = "\
1769900000 52:54:00:11:22:33 192.168.122.40 debianvm *
1769900100 52:54:00:AA:BB:CC 192.168.122.45 web1 01:52:54:00:aa:bb:cc
";
        assert_eq!(
            find_lease(content, MAC).as_deref(),
            Some("192.168.122.45")
        );
        assert_eq!(find_lease(content, "52:54:00:ff:ff:ff"), None);
    }

    #[test]
    fn lease_file_ignores_short_lines() {
        assert_eq!(find_lease("garbage\n\n52:54:00:aa:bb:cc", MAC), None);
    }

    #[test]
    fn neighbor_table_matches_mac() {
        let output = "\
192.168.122.1 dev virbr0 lladdr 52:54:00:de:ad:00 REACHABLE
192.168.122.45 dev virbr0 lladdr 52:54:00:aa:bb:cc STALE
";
        assert_eq!(
            find_neighbor(output, MAC).as_deref(),
            Some("192.168.122.45")
        );
        assert_eq!(find_neighbor(output, "52:54:00:00:00:00"), None);
    }

    #[test]
    fn neighbor_table_skips_loopback() {
        let output = "127.0.0.1 dev lo lladdr 52:54:00:aa:bb:cc REACHABLE\n";
        assert_eq!(find_neighbor(output, MAC), None);
    }

    #[test]
    fn missing_lease_file_is_silent() {
        assert_eq!(
            ip_from_lease_file(Path::new("/nonexistent/default.leases"), MAC),
            None
        );
    }
}
