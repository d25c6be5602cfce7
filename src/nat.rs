//! Host firewall plumbing: iptables rules mapping `host_port → guest:22`.
//!
//! Three rules per VM make SSH reachable across the NAT bridge:
//!
//! 1. PREROUTING DNAT rewrites the destination of packets arriving on the
//!    forwarded port to `guest_ip:22`.
//! 2. A FORWARD accept lets the rewritten packet through to the guest. It
//!    is inserted at the *top* of the chain because libvirt's bridge setup
//!    plants a REJECT earlier in FORWARD that would otherwise win.
//! 3. POSTROUTING MASQUERADE source-NATs the DNAT'd traffic so replies
//!    route back through the host, where conntrack reverses the DNAT.
//!
//! Rules are keyed by `(host_port, guest_ip)`; host ports are
//! catalog-unique, so concurrent installs for different VMs never collide.

use crate::catalog::VmRecord;
use crate::error::ForgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOp {
    Append,
    InsertTop,
    Delete,
}

impl RuleOp {
    fn flag(self) -> &'static str {
        match self {
            RuleOp::Append => "-A",
            RuleOp::InsertTop => "-I",
            RuleOp::Delete => "-D",
        }
    }
}

/// The DNAT rule in the nat table's PREROUTING chain.
fn dnat_rule(op: RuleOp, host_port: u16, guest_ip: &str) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        op.flag().into(),
        "PREROUTING".into(),
        "-p".into(),
        "tcp".into(),
        "--dport".into(),
        host_port.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{guest_ip}:22"),
    ]
}

/// The FORWARD accept rule. Installed with `-I` so it is evaluated before
/// the bridge's default REJECT; deleted with `-D` and the same matchers.
fn forward_rule(op: RuleOp, guest_ip: &str) -> Vec<String> {
    vec![
        op.flag().into(),
        "FORWARD".into(),
        "-p".into(),
        "tcp".into(),
        "-d".into(),
        guest_ip.into(),
        "--dport".into(),
        "22".into(),
        "-m".into(),
        "conntrack".into(),
        "--ctstate".into(),
        "NEW,ESTABLISHED,RELATED".into(),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

/// The MASQUERADE rule in the nat table's POSTROUTING chain.
fn masquerade_rule(op: RuleOp, guest_ip: &str) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        op.flag().into(),
        "POSTROUTING".into(),
        "-p".into(),
        "tcp".into(),
        "-d".into(),
        guest_ip.into(),
        "--dport".into(),
        "22".into(),
        "-j".into(),
        "MASQUERADE".into(),
    ]
}

async fn run_iptables(args: &[String]) -> Result<(), ForgeError> {
    let output = tokio::process::Command::new("iptables")
        .args(args)
        .output()
        .await
        .map_err(|e| ForgeError::Io {
            context: "running iptables".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ForgeError::ExternalCommand {
            command: "iptables".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Install the three forwarding rules for one VM.
///
/// Atomic from the caller's perspective: if any sub-rule fails, the ones
/// already installed are removed before `NatInstallFailed` is returned.
pub async fn add_port_forward(host_port: u16, guest_ip: &str) -> Result<(), ForgeError> {
    let rules = [
        dnat_rule(RuleOp::Append, host_port, guest_ip),
        forward_rule(RuleOp::InsertTop, guest_ip),
        masquerade_rule(RuleOp::Append, guest_ip),
    ];
    let undo = [
        dnat_rule(RuleOp::Delete, host_port, guest_ip),
        forward_rule(RuleOp::Delete, guest_ip),
        masquerade_rule(RuleOp::Delete, guest_ip),
    ];

    for (i, rule) in rules.iter().enumerate() {
        if let Err(e) = run_iptables(rule).await {
            for installed in undo[..i].iter().rev() {
                if let Err(cleanup) = run_iptables(installed).await {
                    tracing::warn!(error = %cleanup, "failed to roll back partial NAT install");
                }
            }
            return Err(ForgeError::NatInstallFailed {
                message: e.to_string(),
            });
        }
    }

    tracing::info!(host_port, guest_ip, "added port forward to guest:22");
    Ok(())
}

/// Remove the three forwarding rules for one VM. Idempotent: each delete
/// failure (typically "rule does not exist") is logged and skipped so the
/// remaining rules still get removed.
pub async fn remove_port_forward(host_port: u16, guest_ip: &str) {
    let rules = [
        dnat_rule(RuleOp::Delete, host_port, guest_ip),
        forward_rule(RuleOp::Delete, guest_ip),
        masquerade_rule(RuleOp::Delete, guest_ip),
    ];

    for rule in &rules {
        if let Err(e) = run_iptables(rule).await {
            tracing::debug!(host_port, guest_ip, error = %e, "NAT rule removal skipped");
        }
    }

    tracing::info!(host_port, guest_ip, "removed port forward");
}

/// Re-create forwarding rules for every catalogued VM with a known port and
/// IP. Runs at service startup so guests provisioned before a restart (or
/// an external iptables flush) regain SSH access. Removes any stale copy of
/// each rule first, so it is safe to run against half-restored state.
///
/// Returns the number of VMs whose rules were restored.
pub async fn restore_port_forwards(vms: &[VmRecord]) -> usize {
    let mut restored = 0;
    for vm in vms {
        let Some(ip) = vm.ip.as_deref() else {
            continue;
        };

        remove_port_forward(vm.host_port, ip).await;
        match add_port_forward(vm.host_port, ip).await {
            Ok(()) => restored += 1,
            Err(e) => {
                tracing::warn!(vm_id = %vm.id, error = %e, "failed to restore port forward");
            }
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnat_rule_shape() {
        let rule = dnat_rule(RuleOp::Append, 2222, "192.168.122.45");
        assert_eq!(
            rule,
            vec![
                "-t",
                "nat",
                "-A",
                "PREROUTING",
                "-p",
                "tcp",
                "--dport",
                "2222",
                "-j",
                "DNAT",
                "--to-destination",
                "192.168.122.45:22",
            ]
        );
    }

    #[test]
    fn forward_rule_inserts_at_top() {
        let rule = forward_rule(RuleOp::InsertTop, "192.168.122.45");
        assert_eq!(
            rule,
            vec![
                "-I",
                "FORWARD",
                "-p",
                "tcp",
                "-d",
                "192.168.122.45",
                "--dport",
                "22",
                "-m",
                "conntrack",
                "--ctstate",
                "NEW,ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ]
        );
    }

    #[test]
    fn masquerade_rule_shape() {
        let rule = masquerade_rule(RuleOp::Append, "192.168.122.45");
        assert_eq!(
            rule,
            vec![
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-p",
                "tcp",
                "-d",
                "192.168.122.45",
                "--dport",
                "22",
                "-j",
                "MASQUERADE",
            ]
        );
    }

    #[test]
    fn delete_variants_mirror_install_matchers() {
        // A -D rule must repeat the matchers of the rule it deletes.
        let add = dnat_rule(RuleOp::Append, 2222, "10.0.0.1");
        let del = dnat_rule(RuleOp::Delete, 2222, "10.0.0.1");
        assert_eq!(add.len(), del.len());
        for (a, d) in add.iter().zip(del.iter()) {
            if a == "-A" {
                assert_eq!(d, "-D");
            } else {
                assert_eq!(a, d);
            }
        }

        let add = forward_rule(RuleOp::InsertTop, "10.0.0.1");
        let del = forward_rule(RuleOp::Delete, "10.0.0.1");
        assert_eq!(&add[1..], &del[1..]);
    }
}
