//! Cloud-init NoCloud seed generation.
//!
//! Each guest gets a small ISO labelled `cidata` attached as a CD-ROM. On
//! first boot the guest's cloud-init reads `user-data` (account + SSH key),
//! `meta-data` (instance identity), and — when a MAC address is supplied —
//! `network-config` requesting DHCP on that interface. The network-config
//! file is what makes RHEL-family images (Rocky) bring their NIC up at all;
//! Debian and Alpine fall back to their own defaults without it.

use std::path::PathBuf;

use facet_value::{VArray, Value, value};

use crate::config::Config;
use crate::error::ForgeError;
use crate::iso9660::{self, IsoFile};

const ISO_LABEL: &str = "cidata";

/// Inputs for one guest's seed ISO.
pub struct SeedSpec<'a> {
    pub vm_id: &'a str,
    pub hostname: &'a str,
    /// The image's default login user (e.g. `debian` for debian-12).
    pub username: &'a str,
    pub ssh_key: &'a str,
    /// Deterministic MAC of the guest NIC; drives `network-config`.
    pub mac_address: Option<&'a str>,
}

/// Build the `#cloud-config` user-data: the image's default user with
/// passwordless sudo and the caller's SSH key.
pub fn build_user_data(spec: &SeedSpec<'_>) -> String {
    let mut authorized_keys = VArray::new();
    authorized_keys.push(Value::from(spec.ssh_key));

    let user = value!({
        "name": (spec.username),
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "shell": "/bin/bash",
        "lock_passwd": true,
        "ssh_authorized_keys": (Value::from(authorized_keys)),
    });

    let config = value!({
        "hostname": (spec.hostname),
        "manage_etc_hosts": true,
        "users": [user],
    });

    let yaml = facet_yaml::to_string(&config).expect("valid YAML serialization");
    // Strip the "---\n" document separator — cloud-init expects #cloud-config
    // as the first line and some versions choke on a separator after it.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}

pub fn build_meta_data(spec: &SeedSpec<'_>) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        spec.vm_id, spec.hostname
    )
}

/// Network config v2 matching the guest NIC by MAC and requesting DHCP.
/// Note: no outer "network:" wrapper — for the NoCloud datasource the file
/// IS the network config directly.
pub fn build_network_config(mac_address: &str) -> String {
    format!(
        "\
version: 2
ethernets:
  primary:
    match:
      macaddress: \"{mac_address}\"
    dhcp4: true
"
    )
}

/// Generate and atomically write the seed ISO for a VM.
///
/// Returns the final ISO path (`CLOUD_INIT_DIR/<vm_id>.iso`). The image is
/// written to a `.part` file first and renamed into place so a crashed
/// build never leaves a half-written seed behind.
pub async fn write_seed_iso(config: &Config, spec: &SeedSpec<'_>) -> Result<PathBuf, ForgeError> {
    let iso_path = config.iso_path(spec.vm_id);
    if let Some(parent) = iso_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ForgeError::IsoBuildFailed {
                message: format!("creating directory {}: {e}", parent.display()),
            })?;
    }

    let user_data = build_user_data(spec);
    let meta_data = build_meta_data(spec);
    let network_config = spec.mac_address.map(build_network_config);

    let mut files = vec![
        IsoFile {
            name: "user-data",
            data: user_data.as_bytes(),
        },
        IsoFile {
            name: "meta-data",
            data: meta_data.as_bytes(),
        },
    ];
    if let Some(net) = &network_config {
        files.push(IsoFile {
            name: "network-config",
            data: net.as_bytes(),
        });
    }

    let iso = iso9660::build_iso(ISO_LABEL, &files);

    let tmp_path = iso_path.with_extension("part");
    tokio::fs::write(&tmp_path, &iso)
        .await
        .map_err(|e| ForgeError::IsoBuildFailed {
            message: format!("writing {}: {e}", tmp_path.display()),
        })?;
    tokio::fs::rename(&tmp_path, &iso_path)
        .await
        .map_err(|e| ForgeError::IsoBuildFailed {
            message: format!("renaming {} into place: {e}", tmp_path.display()),
        })?;

    tracing::info!(path = %iso_path.display(), vm_id = %spec.vm_id, "generated cloud-init seed ISO");
    Ok(iso_path)
}

/// Remove a VM's seed ISO. Missing is not an error.
pub async fn delete_seed_iso(config: &Config, vm_id: &str) -> Result<(), ForgeError> {
    let iso_path = config.iso_path(vm_id);
    match tokio::fs::remove_file(&iso_path).await {
        Ok(()) => {
            tracing::info!(path = %iso_path.display(), "deleted seed ISO");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ForgeError::Io {
            context: format!("removing {}", iso_path.display()),
            source: e,
        }),
    }
}

/// Exists-check used by delete-path tests; the ISO itself is a weak
/// reference from the catalog record.
pub fn seed_iso_exists(config: &Config, vm_id: &str) -> bool {
    config.iso_path(vm_id).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn spec<'a>(mac: Option<&'a str>) -> SeedSpec<'a> {
        SeedSpec {
            vm_id: "4b825dc6-42de-4b5a-8c2a-1d0a34b1a2f3",
            hostname: "web1",
            username: "debian",
            ssh_key: "ssh-rsa AAAAB3Nza test@host",
            mac_address: mac,
        }
    }

    #[test]
    fn user_data_is_valid_cloud_config() {
        let ud = build_user_data(&spec(None));
        assert!(ud.starts_with("#cloud-config\n"));
    }

    #[test]
    fn user_data_contains_hostname_user_and_key() {
        let ud = build_user_data(&spec(None));
        assert!(ud.contains("web1"));
        assert!(ud.contains("name: debian"));
        assert!(ud.contains("ssh-rsa AAAAB3Nza test@host"));
    }

    #[test]
    fn user_data_grants_passwordless_sudo() {
        let ud = build_user_data(&spec(None));
        assert!(ud.contains("NOPASSWD:ALL"));
    }

    #[test]
    fn user_data_per_image_usernames() {
        for image in crate::config::IMAGES {
            let mut s = spec(None);
            s.username = image.username;
            let ud = build_user_data(&s);
            assert!(
                ud.contains(&format!("name: {}", image.username)),
                "user-data for {} should name user {}",
                image.tag,
                image.username
            );
        }
    }

    #[test]
    fn meta_data_has_instance_id_and_hostname() {
        let md = build_meta_data(&spec(None));
        assert!(md.contains("instance-id: 4b825dc6-42de-4b5a-8c2a-1d0a34b1a2f3"));
        assert!(md.contains("local-hostname: web1"));
    }

    #[test]
    fn network_config_requests_dhcp_on_mac() {
        let nc = build_network_config("52:54:00:aa:bb:cc");
        assert!(nc.starts_with("version: 2\n"));
        assert!(nc.contains("macaddress: \"52:54:00:aa:bb:cc\""));
        assert!(nc.contains("dhcp4: true"));
    }

    #[tokio::test]
    async fn seed_iso_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config::test_config(dir.path().to_path_buf());

        let s = spec(Some("52:54:00:aa:bb:cc"));
        let path = write_seed_iso(&cfg, &s).await.unwrap();
        assert!(path.exists());
        assert!(seed_iso_exists(&cfg, s.vm_id));

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[0x8001..0x8006], b"CD001");
        // Volume label and the three files are all present.
        assert_eq!(&data[0x8000 + 40..0x8000 + 46], b"cidata");
        for needle in ["user-data", "meta-data", "network-config"] {
            assert!(
                data.windows(needle.len()).any(|w| w == needle.as_bytes()),
                "missing {needle}"
            );
        }
        assert!(
            data.windows(s.ssh_key.len())
                .any(|w| w == s.ssh_key.as_bytes()),
            "SSH key should appear literally in user-data"
        );

        delete_seed_iso(&cfg, s.vm_id).await.unwrap();
        assert!(!seed_iso_exists(&cfg, s.vm_id));
        // Idempotent: deleting again is fine.
        delete_seed_iso(&cfg, s.vm_id).await.unwrap();
    }

    #[tokio::test]
    async fn seed_iso_without_mac_omits_network_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config::test_config(dir.path().to_path_buf());

        let s = spec(None);
        let path = write_seed_iso(&cfg, &s).await.unwrap();
        let data = std::fs::read(&path).unwrap();
        assert!(
            !data.windows(14).any(|w| w == b"network-config"),
            "network-config should be absent without a MAC"
        );
    }
}
