use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ForgeError;

/// A guest image the service knows how to provision.
///
/// The template disk for a tag lives at `DATA_DIR/images/<tag>-template.qcow2`
/// and is treated as immutable — instance disks are copy-on-write overlays.
#[derive(Debug, Clone, Copy)]
pub struct ImageDef {
    pub tag: &'static str,
    pub name: &'static str,
    pub username: &'static str,
}

pub const IMAGES: &[ImageDef] = &[
    ImageDef {
        tag: "debian-12",
        name: "Debian 12 (Bookworm)",
        username: "debian",
    },
    ImageDef {
        tag: "rocky-9",
        name: "Rocky Linux 9",
        username: "rocky",
    },
    ImageDef {
        tag: "alpine",
        name: "Alpine Linux",
        username: "alpine",
    },
];

pub fn lookup_image(tag: &str) -> Option<&'static ImageDef> {
    IMAGES.iter().find(|img| img.tag == tag)
}

/// Service configuration, read from environment variables.
///
/// Every field has a default so the service starts on a bare host; a `.env`
/// file next to the binary is honored via dotenvy.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub libvirt_uri: String,
    pub listen_addr: SocketAddr,

    pub default_memory_mb: u32,
    pub default_vcpus: u32,
    pub default_disk_gb: u32,
    pub min_memory_mb: u32,
    pub max_memory_mb: u32,
    pub min_vcpus: u32,
    pub max_vcpus: u32,

    pub start_port: u16,
    pub end_port: u16,
    pub vm_network: String,
    pub server_public_ip: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ForgeError>
where
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ForgeError::Validation {
            message: format!("invalid {key}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ForgeError> {
        let data_dir: PathBuf = env_or("DATA_DIR", PathBuf::from("/var/lib/vm-provisioner"))?;
        let db_path: PathBuf = env_or("DB_PATH", data_dir.join("vms.db"))?;

        let config = Config {
            data_dir,
            db_path,
            libvirt_uri: env_or("LIBVIRT_URI", "qemu:///system".to_string())?,
            listen_addr: env_or("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            default_memory_mb: env_or("DEFAULT_MEMORY_MB", 512)?,
            default_vcpus: env_or("DEFAULT_VCPUS", 1)?,
            default_disk_gb: env_or("DEFAULT_DISK_GB", 10)?,
            min_memory_mb: env_or("MIN_MEMORY_MB", 256)?,
            max_memory_mb: env_or("MAX_MEMORY_MB", 4096)?,
            min_vcpus: env_or("MIN_VCPUS", 1)?,
            max_vcpus: env_or("MAX_VCPUS", 4)?,
            start_port: env_or("START_PORT", 2222)?,
            end_port: env_or("END_PORT", 2322)?,
            vm_network: env_or("VM_NETWORK", "default".to_string())?,
            server_public_ip: env_or("SERVER_PUBLIC_IP", "127.0.0.1".to_string())?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ForgeError> {
        if self.start_port == 0 || self.start_port > self.end_port {
            return Err(ForgeError::Validation {
                message: format!(
                    "port range {}-{} is invalid (START_PORT must be nonzero and <= END_PORT)",
                    self.start_port, self.end_port
                ),
            });
        }
        if self.min_memory_mb > self.max_memory_mb {
            return Err(ForgeError::Validation {
                message: "MIN_MEMORY_MB must not exceed MAX_MEMORY_MB".into(),
            });
        }
        if self.min_vcpus == 0 || self.min_vcpus > self.max_vcpus {
            return Err(ForgeError::Validation {
                message: "vcpu range is invalid (MIN_VCPUS must be nonzero and <= MAX_VCPUS)".into(),
            });
        }
        Ok(())
    }

    /// Immutable template disks.
    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Per-VM qcow2 overlays.
    pub fn instance_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    /// Per-VM cloud-init seed ISOs.
    pub fn cloud_init_dir(&self) -> PathBuf {
        self.data_dir.join("cloud-init")
    }

    pub fn template_path(&self, image_tag: &str) -> PathBuf {
        self.image_dir().join(format!("{image_tag}-template.qcow2"))
    }

    pub fn disk_path(&self, vm_id: &str) -> PathBuf {
        self.instance_dir().join(format!("{vm_id}.qcow2"))
    }

    pub fn iso_path(&self, vm_id: &str) -> PathBuf {
        self.cloud_init_dir().join(format!("{vm_id}.iso"))
    }

    pub fn clamp_memory(&self, memory_mb: u32) -> u32 {
        memory_mb.clamp(self.min_memory_mb, self.max_memory_mb)
    }

    pub fn clamp_vcpus(&self, vcpus: u32) -> u32 {
        vcpus.clamp(self.min_vcpus, self.max_vcpus)
    }

    /// Create all required directories. Idempotent.
    pub fn ensure_directories(&self) -> Result<(), ForgeError> {
        for dir in [
            self.data_dir.clone(),
            self.image_dir(),
            self.instance_dir(),
            self.cloud_init_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| ForgeError::Io {
                context: format!("creating directory {}", dir.display()),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// Host-side dnsmasq lease file for a libvirt NAT network.
pub fn lease_file_path(network: &str) -> PathBuf {
    Path::new("/var/lib/libvirt/dnsmasq").join(format!("{network}.leases"))
}

/// A fully populated config for unit and router tests.
#[cfg(test)]
pub fn test_config(data_dir: PathBuf) -> Config {
    Config {
        db_path: data_dir.join("vms.db"),
        data_dir,
        libvirt_uri: "qemu:///system".into(),
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
        default_memory_mb: 512,
        default_vcpus: 1,
        default_disk_gb: 10,
        min_memory_mb: 256,
        max_memory_mb: 4096,
        min_vcpus: 1,
        max_vcpus: 4,
        start_port: 2222,
        end_port: 2322,
        vm_network: "default".into(),
        server_public_ip: "127.0.0.1".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_images() {
        assert_eq!(lookup_image("debian-12").unwrap().username, "debian");
        assert_eq!(lookup_image("rocky-9").unwrap().username, "rocky");
        assert_eq!(lookup_image("alpine").unwrap().username, "alpine");
        assert!(lookup_image("windows").is_none());
    }

    #[test]
    fn paths_derive_from_vm_id() {
        let config = test_config(PathBuf::from("/var/lib/vm-provisioner"));
        assert_eq!(
            config.disk_path("abc"),
            PathBuf::from("/var/lib/vm-provisioner/instances/abc.qcow2")
        );
        assert_eq!(
            config.iso_path("abc"),
            PathBuf::from("/var/lib/vm-provisioner/cloud-init/abc.iso")
        );
        assert_eq!(
            config.template_path("debian-12"),
            PathBuf::from("/var/lib/vm-provisioner/images/debian-12-template.qcow2")
        );
    }

    #[test]
    fn clamps_resources_into_range() {
        let config = test_config(PathBuf::from("/tmp"));
        assert_eq!(config.clamp_memory(64), 256);
        assert_eq!(config.clamp_memory(512), 512);
        assert_eq!(config.clamp_memory(1 << 20), 4096);
        assert_eq!(config.clamp_vcpus(0), 1);
        assert_eq!(config.clamp_vcpus(64), 4);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut config = test_config(PathBuf::from("/tmp"));
        config.start_port = 3000;
        config.end_port = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn lease_file_follows_network_name() {
        assert_eq!(
            lease_file_path("default"),
            PathBuf::from("/var/lib/libvirt/dnsmasq/default.leases")
        );
    }
}
