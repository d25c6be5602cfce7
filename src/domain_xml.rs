//! Domain definitions for libvirt, rendered via facet-xml derive.
//!
//! Two facet-xml v0.43 quirks shape this module: the pretty-printer
//! mangles text nodes (whitespace ends up inside `<name>`, `<memory>` and
//! friends — see <https://github.com/facet-rs/facet/issues/1982>), so
//! output is always the compact single-line form, and empty elements come
//! out as `<boot dev="hd"></boot>` rather than self-closing. Neither
//! bothers libvirt's parser.

use std::path::Path;

use facet::Facet;
use facet_xml as xml;
use sha2::{Digest, Sha256};

// ── XML model ──────────────────────────────────────────────
//
// One struct per element of the definition, nested the way the XML nests.
// `#[facet(xml::attribute)]` marks attributes and `#[facet(xml::text)]`
// the element's text content; everything else becomes a child element
// named after its field (or its `rename`).

#[derive(Debug, Facet)]
#[facet(rename = "domain")]
struct DomainXml {
    #[facet(xml::attribute, rename = "type")]
    virt_type: String,
    name: String,
    /// The domain UUID is set explicitly to the VM's catalog id, so the
    /// catalog and the hypervisor always agree on identity.
    uuid: String,
    memory: Memory,
    vcpu: u32,
    os: Os,
    features: Features,
    devices: Devices,
}

#[derive(Debug, Facet)]
struct Memory {
    #[facet(xml::attribute)]
    unit: String,
    #[facet(xml::text)]
    amount: u64,
}

// ── boot & firmware ────────────────────────────────────────

#[derive(Debug, Facet)]
struct Os {
    #[facet(rename = "type")]
    kind: OsKind,
    boot: Boot,
}

#[derive(Debug, Facet)]
#[facet(rename = "type")]
struct OsKind {
    #[facet(xml::attribute)]
    arch: String,
    #[facet(xml::attribute)]
    machine: String,
    #[facet(xml::text)]
    virt: String,
}

#[derive(Debug, Facet)]
struct Boot {
    #[facet(xml::attribute)]
    dev: String,
}

// ── guest features ─────────────────────────────────────────

#[derive(Debug, Facet)]
struct Features {
    acpi: Empty,
    apic: Empty,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Empty {}

// ── storage devices ────────────────────────────────────────

#[derive(Debug, Facet)]
struct Devices {
    disk: Vec<Disk>,
    interface: Nic,
    serial: CharDev,
    console: Console,
}

#[derive(Debug, Facet)]
struct Disk {
    #[facet(xml::attribute, rename = "type")]
    backing: String,
    #[facet(xml::attribute)]
    device: String,
    driver: Driver,
    source: FileSource,
    target: BlockTarget,
    #[facet(default)]
    readonly: Option<Empty>,
}

impl Disk {
    /// A file-backed block device exposed to the guest on the given bus.
    fn file(device: &str, format: &str, path: &Path, dev: &str, bus: &str, readonly: bool) -> Self {
        Disk {
            backing: "file".into(),
            device: device.into(),
            driver: Driver {
                name: "qemu".into(),
                format: format.into(),
            },
            source: FileSource {
                file: path.display().to_string(),
            },
            target: BlockTarget {
                dev: dev.into(),
                bus: bus.into(),
            },
            readonly: readonly.then(|| Empty {}),
        }
    }
}

#[derive(Debug, Facet)]
struct Driver {
    #[facet(xml::attribute)]
    name: String,
    #[facet(xml::attribute, rename = "type")]
    format: String,
}

#[derive(Debug, Facet)]
struct FileSource {
    #[facet(xml::attribute)]
    file: String,
}

#[derive(Debug, Facet)]
struct BlockTarget {
    #[facet(xml::attribute)]
    dev: String,
    #[facet(xml::attribute)]
    bus: String,
}

// ── network interface ──────────────────────────────────────

#[derive(Debug, Facet)]
struct Nic {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    mac: Mac,
    source: NetSource,
    model: NicModel,
}

#[derive(Debug, Facet)]
struct Mac {
    #[facet(xml::attribute)]
    address: String,
}

#[derive(Debug, Facet)]
struct NetSource {
    #[facet(xml::attribute)]
    network: String,
}

#[derive(Debug, Facet)]
struct NicModel {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
}

// ── serial console ─────────────────────────────────────────

#[derive(Debug, Facet)]
struct CharDev {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    target: PortTarget,
}

#[derive(Debug, Facet)]
#[facet(rename = "target")]
struct PortTarget {
    #[facet(xml::attribute)]
    port: String,
}

#[derive(Debug, Facet)]
struct Console {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    target: ConsoleTarget,
}

#[derive(Debug, Facet)]
#[facet(rename = "target")]
struct ConsoleTarget {
    #[facet(xml::attribute, rename = "type")]
    kind: String,
    #[facet(xml::attribute)]
    port: String,
}

// ── rendering ──────────────────────────────────────────────

/// Inputs for one guest's domain definition.
pub struct DomainSpec<'a> {
    pub vm_id: &'a str,
    pub name: &'a str,
    pub disk_path: &'a Path,
    pub iso_path: &'a Path,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub network: &'a str,
    pub mac_address: &'a str,
}

/// Render libvirt domain XML for a guest: virtio overlay disk, read-only
/// seed CD-ROM, one virtio NIC with the deterministic MAC on the named
/// network. Memory is expressed in KiB as libvirt expects. The output is
/// one unformatted line (see the module doc for why).
pub fn build_definition(spec: &DomainSpec<'_>) -> String {
    let domain = DomainXml {
        virt_type: "kvm".into(),
        name: spec.name.into(),
        uuid: spec.vm_id.into(),
        memory: Memory {
            unit: "KiB".into(),
            amount: u64::from(spec.memory_mb) * 1024,
        },
        vcpu: spec.vcpus,
        os: Os {
            kind: OsKind {
                arch: "x86_64".into(),
                machine: "q35".into(),
                virt: "hvm".into(),
            },
            boot: Boot { dev: "hd".into() },
        },
        features: Features {
            acpi: Empty {},
            apic: Empty {},
        },
        devices: Devices {
            disk: vec![
                Disk::file("disk", "qcow2", spec.disk_path, "vda", "virtio", false),
                Disk::file("cdrom", "raw", spec.iso_path, "sda", "sata", true),
            ],
            interface: Nic {
                kind: "network".into(),
                mac: Mac {
                    address: spec.mac_address.into(),
                },
                source: NetSource {
                    network: spec.network.into(),
                },
                model: NicModel {
                    kind: "virtio".into(),
                },
            },
            serial: CharDev {
                kind: "pty".into(),
                target: PortTarget { port: "0".into() },
            },
            console: Console {
                kind: "pty".into(),
                target: ConsoleTarget {
                    kind: "serial".into(),
                    port: "0".into(),
                },
            },
        },
    };

    facet_xml::to_string(&domain).expect("static XML model always serializes")
}

/// Deterministic MAC for a VM id: the KVM OUI `52:54:00` followed by the
/// first three bytes of SHA-256 over the id's ASCII bytes. The same VM
/// always gets the same MAC, which keeps DHCP leases stable and lets the
/// IP resolver match lease files and ARP entries without asking the guest.
pub fn generate_mac(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2]
    )
}

/// Extract the first `<mac address="..."/>` from live domain XML.
///
/// Libvirt reports the definition back with either quote style, so both are
/// scanned. Returns None when no interface MAC is present.
pub fn mac_from_xml(xml_desc: &str) -> Option<String> {
    let mac_start = xml_desc.find("<mac ")?;
    let section = &xml_desc[mac_start..];

    let addr_start = section
        .find("address=\"")
        .map(|i| i + "address=\"".len())
        .or_else(|| section.find("address='").map(|i| i + "address='".len()))?;

    let remaining = &section[addr_start..];
    let addr_end = remaining.find(['"', '\''])?;
    let mac = &remaining[..addr_end];
    if mac.is_empty() {
        None
    } else {
        Some(mac.to_string())
    }
}
