//! Host port allocation for SSH forwarding.
//!
//! Allocation is monotonic: the next port is one past the highest port ever
//! recorded in the catalog, and freed ports are not reused. Reuse would risk
//! colliding with stale firewall rules left by an unclean shutdown; gaps in
//! the range are harmless. The catalog's unique `host_port` column is the
//! final arbiter when two provisionings race.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::ForgeError;

/// Assign the next free host port, or `PortExhausted` past `END_PORT`.
pub fn allocate(catalog: &Catalog, config: &Config) -> Result<u16, ForgeError> {
    let floor = config.start_port - 1;
    let highest = catalog.max_host_port()?.unwrap_or(floor).max(floor);
    let next = highest + 1;

    if next > config.end_port {
        return Err(ForgeError::PortExhausted {
            start: config.start_port,
            end: config.end_port,
        });
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{VmRecord, VmStatus};
    use crate::config;

    fn record(id: &str, owner: &str, port: u16) -> VmRecord {
        VmRecord {
            id: id.into(),
            name: id.into(),
            owner_id: owner.into(),
            status: VmStatus::Running,
            ip: None,
            host_port: port,
            disk_path: format!("/data/instances/{id}.qcow2"),
            iso_path: format!("/data/cloud-init/{id}.iso"),
            image_type: "debian-12".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn first_allocation_is_start_port() {
        let cfg = config::test_config("/tmp".into());
        let cat = Catalog::open_in_memory().unwrap();
        assert_eq!(allocate(&cat, &cfg).unwrap(), 2222);
    }

    #[test]
    fn allocation_is_monotonic() {
        let cfg = config::test_config("/tmp".into());
        let cat = Catalog::open_in_memory().unwrap();
        let user = cat.add_user("alice", "h", "k").unwrap();

        cat.add_vm(&record("a", &user.id, 2222)).unwrap();
        assert_eq!(allocate(&cat, &cfg).unwrap(), 2223);

        // Freed ports are not reused.
        cat.add_vm(&record("b", &user.id, 2223)).unwrap();
        cat.delete_vm("a", &user.id).unwrap();
        assert_eq!(allocate(&cat, &cfg).unwrap(), 2224);
    }

    #[test]
    fn end_port_is_allocatable_then_exhausted() {
        let mut cfg = config::test_config("/tmp".into());
        cfg.start_port = 2222;
        cfg.end_port = 2223;
        let cat = Catalog::open_in_memory().unwrap();
        let user = cat.add_user("alice", "h", "k").unwrap();

        cat.add_vm(&record("a", &user.id, 2222)).unwrap();
        assert_eq!(allocate(&cat, &cfg).unwrap(), 2223);

        cat.add_vm(&record("b", &user.id, 2223)).unwrap();
        let err = allocate(&cat, &cfg).unwrap_err();
        assert!(matches!(err, ForgeError::PortExhausted { .. }));
    }
}
