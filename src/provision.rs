//! The provisioning coordinator: the ordered create pipeline, its
//! compensating cleanup, and the delete flow.
//!
//! Seven heterogeneous resources (host port, seed ISO, overlay disk,
//! hypervisor domain, guest IP binding, NAT rules, catalog row) cannot share
//! a transaction, so create runs as a saga: each forward step's compensator
//! is pushed onto a log *before* the step executes, and on any failure the
//! log unwinds in LIFO order. Compensation failures are logged and
//! swallowed — they must never mask the original error nor stop later
//! compensators. The catalog row is acquired last, so a successful return
//! implies the record is durably committed and every resource it names
//! existed at commit time.

use std::sync::Arc;

use crate::catalog::{Catalog, VmRecord, VmStatus};
use crate::cloudinit::{self, SeedSpec};
use crate::config::{self, Config};
use crate::disk;
use crate::domain_xml::{self, DomainSpec};
use crate::error::ForgeError;
use crate::hypervisor::Hypervisor;
use crate::nat;
use crate::ports;
use crate::resolver;

/// Validated create-request parameters.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub name: String,
    pub ssh_key: String,
    pub image_type: String,
    pub memory_mb: u32,
    pub vcpus: u32,
}

/// One entry in the compensation log: how to reverse a forward step that
/// has (possibly partially) executed.
enum Compensation {
    DeleteSeedIso { vm_id: String },
    DeleteDisk { vm_id: String },
    DestroyDomain { vm_id: String },
    RemoveNat { host_port: u16, guest_ip: String },
    DeleteRecord { vm_id: String, owner_id: String },
}

#[derive(Clone)]
pub struct Provisioner {
    config: Arc<Config>,
    catalog: Arc<Catalog>,
    hypervisor: Arc<Hypervisor>,
}

impl Provisioner {
    pub fn new(config: Arc<Config>, catalog: Arc<Catalog>, hypervisor: Arc<Hypervisor>) -> Self {
        Provisioner {
            config,
            catalog,
            hypervisor,
        }
    }

    /// Provision a new VM for `owner_id`.
    ///
    /// On success the returned record is already committed to the catalog.
    /// On failure every acquired resource has been released and the cause
    /// is wrapped in `ProvisioningFailed`.
    ///
    /// The pipeline runs on a detached task: a caller that disconnects
    /// mid-provisioning never aborts a step, because step boundaries are
    /// where compensation is defined. The work always runs to completion
    /// or full compensation.
    pub async fn create(
        &self,
        owner_id: &str,
        params: CreateParams,
    ) -> Result<VmRecord, ForgeError> {
        let this = self.clone();
        let owner = owner_id.to_string();
        tokio::spawn(async move { this.create_pipeline(&owner, params).await })
            .await
            .map_err(join_err)?
    }

    async fn create_pipeline(
        &self,
        owner_id: &str,
        params: CreateParams,
    ) -> Result<VmRecord, ForgeError> {
        // Validation happens before anything is acquired.
        if config::lookup_image(&params.image_type).is_none() {
            return Err(ForgeError::Validation {
                message: format!("unknown image type: {}", params.image_type),
            });
        }
        let memory_mb = self.config.clamp_memory(params.memory_mb);
        let vcpus = self.config.clamp_vcpus(params.vcpus);

        let vm_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(vm_id = %vm_id, name = %params.name, image = %params.image_type, "provisioning VM");

        let mut undo: Vec<Compensation> = Vec::new();
        match self
            .run_pipeline(owner_id, &vm_id, &params, memory_mb, vcpus, &mut undo)
            .await
        {
            Ok(record) => Ok(record),
            Err(cause) => {
                tracing::error!(vm_id = %vm_id, error = %cause, "provisioning failed, compensating");
                self.compensate(undo).await;
                Err(ForgeError::provisioning(cause))
            }
        }
    }

    async fn run_pipeline(
        &self,
        owner_id: &str,
        vm_id: &str,
        params: &CreateParams,
        memory_mb: u32,
        vcpus: u32,
        undo: &mut Vec<Compensation>,
    ) -> Result<VmRecord, ForgeError> {
        let image = config::lookup_image(&params.image_type).expect("image validated above");
        let mac = domain_xml::generate_mac(vm_id);

        // 1. Allocate host port. The monotonic allocator needs no
        // compensator: an unused port is harmless and never reused.
        let host_port = ports::allocate(&self.catalog, &self.config)?;

        // 2. Build the cloud-init seed ISO.
        undo.push(Compensation::DeleteSeedIso {
            vm_id: vm_id.to_string(),
        });
        let iso_path = cloudinit::write_seed_iso(
            &self.config,
            &SeedSpec {
                vm_id,
                hostname: &params.name,
                username: image.username,
                ssh_key: &params.ssh_key,
                mac_address: Some(&mac),
            },
        )
        .await?;

        // 3. Clone the template disk.
        undo.push(Compensation::DeleteDisk {
            vm_id: vm_id.to_string(),
        });
        let disk_path = disk::clone_image(&self.config, vm_id, &params.image_type).await?;

        // 4. Define and start the domain.
        undo.push(Compensation::DestroyDomain {
            vm_id: vm_id.to_string(),
        });
        let xml = domain_xml::build_definition(&DomainSpec {
            vm_id,
            name: &params.name,
            disk_path: &disk_path,
            iso_path: &iso_path,
            memory_mb,
            vcpus,
            network: &self.config.vm_network,
            mac_address: &mac,
        });
        {
            let hypervisor = Arc::clone(&self.hypervisor);
            tokio::task::spawn_blocking(move || hypervisor.define_and_start(&xml))
                .await
                .map_err(join_err)??;
        }

        // 5. Wait for the guest's IP. Discovery has no side effects, so
        // there is nothing to compensate.
        let guest_ip = {
            let hypervisor = Arc::clone(&self.hypervisor);
            let config = Arc::clone(&self.config);
            let id = vm_id.to_string();
            tokio::task::spawn_blocking(move || {
                resolver::resolve_ip(&hypervisor, &config, &id, resolver::DEFAULT_TIMEOUT)
            })
            .await
            .map_err(join_err)??
        };

        // 6. Install the NAT rules.
        undo.push(Compensation::RemoveNat {
            host_port,
            guest_ip: guest_ip.clone(),
        });
        nat::add_port_forward(host_port, &guest_ip).await?;

        // 7. Commit the record. A racing provisioning that picked the same
        // port loses here on the unique column and unwinds fully.
        undo.push(Compensation::DeleteRecord {
            vm_id: vm_id.to_string(),
            owner_id: owner_id.to_string(),
        });
        let record = VmRecord {
            id: vm_id.to_string(),
            name: params.name.clone(),
            owner_id: owner_id.to_string(),
            status: VmStatus::Running,
            ip: Some(guest_ip),
            host_port,
            disk_path: disk_path.display().to_string(),
            iso_path: iso_path.display().to_string(),
            image_type: params.image_type.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.catalog.add_vm(&record)?;

        tracing::info!(vm_id = %vm_id, host_port, "VM provisioned");
        Ok(record)
    }

    /// Unwind the compensation log in LIFO order. Individual failures are
    /// logged, never propagated, and never stop the remaining compensators.
    async fn compensate(&self, undo: Vec<Compensation>) {
        for step in undo.into_iter().rev() {
            match step {
                Compensation::DeleteRecord { vm_id, owner_id } => {
                    if let Err(e) = self.catalog.delete_vm(&vm_id, &owner_id) {
                        tracing::warn!(vm_id = %vm_id, error = %e, "cleanup: record delete failed");
                    }
                }
                Compensation::RemoveNat {
                    host_port,
                    guest_ip,
                } => {
                    nat::remove_port_forward(host_port, &guest_ip).await;
                }
                Compensation::DestroyDomain { vm_id } => {
                    let hypervisor = Arc::clone(&self.hypervisor);
                    let id = vm_id.clone();
                    match tokio::task::spawn_blocking(move || hypervisor.destroy(&id, true)).await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(vm_id = %vm_id, error = %e, "cleanup: domain destroy failed");
                        }
                        Err(e) => {
                            tracing::warn!(vm_id = %vm_id, error = %e, "cleanup: destroy task failed");
                        }
                    }
                }
                Compensation::DeleteDisk { vm_id } => {
                    if let Err(e) = disk::delete_image(&self.config, &vm_id).await {
                        tracing::warn!(vm_id = %vm_id, error = %e, "cleanup: disk delete failed");
                    }
                }
                Compensation::DeleteSeedIso { vm_id } => {
                    if let Err(e) = cloudinit::delete_seed_iso(&self.config, &vm_id).await {
                        tracing::warn!(vm_id = %vm_id, error = %e, "cleanup: ISO delete failed");
                    }
                }
            }
        }
    }

    /// Tear down a VM and release everything it holds.
    ///
    /// Sub-step failures are logged and skipped; the operation as a whole
    /// succeeds if and only if the catalog row is removed. Detached for the
    /// same reason as `create`: a dropped caller must not leave a
    /// half-released VM behind.
    pub async fn delete(&self, owner_id: &str, vm_id: &str) -> Result<(), ForgeError> {
        let this = self.clone();
        let owner = owner_id.to_string();
        let id = vm_id.to_string();
        tokio::spawn(async move { this.delete_resources(&owner, &id).await })
            .await
            .map_err(join_err)?
    }

    async fn delete_resources(&self, owner_id: &str, vm_id: &str) -> Result<(), ForgeError> {
        let vm = self
            .catalog
            .get_vm(vm_id, owner_id)?
            .ok_or_else(|| ForgeError::NotFound {
                what: format!("VM {vm_id}"),
            })?;

        if let Some(ip) = vm.ip.as_deref() {
            nat::remove_port_forward(vm.host_port, ip).await;
        }

        {
            let hypervisor = Arc::clone(&self.hypervisor);
            let id = vm_id.to_string();
            match tokio::task::spawn_blocking(move || hypervisor.destroy(&id, true)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(vm_id, error = %e, "failed to destroy domain"),
                Err(e) => tracing::warn!(vm_id, error = %e, "destroy task failed"),
            }
        }

        if let Err(e) = disk::delete_image(&self.config, vm_id).await {
            tracing::warn!(vm_id, error = %e, "failed to delete disk");
        }
        if let Err(e) = cloudinit::delete_seed_iso(&self.config, vm_id).await {
            tracing::warn!(vm_id, error = %e, "failed to delete seed ISO");
        }

        if !self.catalog.delete_vm(vm_id, owner_id)? {
            return Err(ForgeError::NotFound {
                what: format!("VM {vm_id}"),
            });
        }

        tracing::info!(vm_id, "VM deleted");
        Ok(())
    }
}

fn join_err(e: tokio::task::JoinError) -> ForgeError {
    ForgeError::Internal {
        message: format!("blocking task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner(data_dir: std::path::PathBuf) -> Provisioner {
        let config = Arc::new(config::test_config(data_dir));
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let hypervisor = Arc::new(Hypervisor::new("test:///default"));
        Provisioner::new(config, catalog, hypervisor)
    }

    fn params(image_type: &str) -> CreateParams {
        CreateParams {
            name: "web1".into(),
            ssh_key: "ssh-rsa AAA test@host".into(),
            image_type: image_type.into(),
            memory_mb: 512,
            vcpus: 1,
        }
    }

    #[tokio::test]
    async fn unknown_image_type_fails_validation_with_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path().to_path_buf());
        let owner = p.catalog.add_user("alice", "h", "k").unwrap();

        let err = p.create(&owner.id, params("windows")).await.unwrap_err();
        assert!(matches!(err, ForgeError::Validation { .. }));

        // Nothing was acquired: catalog empty, no files on disk.
        assert!(p.catalog.list_vms(&owner.id).unwrap().is_empty());
        assert_eq!(p.catalog.max_host_port().unwrap(), None);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn missing_template_fails_and_compensation_removes_seed_iso() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path().to_path_buf());
        p.config.ensure_directories().unwrap();
        let owner = p.catalog.add_user("alice", "h", "k").unwrap();

        // Step 2 (seed ISO) succeeds, step 3 (clone) fails on the missing
        // template, so the compensation log must remove the ISO again.
        let err = p.create(&owner.id, params("debian-12")).await.unwrap_err();
        let ForgeError::ProvisioningFailed { source } = err else {
            panic!("expected ProvisioningFailed, got {err:?}");
        };
        assert!(matches!(*source, ForgeError::TemplateMissing { .. }));

        assert!(p.catalog.list_vms(&owner.id).unwrap().is_empty());
        let leftover_isos = std::fs::read_dir(p.config.cloud_init_dir())
            .unwrap()
            .count();
        assert_eq!(leftover_isos, 0, "compensation should remove the seed ISO");
        let leftover_disks = std::fs::read_dir(p.config.instance_dir()).unwrap().count();
        assert_eq!(leftover_disks, 0);
    }

    #[tokio::test]
    async fn delete_of_missing_vm_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path().to_path_buf());
        let owner = p.catalog.add_user("alice", "h", "k").unwrap();

        let err = p.delete(&owner.id, "no-such-vm").await.unwrap_err();
        assert!(matches!(err, ForgeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_is_owner_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path().to_path_buf());
        let alice = p.catalog.add_user("alice", "h", "ka").unwrap();
        let bob = p.catalog.add_user("bob", "h", "kb").unwrap();

        p.catalog
            .add_vm(&VmRecord {
                id: "vm-1".into(),
                name: "web1".into(),
                owner_id: alice.id.clone(),
                status: VmStatus::Running,
                ip: None,
                host_port: 2222,
                disk_path: "/tmp/none.qcow2".into(),
                iso_path: "/tmp/none.iso".into(),
                image_type: "debian-12".into(),
                created_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();

        let err = p.delete(&bob.id, "vm-1").await.unwrap_err();
        assert!(matches!(err, ForgeError::NotFound { .. }));
        assert!(p.catalog.get_vm("vm-1", &alice.id).unwrap().is_some());
    }
}
