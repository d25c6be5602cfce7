//! Instance disk management: qcow2 copy-on-write overlays via `qemu-img`.
//!
//! Template disks are immutable; every VM gets an overlay at
//! `INSTANCE_DIR/<vm_id>.qcow2` whose backing file is the template for its
//! image type. Writes land in the overlay, reads fall through.

use std::path::PathBuf;

use serde::Deserialize;

use crate::config::Config;
use crate::error::ForgeError;

/// Subset of `qemu-img info --output=json` this service cares about.
#[derive(Debug, Deserialize)]
pub struct DiskInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size")]
    pub actual_size: u64,
    pub format: String,
    #[serde(rename = "backing-filename")]
    pub backing_filename: Option<String>,
}

/// Create a copy-on-write clone of the template for `image_tag`.
///
/// Fails with `TemplateMissing` when the template file is absent and
/// `CloneFailed` when `qemu-img` exits non-zero.
pub async fn clone_image(
    config: &Config,
    vm_id: &str,
    image_tag: &str,
) -> Result<PathBuf, ForgeError> {
    let template = config.template_path(image_tag);
    if !template.exists() {
        return Err(ForgeError::TemplateMissing {
            path: template.display().to_string(),
        });
    }

    let dest = config.disk_path(vm_id);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ForgeError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let output = tokio::process::Command::new("qemu-img")
        .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
        .arg(&template)
        .arg(&dest)
        .output()
        .await
        .map_err(|e| ForgeError::Io {
            context: "running qemu-img".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ForgeError::CloneFailed {
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(
        path = %dest.display(),
        template = %template.display(),
        "created qcow2 overlay"
    );
    Ok(dest)
}

/// Remove a VM's overlay disk. Missing is not an error.
pub async fn delete_image(config: &Config, vm_id: &str) -> Result<(), ForgeError> {
    let disk_path = config.disk_path(vm_id);
    match tokio::fs::remove_file(&disk_path).await {
        Ok(()) => {
            tracing::info!(path = %disk_path.display(), "deleted instance disk");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ForgeError::Io {
            context: format!("removing {}", disk_path.display()),
            source: e,
        }),
    }
}

/// Query an overlay's geometry and backing file.
pub async fn disk_info(config: &Config, vm_id: &str) -> Result<DiskInfo, ForgeError> {
    let disk_path = config.disk_path(vm_id);

    let output = tokio::process::Command::new("qemu-img")
        .args(["info", "--output=json"])
        .arg(&disk_path)
        .output()
        .await
        .map_err(|e| ForgeError::Io {
            context: "running qemu-img info".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ForgeError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(|e| ForgeError::ExternalCommand {
        command: "qemu-img".into(),
        message: format!("unparseable info output: {e}"),
    })
}

/// Grow an overlay to `size_gb`. The caller must ensure the domain is
/// stopped first — resizing a disk under a running guest corrupts it.
pub async fn resize_disk(config: &Config, vm_id: &str, size_gb: u32) -> Result<(), ForgeError> {
    let disk_path = config.disk_path(vm_id);

    let output = tokio::process::Command::new("qemu-img")
        .arg("resize")
        .arg(&disk_path)
        .arg(format!("{size_gb}G"))
        .output()
        .await
        .map_err(|e| ForgeError::Io {
            context: "running qemu-img resize".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ForgeError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(path = %disk_path.display(), size_gb, "resized instance disk");
    Ok(())
}

/// Exists-check used by delete-path tests.
pub fn disk_exists(config: &Config, vm_id: &str) -> bool {
    config.disk_path(vm_id).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[tokio::test]
    async fn clone_fails_when_template_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config::test_config(dir.path().to_path_buf());

        let err = clone_image(&cfg, "vm-1", "debian-12").await.unwrap_err();
        assert!(matches!(err, ForgeError::TemplateMissing { .. }));
        assert!(!disk_exists(&cfg, "vm-1"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config::test_config(dir.path().to_path_buf());

        delete_image(&cfg, "nonexistent").await.unwrap();

        std::fs::create_dir_all(cfg.instance_dir()).unwrap();
        std::fs::write(cfg.disk_path("vm-1"), b"fake qcow2").unwrap();
        delete_image(&cfg, "vm-1").await.unwrap();
        assert!(!disk_exists(&cfg, "vm-1"));
        delete_image(&cfg, "vm-1").await.unwrap();
    }

    #[test]
    fn disk_info_parses_qemu_img_json() {
        let raw = r#"{
            "virtual-size": 10737418240,
            "filename": "/data/instances/abc.qcow2",
            "cluster-size": 65536,
            "format": "qcow2",
            "actual-size": 200704,
            "backing-filename": "/data/images/debian-12-template.qcow2",
            "dirty-flag": false
        }"#;
        let info: DiskInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.virtual_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(info.actual_size, 200704);
        assert_eq!(info.format, "qcow2");
        assert_eq!(
            info.backing_filename.as_deref(),
            Some("/data/images/debian-12-template.qcow2")
        );
    }
}
