use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ForgeError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("duplicate {what}")]
    DuplicateKey { what: String },

    #[error("no available ports in range {start}-{end}")]
    #[diagnostic(help("delete unused VMs or widen START_PORT/END_PORT"))]
    PortExhausted { start: u16, end: u16 },

    #[error("template not found: {path}")]
    #[diagnostic(help("place the template image under DATA_DIR/images"))]
    TemplateMissing { path: String },

    #[error("disk clone failed: {message}")]
    CloneFailed { message: String },

    #[error("seed ISO build failed: {message}")]
    IsoBuildFailed { message: String },

    #[error("failed to define domain: {message}")]
    #[diagnostic(help("check the generated domain XML for errors"))]
    DomainDefineFailed { message: String },

    #[error("failed to start domain: {message}")]
    #[diagnostic(help("check `virsh -c qemu:///system start` for details"))]
    DomainStartFailed { message: String },

    #[error("timed out waiting for IP of VM {vm_id} after {timeout_s}s")]
    #[diagnostic(help("check that the guest image runs cloud-init and requests a DHCP lease"))]
    IpDiscoveryTimeout { vm_id: String, timeout_s: u64 },

    #[error("firewall rule install failed: {message}")]
    #[diagnostic(help("the service needs permission to run iptables"))]
    NatInstallFailed { message: String },

    #[error("hypervisor error: {message}")]
    #[diagnostic(help("{hint}"))]
    Hypervisor { message: String, hint: String },

    #[error("catalog error: {context}")]
    Catalog {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    #[diagnostic(help("ensure {command} is installed and accessible"))]
    ExternalCommand { command: String, message: String },

    #[error("provisioning failed: {source}")]
    ProvisioningFailed {
        #[source]
        source: Box<ForgeError>,
    },

    #[error("{message}")]
    Internal { message: String },
}

impl ForgeError {
    /// Wrap a pipeline failure so the original cause stays visible.
    pub fn provisioning(cause: ForgeError) -> Self {
        ForgeError::ProvisioningFailed {
            source: Box::new(cause),
        }
    }
}
