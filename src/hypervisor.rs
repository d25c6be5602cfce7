//! Libvirt adapter: one lazily opened, process-wide connection plus the
//! domain operations the provisioning pipeline needs.
//!
//! All methods are synchronous — libvirt calls block — and callers on the
//! async side run them through `tokio::task::spawn_blocking`. The adapter
//! transparently re-opens the connection when it has died; if the re-open
//! fails the error surfaces as a hypervisor error.

use std::sync::{Mutex, MutexGuard};

use virt::connect::Connect;
use virt::domain::{Domain, Interface};
use virt::error as virt_error;
use virt::sys;

use crate::error::ForgeError;

/// Where interface addresses come from: the bridge's DHCP leases, or the
/// in-guest agent over virtio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSource {
    Lease,
    Agent,
}

impl AddrSource {
    fn flag(self) -> u32 {
        match self {
            AddrSource::Lease => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE,
            AddrSource::Agent => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    pub fn as_str(self) -> &'static str {
        match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Unknown => "unknown",
        }
    }

    fn from_virt(state: sys::virDomainState) -> Self {
        match state {
            sys::VIR_DOMAIN_NOSTATE => DomainState::NoState,
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }
}

pub struct Hypervisor {
    uri: String,
    conn: Mutex<Option<Connect>>,
}

impl Hypervisor {
    /// Create the adapter without connecting; the first operation opens the
    /// connection.
    pub fn new(uri: &str) -> Self {
        Hypervisor {
            uri: uri.to_string(),
            conn: Mutex::new(None),
        }
    }

    /// Run `f` against a live connection, opening or re-opening as needed.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connect) -> Result<T, ForgeError>,
    ) -> Result<T, ForgeError> {
        let mut guard: MutexGuard<'_, Option<Connect>> = self.conn.lock().unwrap();

        let alive = guard
            .as_ref()
            .is_some_and(|c| c.is_alive().unwrap_or(false));
        if !alive {
            if guard.is_some() {
                tracing::warn!(uri = %self.uri, "libvirt connection died, re-opening");
            }
            let conn = Connect::open(Some(self.uri.as_str())).map_err(|e| ForgeError::Hypervisor {
                message: format!("failed to connect to libvirt: {e}"),
                hint: format!("ensure libvirtd is running and you have access to {}", self.uri),
            })?;
            *guard = Some(conn);
        }

        f(guard.as_ref().unwrap())
    }

    /// Define the domain persistently, then start it. On any start failure
    /// the fresh definition is undefined again so no half-defined domain
    /// leaks. Returns the domain UUID, which equals the VM id in the XML.
    pub fn define_and_start(&self, xml: &str) -> Result<String, ForgeError> {
        self.with_conn(|conn| {
            let dom = Domain::define_xml(conn, xml).map_err(|e| ForgeError::DomainDefineFailed {
                message: e.to_string(),
            })?;

            if let Err(e) = dom.create() {
                if let Err(undef) = dom.undefine() {
                    tracing::warn!(error = %undef, "could not undefine domain after start failure");
                }
                return Err(ForgeError::DomainStartFailed {
                    message: e.to_string(),
                });
            }

            let uuid = dom.get_uuid_string().map_err(|e| ForgeError::Hypervisor {
                message: format!("domain started but UUID query failed: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
            tracing::info!(domain = %uuid, "domain defined and started");
            Ok(uuid)
        })
    }

    /// Stop a running domain and optionally remove its persistent
    /// definition. Both sub-steps are tolerated to fail independently — a
    /// delete flow must make as much progress as it can.
    pub fn destroy(&self, vm_id: &str, undefine: bool) -> Result<(), ForgeError> {
        self.with_conn(|conn| {
            let dom = match Domain::lookup_by_uuid_string(conn, vm_id) {
                Ok(dom) => dom,
                Err(_) => {
                    tracing::debug!(vm_id, "domain not found, nothing to destroy");
                    return Ok(());
                }
            };

            if dom.is_active().unwrap_or(false) {
                match dom.destroy() {
                    Ok(_) => tracing::info!(vm_id, "destroyed running domain"),
                    Err(e) => tracing::warn!(vm_id, error = %e, "failed to destroy domain"),
                }
            }

            if undefine {
                match dom.undefine() {
                    Ok(_) => tracing::info!(vm_id, "undefined domain"),
                    Err(e) => tracing::warn!(vm_id, error = %e, "failed to undefine domain"),
                }
            }

            Ok(())
        })
    }

    pub fn state(&self, vm_id: &str) -> Result<DomainState, ForgeError> {
        self.with_conn(|conn| {
            let dom =
                Domain::lookup_by_uuid_string(conn, vm_id).map_err(|_| ForgeError::NotFound {
                    what: format!("domain {vm_id}"),
                })?;
            let (state, _reason) = dom.get_state().map_err(|e| ForgeError::Hypervisor {
                message: format!("querying domain state failed: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
            Ok(DomainState::from_virt(state))
        })
    }

    pub fn interface_addresses(
        &self,
        vm_id: &str,
        source: AddrSource,
    ) -> Result<Vec<Interface>, ForgeError> {
        self.with_conn(|conn| {
            let dom =
                Domain::lookup_by_uuid_string(conn, vm_id).map_err(|_| ForgeError::NotFound {
                    what: format!("domain {vm_id}"),
                })?;
            dom.interface_addresses(source.flag(), 0)
                .map_err(|e| ForgeError::Hypervisor {
                    message: format!("interface address query failed: {e}"),
                    hint: "the guest may still be booting".into(),
                })
        })
    }

    /// The live XML description, used to re-extract the NIC MAC.
    pub fn domain_xml(&self, vm_id: &str) -> Result<String, ForgeError> {
        self.with_conn(|conn| {
            let dom =
                Domain::lookup_by_uuid_string(conn, vm_id).map_err(|_| ForgeError::NotFound {
                    what: format!("domain {vm_id}"),
                })?;
            dom.get_xml_desc(0).map_err(|e| ForgeError::Hypervisor {
                message: format!("XML description query failed: {e}"),
                hint: "check libvirt permissions".into(),
            })
        })
    }
}

// ── stderr suppression ──────────────────────────────────────
//
// Libvirt installs a default error handler that prints every failed call to
// stderr. During IP polling the agent source fails dozens of times per VM,
// which would flood the journal. The handler is therefore swapped for a
// no-op while any polling operation runs; a reference counter lets
// concurrent resolvers share the suppression and the default handler comes
// back only when the last one releases — on every exit path, because the
// release lives in Drop.

static SUPPRESS_COUNT: Mutex<usize> = Mutex::new(0);

/// RAII guard for libvirt stderr suppression. Hold it for the duration of a
/// polling operation.
pub struct QuietErrors(());

pub fn suppress_stderr() -> QuietErrors {
    let mut count = SUPPRESS_COUNT.lock().unwrap();
    *count += 1;
    if *count == 1 {
        // First suppressor: install the no-op callback so errors only
        // surface through Result values.
        virt_error::clear_error_callback();
    }
    QuietErrors(())
}

impl Drop for QuietErrors {
    fn drop(&mut self) {
        let mut count = SUPPRESS_COUNT.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            // Last suppressor gone: hand reporting back to libvirt's
            // built-in stderr handler.
            unsafe { sys::virSetErrorFunc(std::ptr::null_mut(), None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_covers_libvirt_states() {
        assert_eq!(
            DomainState::from_virt(sys::VIR_DOMAIN_RUNNING),
            DomainState::Running
        );
        assert_eq!(
            DomainState::from_virt(sys::VIR_DOMAIN_SHUTOFF),
            DomainState::Shutoff
        );
        assert_eq!(
            DomainState::from_virt(sys::VIR_DOMAIN_PMSUSPENDED),
            DomainState::Suspended
        );
        assert_eq!(DomainState::from_virt(9999), DomainState::Unknown);
    }

    #[test]
    fn state_strings_are_stable() {
        assert_eq!(DomainState::Running.as_str(), "running");
        assert_eq!(DomainState::Shutoff.as_str(), "shutoff");
        assert_eq!(DomainState::NoState.as_str(), "nostate");
        assert_eq!(DomainState::Unknown.as_str(), "unknown");
    }

    #[test]
    fn suppression_refcount_balances() {
        {
            let _a = suppress_stderr();
            let _b = suppress_stderr();
            assert_eq!(*SUPPRESS_COUNT.lock().unwrap(), 2);
        }
        assert_eq!(*SUPPRESS_COUNT.lock().unwrap(), 0);
    }
}
