//! Durable catalog of users and VM records, backed by SQLite.
//!
//! The catalog is the single source of truth for what this service believes
//! exists: a VM row is inserted only after every external resource (disk,
//! seed ISO, domain, NAT rules) has been acquired, and removed only by the
//! delete flow. Writers are serialized by a process-local mutex, which is
//! enough for a single-process service and keeps the port-uniqueness insert
//! race-free.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ForgeError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    hashed_password TEXT NOT NULL,
    api_key_hash TEXT UNIQUE NOT NULL
);
CREATE TABLE IF NOT EXISTS vms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    status TEXT NOT NULL,
    ip TEXT,
    host_port INTEGER UNIQUE NOT NULL,
    disk_path TEXT NOT NULL,
    iso_path TEXT NOT NULL,
    image_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE CASCADE
);
";

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub name: String,
    pub hashed_password: String,
    pub api_key_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

impl VmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Pending => "pending",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(VmStatus::Pending),
            "running" => Some(VmStatus::Running),
            "stopped" => Some(VmStatus::Stopped),
            "failed" => Some(VmStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub status: VmStatus,
    pub ip: Option<String>,
    pub host_port: u16,
    pub disk_path: String,
    pub iso_path: String,
    pub image_type: String,
    pub created_at: String,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

fn db(context: &'static str) -> impl FnOnce(rusqlite::Error) -> ForgeError {
    move |source| ForgeError::Catalog {
        context: context.into(),
        source,
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn vm_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VmRecord> {
    let status_raw: String = row.get("status")?;
    let status = VmStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown VM status '{status_raw}'").into(),
        )
    })?;
    Ok(VmRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        owner_id: row.get("owner_id")?,
        status,
        ip: row.get("ip")?,
        host_port: row.get::<_, i64>("host_port")? as u16,
        disk_path: row.get("disk_path")?,
        iso_path: row.get("iso_path")?,
        image_type: row.get("image_type")?,
        created_at: row.get("created_at")?,
    })
}

impl Catalog {
    /// Open (or create) the catalog database and apply the schema.
    pub fn open(path: &Path) -> Result<Self, ForgeError> {
        let conn = Connection::open(path).map_err(db("opening database"))?;
        Self::init(conn)
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self, ForgeError> {
        let conn = Connection::open_in_memory().map_err(db("opening in-memory database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ForgeError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db("enabling foreign keys"))?;
        conn.execute_batch(SCHEMA).map_err(db("creating schema"))?;
        Ok(Catalog {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ── users ────────────────────────────────────────────────

    pub fn add_user(
        &self,
        name: &str,
        hashed_password: &str,
        api_key_hash: &str,
    ) -> Result<User, ForgeError> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            hashed_password: hashed_password.to_string(),
            api_key_hash: api_key_hash.to_string(),
        };

        let result = self.lock().execute(
            "INSERT INTO users (id, name, hashed_password, api_key_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.name, user.hashed_password, user.api_key_hash],
        );

        match result {
            Ok(_) => {
                tracing::info!(user = %user.name, "user added");
                Ok(user)
            }
            Err(e) if is_unique_violation(&e) => Err(ForgeError::DuplicateKey {
                what: "API key".into(),
            }),
            Err(e) => Err(db("inserting user")(e)),
        }
    }

    pub fn find_user_by_api_key_hash(&self, hash: &str) -> Result<Option<User>, ForgeError> {
        self.lock()
            .query_row(
                "SELECT id, name, hashed_password, api_key_hash
                 FROM users WHERE api_key_hash = ?1",
                params![hash],
                user_from_row,
            )
            .optional()
            .map_err(db("looking up user by API key"))
    }

    pub fn find_user_by_name(&self, name: &str) -> Result<Option<User>, ForgeError> {
        self.lock()
            .query_row(
                "SELECT id, name, hashed_password, api_key_hash
                 FROM users WHERE name = ?1",
                params![name],
                user_from_row,
            )
            .optional()
            .map_err(db("looking up user by name"))
    }

    /// Replace a user's API key hash. Login rotates keys rather than
    /// re-issuing the stored one, since only the hash survives signup.
    pub fn rotate_api_key(&self, user_id: &str, api_key_hash: &str) -> Result<(), ForgeError> {
        let result = self.lock().execute(
            "UPDATE users SET api_key_hash = ?1 WHERE id = ?2",
            params![api_key_hash, user_id],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(ForgeError::DuplicateKey {
                what: "API key".into(),
            }),
            Err(e) => Err(db("rotating API key")(e)),
        }
    }

    // ── vms ──────────────────────────────────────────────────

    pub fn add_vm(&self, vm: &VmRecord) -> Result<(), ForgeError> {
        let result = self.lock().execute(
            "INSERT INTO vms (id, name, owner_id, status, ip, host_port,
                              disk_path, iso_path, image_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                vm.id,
                vm.name,
                vm.owner_id,
                vm.status.as_str(),
                vm.ip,
                vm.host_port as i64,
                vm.disk_path,
                vm.iso_path,
                vm.image_type,
                vm.created_at,
            ],
        );

        match result {
            Ok(_) => {
                tracing::info!(vm = %vm.name, owner = %vm.owner_id, "VM record added");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(ForgeError::DuplicateKey {
                what: format!("host port {}", vm.host_port),
            }),
            Err(e) => Err(db("inserting VM record")(e)),
        }
    }

    pub fn get_vm(&self, vm_id: &str, owner_id: &str) -> Result<Option<VmRecord>, ForgeError> {
        self.lock()
            .query_row(
                "SELECT * FROM vms WHERE id = ?1 AND owner_id = ?2",
                params![vm_id, owner_id],
                vm_from_row,
            )
            .optional()
            .map_err(db("looking up VM"))
    }

    pub fn list_vms(&self, owner_id: &str) -> Result<Vec<VmRecord>, ForgeError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM vms WHERE owner_id = ?1 ORDER BY created_at DESC")
            .map_err(db("listing VMs"))?;
        let rows = stmt
            .query_map(params![owner_id], vm_from_row)
            .map_err(db("listing VMs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("listing VMs"))
    }

    /// Every VM in the catalog, regardless of owner. Used by the startup
    /// firewall-rule restore.
    pub fn all_vms(&self) -> Result<Vec<VmRecord>, ForgeError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM vms ORDER BY created_at DESC")
            .map_err(db("listing all VMs"))?;
        let rows = stmt
            .query_map([], vm_from_row)
            .map_err(db("listing all VMs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("listing all VMs"))
    }

    pub fn update_vm_status(
        &self,
        vm_id: &str,
        owner_id: &str,
        status: VmStatus,
        ip: Option<&str>,
    ) -> Result<bool, ForgeError> {
        let changed = self
            .lock()
            .execute(
                "UPDATE vms SET status = ?1, ip = ?2 WHERE id = ?3 AND owner_id = ?4",
                params![status.as_str(), ip, vm_id, owner_id],
            )
            .map_err(db("updating VM status"))?;
        Ok(changed > 0)
    }

    pub fn delete_vm(&self, vm_id: &str, owner_id: &str) -> Result<bool, ForgeError> {
        let changed = self
            .lock()
            .execute(
                "DELETE FROM vms WHERE id = ?1 AND owner_id = ?2",
                params![vm_id, owner_id],
            )
            .map_err(db("deleting VM record"))?;
        Ok(changed > 0)
    }

    /// Highest host port currently assigned, or None when the catalog holds
    /// no VMs. Feeds the monotonic port allocator.
    pub fn max_host_port(&self) -> Result<Option<u16>, ForgeError> {
        self.lock()
            .query_row("SELECT MAX(host_port) FROM vms", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map(|max| max.map(|p| p as u16))
            .map_err(db("querying max host port"))
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        name: row.get("name")?,
        hashed_password: row.get("hashed_password")?,
        api_key_hash: row.get("api_key_hash")?,
    })
}
