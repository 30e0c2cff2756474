//! Transactional key-value backend under the resource store
//!
//! [`StoreBackend`] is the whole contract the resource store needs: single
//! statements, prefix queries and all-or-nothing statement lists.
//! [`RedbBackend`] implements it on an embedded redb database.

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{NimbusError, NimbusResult};

const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const PROJECTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");
const PROJECT_USER_MAPPINGS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("projectusermappings");
const HOSTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");
const HOST_RESOURCES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("hostresources");
const VMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");
const VNETS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vnets");
const IP_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ip");
const FIREWALL_RULESETS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("firewallrulesets");
const RELATIONSHIPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("relationships");
const RECYCLE_BIN_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("recyclebin");
const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Monotonic counters (network segment numbers)
const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Tables of the resource graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Projects,
    ProjectUserMappings,
    Hosts,
    HostResources,
    Vms,
    Vnets,
    Ip,
    FirewallRulesets,
    Relationships,
    RecycleBin,
    Snapshots,
}

impl Table {
    pub const ALL: [Table; 12] = [
        Table::Users,
        Table::Projects,
        Table::ProjectUserMappings,
        Table::Hosts,
        Table::HostResources,
        Table::Vms,
        Table::Vnets,
        Table::Ip,
        Table::FirewallRulesets,
        Table::Relationships,
        Table::RecycleBin,
        Table::Snapshots,
    ];

    fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Table::Users => USERS_TABLE,
            Table::Projects => PROJECTS_TABLE,
            Table::ProjectUserMappings => PROJECT_USER_MAPPINGS_TABLE,
            Table::Hosts => HOSTS_TABLE,
            Table::HostResources => HOST_RESOURCES_TABLE,
            Table::Vms => VMS_TABLE,
            Table::Vnets => VNETS_TABLE,
            Table::Ip => IP_TABLE,
            Table::FirewallRulesets => FIREWALL_RULESETS_TABLE,
            Table::Relationships => RELATIONSHIPS_TABLE,
            Table::RecycleBin => RECYCLE_BIN_TABLE,
            Table::Snapshots => SNAPSHOTS_TABLE,
        }
    }
}

/// One statement against the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert or replace
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    /// Insert only if the key is free; inside a transaction a taken key aborts everything
    Insert {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    Delete { table: Table, key: String },
    DeletePrefix { table: Table, prefix: String },
}

impl StoreOp {
    pub fn put(table: Table, key: impl Into<String>, value: Vec<u8>) -> Self {
        StoreOp::Put {
            table,
            key: key.into(),
            value,
        }
    }

    pub fn insert(table: Table, key: impl Into<String>, value: Vec<u8>) -> Self {
        StoreOp::Insert {
            table,
            key: key.into(),
            value,
        }
    }

    pub fn delete(table: Table, key: impl Into<String>) -> Self {
        StoreOp::Delete {
            table,
            key: key.into(),
        }
    }

    pub fn delete_prefix(table: Table, prefix: impl Into<String>) -> Self {
        StoreOp::DeletePrefix {
            table,
            prefix: prefix.into(),
        }
    }
}

/// Persistence primitives the resource store is built on
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Run one statement; `true` when something changed
    async fn execute(&self, op: StoreOp) -> NimbusResult<bool>;

    async fn get(&self, table: Table, key: &str) -> NimbusResult<Option<Vec<u8>>>;

    /// Every row whose key starts with `prefix`, in key order
    async fn scan(&self, table: Table, prefix: &str) -> NimbusResult<Vec<(String, Vec<u8>)>>;

    /// Run all statements or none; `false` when an insert hit a taken key
    async fn transaction(&self, ops: Vec<StoreOp>) -> NimbusResult<bool>;

    /// Next value of a named counter, starting at `start`
    async fn next_sequence(&self, name: &str, start: u64) -> NimbusResult<u64>;
}

/// redb implementation of [`StoreBackend`]
#[derive(Clone)]
pub struct RedbBackend {
    database: Arc<Database>,
}

impl RedbBackend {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> NimbusResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let database = Database::create(path)?;
        Self::with_database(database)
    }

    /// Database held in memory, for tests and dry runs
    pub fn in_memory() -> NimbusResult<Self> {
        let database = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::with_database(database)
    }

    fn with_database(database: Database) -> NimbusResult<Self> {
        let write_txn = database.begin_write()?;
        for table in Table::ALL {
            write_txn.open_table(table.definition())?;
        }
        write_txn.open_table(SEQUENCES_TABLE)?;
        write_txn.commit()?;

        Ok(Self {
            database: Arc::new(database),
        })
    }

    fn apply(write_txn: &WriteTransaction, op: &StoreOp) -> NimbusResult<bool> {
        match op {
            StoreOp::Put { table, key, value } => {
                let mut table = write_txn.open_table(table.definition())?;
                table.insert(key.as_str(), value.as_slice())?;
                Ok(true)
            }
            StoreOp::Insert { table, key, value } => {
                let mut table = write_txn.open_table(table.definition())?;
                if table.get(key.as_str())?.is_some() {
                    return Ok(false);
                }
                table.insert(key.as_str(), value.as_slice())?;
                Ok(true)
            }
            StoreOp::Delete { table, key } => {
                let mut table = write_txn.open_table(table.definition())?;
                let removed = table.remove(key.as_str())?.is_some();
                Ok(removed)
            }
            StoreOp::DeletePrefix { table, prefix } => {
                let mut table = write_txn.open_table(table.definition())?;
                let keys = prefix_keys(&table, prefix)?;
                for key in &keys {
                    table.remove(key.as_str())?;
                }
                Ok(!keys.is_empty())
            }
        }
    }
}

fn prefix_keys<T>(table: &T, prefix: &str) -> NimbusResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.range::<&str>(prefix..)? {
        let (key, _) = entry?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

#[async_trait]
impl StoreBackend for RedbBackend {
    async fn execute(&self, op: StoreOp) -> NimbusResult<bool> {
        if matches!(op, StoreOp::Put { .. } | StoreOp::Insert { .. }) {
            crate::fail_point!(crate::failpoints::STORE_PUT);
        }

        let db = self.database.clone();
        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write()?;
            let changed = Self::apply(&write_txn, &op)?;
            write_txn.commit()?;
            Ok(changed)
        })
        .await
        .map_err(|e| NimbusError::Internal {
            message: format!("Task join error: {}", e),
        })?
    }

    async fn get(&self, table: Table, key: &str) -> NimbusResult<Option<Vec<u8>>> {
        let db = self.database.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(table.definition())?;
            let value = table.get(key.as_str())?.map(|bytes| bytes.value().to_vec());
            Ok(value)
        })
        .await
        .map_err(|e| NimbusError::Internal {
            message: format!("Task join error: {}", e),
        })?
    }

    async fn scan(&self, table: Table, prefix: &str) -> NimbusResult<Vec<(String, Vec<u8>)>> {
        let db = self.database.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(table.definition())?;

            let mut rows = Vec::new();
            for entry in table.range::<&str>(prefix.as_str()..)? {
                let (key, bytes) = entry?;
                let key = key.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                rows.push((key.to_string(), bytes.value().to_vec()));
            }
            Ok(rows)
        })
        .await
        .map_err(|e| NimbusError::Internal {
            message: format!("Task join error: {}", e),
        })?
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> NimbusResult<bool> {
        crate::fail_point!(crate::failpoints::STORE_TRANSACTION);

        let db = self.database.clone();
        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write()?;
            for (index, op) in ops.iter().enumerate() {
                let applied = Self::apply(&write_txn, op)?;
                if !applied && matches!(op, StoreOp::Insert { .. }) {
                    debug!(statement = index, "Transaction insert hit an existing key, aborting");
                    write_txn.abort()?;
                    return Ok(false);
                }
            }
            write_txn.commit()?;
            Ok(true)
        })
        .await
        .map_err(|e| NimbusError::Internal {
            message: format!("Task join error: {}", e),
        })?
    }

    async fn next_sequence(&self, name: &str, start: u64) -> NimbusResult<u64> {
        let db = self.database.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write()?;
            let next = {
                let mut table = write_txn.open_table(SEQUENCES_TABLE)?;
                let current = table.get(name.as_str())?.map(|value| value.value());
                let next = match current {
                    Some(value) => value + 1,
                    None => start,
                };
                table.insert(name.as_str(), next)?;
                next
            };
            write_txn.commit()?;
            Ok(next)
        })
        .await
        .map_err(|e| NimbusError::Internal {
            message: format!("Task join error: {}", e),
        })?
    }
}
