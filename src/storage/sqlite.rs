//! SQLite implementation of [`NftStore`].
//!
//! Addresses and hashes are stored as `0x`-prefixed lowercase hex text, token
//! ids and amounts as decimal text, timestamps as RFC 3339 text.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::limits::Limit;
use rusqlite::{params, params_from_iter, CachedStatement, Connection, OptionalExtension};
use uuid::Uuid;

use super::{
    BlockMonitorTask, BlockTaskStatus, CollectionRecord, NftStore, OwnerRecord, OwnerTask,
    StoreError, TokenKey, TokenRecord, TransferHistoryRecord,
};
use crate::etl::event::{Address, SourceTag, TokenStandard, Version, H256, U256};

pub const DEFAULT_WRITE_BATCH_SIZE: usize = 500;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS nft_token_owners (
        contract_address TEXT NOT NULL,
        token_id TEXT NOT NULL,
        owner TEXT NOT NULL,
        block_num INTEGER NOT NULL,
        log_index INTEGER NOT NULL,
        token_type TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (contract_address, token_id)
    );
    CREATE INDEX IF NOT EXISTS idx_nft_token_owners_owner ON nft_token_owners(owner);

    CREATE TABLE IF NOT EXISTS nft_transfer_history (
        contract_address TEXT NOT NULL,
        token_id TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        log_index INTEGER NOT NULL,
        block_num INTEGER NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT NOT NULL,
        token_type TEXT NOT NULL,
        value TEXT,
        PRIMARY KEY (contract_address, token_id, tx_hash, log_index)
    );
    CREATE INDEX IF NOT EXISTS idx_nft_transfer_history_block ON nft_transfer_history(block_num);

    CREATE TABLE IF NOT EXISTS nft_tokens (
        contract_address TEXT NOT NULL,
        token_id TEXT NOT NULL,
        token_type TEXT NOT NULL,
        source TEXT NOT NULL,
        value TEXT,
        tx_hash TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (contract_address, token_id)
    );

    CREATE TABLE IF NOT EXISTS nft_collections (
        contract_address TEXT PRIMARY KEY,
        token_type TEXT NOT NULL,
        source TEXT NOT NULL,
        first_check_at TEXT,
        processed_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nft_owner_tasks (
        contract_address TEXT NOT NULL,
        token_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        token_type TEXT NOT NULL,
        priority INTEGER NOT NULL,
        is_processing INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (contract_address, token_id, task_id)
    );
    CREATE INDEX IF NOT EXISTS idx_nft_owner_tasks_pending ON nft_owner_tasks(is_processing, priority);

    CREATE TABLE IF NOT EXISTS nft_block_monitor_tasks (
        message_id TEXT PRIMARY KEY,
        block_num INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        updated_at TEXT NOT NULL
    );
";

const UPSERT_OWNER: &str = "
    INSERT INTO nft_token_owners
        (contract_address, token_id, owner, block_num, log_index, token_type, tx_hash, value, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(contract_address, token_id) DO UPDATE SET
        owner = excluded.owner,
        block_num = excluded.block_num,
        log_index = excluded.log_index,
        token_type = excluded.token_type,
        tx_hash = excluded.tx_hash,
        value = excluded.value,
        updated_at = excluded.updated_at
    WHERE excluded.block_num > nft_token_owners.block_num
       OR (excluded.block_num = nft_token_owners.block_num
           AND excluded.log_index > nft_token_owners.log_index)";

const UPSERT_HISTORY: &str = "
    INSERT INTO nft_transfer_history
        (contract_address, token_id, tx_hash, log_index, block_num, from_address, to_address, token_type, value)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(contract_address, token_id, tx_hash, log_index) DO UPDATE SET
        block_num = excluded.block_num,
        from_address = excluded.from_address,
        to_address = excluded.to_address,
        token_type = excluded.token_type,
        value = excluded.value
    WHERE (nft_transfer_history.block_num, nft_transfer_history.from_address,
           nft_transfer_history.to_address, nft_transfer_history.token_type, nft_transfer_history.value)
       IS NOT (excluded.block_num, excluded.from_address, excluded.to_address,
               excluded.token_type, excluded.value)";

const UPSERT_TOKEN: &str = "
    INSERT INTO nft_tokens
        (contract_address, token_id, token_type, source, value, tx_hash, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
    ON CONFLICT(contract_address, token_id) DO UPDATE SET
        value = excluded.value,
        tx_hash = excluded.tx_hash,
        updated_at = excluded.updated_at
    WHERE excluded.value IS NOT NULL
      AND (nft_tokens.value, nft_tokens.tx_hash) IS NOT (excluded.value, excluded.tx_hash)";

const INSERT_COLLECTION: &str = "
    INSERT INTO nft_collections (contract_address, token_type, source, created_at)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(contract_address) DO NOTHING";

const INSERT_OWNER_TASK: &str = "
    INSERT INTO nft_owner_tasks
        (contract_address, token_id, task_id, token_type, priority, is_processing, created_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// SQLite-backed store. Writes are chunked into `write_batch_size` items, one
/// transaction per chunk.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    write_batch_size: usize,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>, write_batch_size: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqlite_error)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(map_sqlite_error)?;

        let store = Self::with_connection(conn, write_batch_size)?;
        tracing::info!(
            target: "nftwatch::storage",
            db_path = %path.as_ref().display(),
            write_batch_size = store.write_batch_size,
            "NFT store initialized"
        );
        Ok(store)
    }

    pub fn in_memory(write_batch_size: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::with_connection(conn, write_batch_size)
    }

    fn with_connection(conn: Connection, write_batch_size: usize) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            write_batch_size: write_batch_size.max(1),
        })
    }

    pub fn write_batch_size(&self) -> usize {
        self.write_batch_size
    }

    /// Keys per `find_owners` query. Each key binds two variables, so the
    /// chunk stays under the connection's variable limit whatever the write
    /// batch size is.
    fn read_chunk_size(&self, conn: &Connection) -> usize {
        let max_variables = conn.limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER).max(2) as usize;
        self.write_batch_size.min(max_variables / 2)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))
    }

    /// Applies `execute` to every item, one transaction per chunk. Items of a
    /// chunk are independent: a failing item does not stop its siblings, and
    /// the chunk commits what succeeded before the first failure is returned.
    fn write_chunked<T, F>(
        &self,
        what: &'static str,
        items: &[T],
        sql: &str,
        mut execute: F,
    ) -> Result<usize, StoreError>
    where
        F: FnMut(&mut CachedStatement<'_>, &T) -> rusqlite::Result<usize>,
    {
        if items.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let mut changed = 0;

        for chunk in items.chunks(self.write_batch_size) {
            let tx = conn.transaction().map_err(map_sqlite_error)?;
            let mut first_error = None;
            let mut failed = 0usize;
            {
                let mut stmt = tx.prepare_cached(sql).map_err(map_sqlite_error)?;
                for item in chunk {
                    match execute(&mut stmt, item) {
                        Ok(rows) => changed += rows,
                        Err(e) => {
                            failed += 1;
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
            tx.commit().map_err(map_sqlite_error)?;

            if let Some(err) = first_error {
                let err = map_sqlite_error(err);
                tracing::warn!(
                    target: "nftwatch::storage",
                    table = what,
                    chunk_len = chunk.len(),
                    failed,
                    error = %err,
                    "Batch write had failures"
                );
                return Err(err);
            }
        }

        tracing::debug!(target: "nftwatch::storage", table = what, items = items.len(), changed, "Batch written");
        Ok(changed)
    }

    /// History rows of one token, oldest first.
    pub async fn transfer_history(
        &self,
        contract: Address,
        token_id: U256,
    ) -> Result<Vec<TransferHistoryRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT contract_address, token_id, tx_hash, log_index, block_num, from_address, to_address, token_type, value
                 FROM nft_transfer_history
                 WHERE contract_address = ?1 AND token_id = ?2
                 ORDER BY block_num, log_index",
            )
            .map_err(map_sqlite_error)?;

        let rows = stmt
            .query_map(params![address_text(&contract), token_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(map_sqlite_error)?;

        let mut records = Vec::new();
        for row in rows {
            let (contract, token_id, tx_hash, log_index, block_num, from, to, standard, value) =
                row.map_err(map_sqlite_error)?;
            records.push(TransferHistoryRecord {
                contract: parse_address(&contract)?,
                token_id: parse_u256(&token_id)?,
                tx_hash: parse_h256(&tx_hash)?,
                log_index: log_index as u64,
                block_num: block_num as u64,
                from: parse_address(&from)?,
                to: parse_address(&to)?,
                standard: parse_standard(&standard)?,
                value: value.as_deref().map(parse_u256).transpose()?,
            });
        }
        Ok(records)
    }

    pub async fn find_token(&self, key: TokenKey) -> Result<Option<TokenRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT token_type, source, value, tx_hash FROM nft_tokens
                 WHERE contract_address = ?1 AND token_id = ?2",
                params![address_text(&key.0), key.1.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sqlite_error)?;

        row.map(|(standard, source, value, tx_hash)| -> Result<TokenRecord, StoreError> {
            Ok(TokenRecord {
                contract: key.0,
                token_id: key.1,
                standard: parse_standard(&standard)?,
                source: source
                    .parse::<SourceTag>()
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
                value: value.as_deref().map(parse_u256).transpose()?,
                tx_hash: tx_hash.as_deref().map(parse_h256).transpose()?,
            })
        })
        .transpose()
    }

    /// Collections in insertion order.
    pub async fn collections(&self) -> Result<Vec<CollectionRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT contract_address, token_type, source FROM nft_collections ORDER BY rowid")
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(map_sqlite_error)?;

        let mut records = Vec::new();
        for row in rows {
            let (contract, standard, source) = row.map_err(map_sqlite_error)?;
            records.push(CollectionRecord {
                contract: parse_address(&contract)?,
                standard: parse_standard(&standard)?,
                source: source
                    .parse::<SourceTag>()
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            });
        }
        Ok(records)
    }

    /// Owner tasks in insertion order.
    pub async fn owner_tasks(&self) -> Result<Vec<OwnerTask>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT contract_address, token_id, task_id, token_type, priority, is_processing, created_at
                 FROM nft_owner_tasks ORDER BY rowid",
            )
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(map_sqlite_error)?;

        let mut tasks = Vec::new();
        for row in rows {
            let (contract, token_id, task_id, standard, priority, is_processing, created_at) =
                row.map_err(map_sqlite_error)?;
            tasks.push(OwnerTask {
                contract: parse_address(&contract)?,
                token_id: parse_u256(&token_id)?,
                task_id: Uuid::parse_str(&task_id)
                    .map_err(|e| StoreError::Serialization(format!("task id {task_id:?}: {e}")))?,
                standard: parse_standard(&standard)?,
                priority: priority as u32,
                is_processing,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(tasks)
    }

    /// Row count of a known table, for diagnostics and tests.
    pub async fn count(&self, table: StoreTable) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).map_err(map_sqlite_error)?;
        Ok(count as u64)
    }
}

/// Tables that can be counted with [`SqliteStore::count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTable {
    Owners,
    TransferHistory,
    Tokens,
    Collections,
    OwnerTasks,
    BlockMonitorTasks,
}

impl StoreTable {
    const fn name(self) -> &'static str {
        match self {
            Self::Owners => "nft_token_owners",
            Self::TransferHistory => "nft_transfer_history",
            Self::Tokens => "nft_tokens",
            Self::Collections => "nft_collections",
            Self::OwnerTasks => "nft_owner_tasks",
            Self::BlockMonitorTasks => "nft_block_monitor_tasks",
        }
    }
}

#[async_trait]
impl NftStore for SqliteStore {
    async fn find_owners(&self, keys: &[TokenKey]) -> Result<Vec<OwnerRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut owners = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(self.read_chunk_size(&conn)) {
            let placeholders = vec!["(?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT contract_address, token_id, owner, block_num, log_index, token_type, tx_hash, value
                 FROM nft_token_owners
                 WHERE (contract_address, token_id) IN (VALUES {placeholders})"
            );
            let bind: Vec<String> = chunk
                .iter()
                .flat_map(|(contract, token_id)| [address_text(contract), token_id.to_string()])
                .collect();

            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map(params_from_iter(bind.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })
                .map_err(map_sqlite_error)?;

            for row in rows {
                let (contract, token_id, owner, block_num, log_index, standard, tx_hash, value) =
                    row.map_err(map_sqlite_error)?;
                owners.push(OwnerRecord {
                    contract: parse_address(&contract)?,
                    token_id: parse_u256(&token_id)?,
                    owner: parse_address(&owner)?,
                    version: Version::new(block_num as u64, log_index as u64),
                    standard: parse_standard(&standard)?,
                    tx_hash: parse_h256(&tx_hash)?,
                    value,
                });
            }
        }

        Ok(owners)
    }

    async fn upsert_owners(&self, owners: &[OwnerRecord]) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.write_chunked("nft_token_owners", owners, UPSERT_OWNER, |stmt, owner| {
            stmt.execute(params![
                address_text(&owner.contract),
                owner.token_id.to_string(),
                address_text(&owner.owner),
                owner.version.block_num as i64,
                owner.version.log_index as i64,
                owner.standard.as_str(),
                h256_text(&owner.tx_hash),
                owner.value,
                now,
            ])
        })
    }

    async fn upsert_transfer_history(
        &self,
        records: &[TransferHistoryRecord],
    ) -> Result<usize, StoreError> {
        self.write_chunked("nft_transfer_history", records, UPSERT_HISTORY, |stmt, record| {
            stmt.execute(params![
                address_text(&record.contract),
                record.token_id.to_string(),
                h256_text(&record.tx_hash),
                record.log_index as i64,
                record.block_num as i64,
                address_text(&record.from),
                address_text(&record.to),
                record.standard.as_str(),
                record.value.map(|v| v.to_string()),
            ])
        })
    }

    async fn upsert_tokens(&self, tokens: &[TokenRecord]) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.write_chunked("nft_tokens", tokens, UPSERT_TOKEN, |stmt, token| {
            stmt.execute(params![
                address_text(&token.contract),
                token.token_id.to_string(),
                token.standard.as_str(),
                token.source.as_str(),
                token.value.map(|v| v.to_string()),
                token.tx_hash.as_ref().map(h256_text),
                now,
            ])
        })
    }

    async fn insert_collections_if_absent(
        &self,
        collections: &[CollectionRecord],
    ) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.write_chunked("nft_collections", collections, INSERT_COLLECTION, |stmt, collection| {
            stmt.execute(params![
                address_text(&collection.contract),
                collection.standard.as_str(),
                collection.source.as_str(),
                now,
            ])
        })
    }

    async fn insert_owner_tasks(&self, tasks: &[OwnerTask]) -> Result<usize, StoreError> {
        self.write_chunked("nft_owner_tasks", tasks, INSERT_OWNER_TASK, |stmt, task| {
            stmt.execute(params![
                address_text(&task.contract),
                task.token_id.to_string(),
                task.task_id.to_string(),
                task.standard.as_str(),
                i64::from(task.priority),
                task.is_processing,
                task.created_at.to_rfc3339(),
            ])
        })
    }

    async fn upsert_block_task(&self, task: &BlockMonitorTask) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO nft_block_monitor_tasks (message_id, block_num, status, error_message, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(message_id) DO UPDATE SET
                 block_num = excluded.block_num,
                 status = excluded.status,
                 error_message = excluded.error_message,
                 updated_at = excluded.updated_at",
        )
        .and_then(|mut stmt| {
            stmt.execute(params![
                task.message_id,
                task.block_num as i64,
                task.status.as_str(),
                task.error_message,
                task.updated_at.to_rfc3339(),
            ])
        })
        .map_err(map_sqlite_error)?;
        Ok(())
    }

    async fn find_block_task(&self, message_id: &str) -> Result<Option<BlockMonitorTask>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT block_num, status, error_message, updated_at
                 FROM nft_block_monitor_tasks WHERE message_id = ?1",
                params![message_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sqlite_error)?;

        row.map(|(block_num, status, error_message, updated_at)| -> Result<BlockMonitorTask, StoreError> {
            Ok(BlockMonitorTask {
                message_id: message_id.to_string(),
                block_num: block_num as u64,
                status: status.parse::<BlockTaskStatus>()?,
                error_message,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn delete_block_task(&self, message_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM nft_block_monitor_tasks WHERE message_id = ?1",
            params![message_id],
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }
}

/// Uniqueness violations become [`StoreError::DuplicateKey`]; everything else is a backend error.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreError::DuplicateKey(message.clone().unwrap_or_else(|| failure.to_string()))
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn address_text(address: &Address) -> String {
    format!("{address:#x}")
}

fn h256_text(hash: &H256) -> String {
    format!("{hash:#x}")
}

fn decode_hex_text(value: &str, expected: usize) -> Result<Vec<u8>, StoreError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(digits).map_err(|e| StoreError::Serialization(format!("{value:?}: {e}")))?;
    if bytes.len() != expected {
        return Err(StoreError::Serialization(format!(
            "{value:?}: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn parse_address(value: &str) -> Result<Address, StoreError> {
    decode_hex_text(value, 20).map(|bytes| Address::from_slice(&bytes))
}

fn parse_h256(value: &str) -> Result<H256, StoreError> {
    decode_hex_text(value, 32).map(|bytes| H256::from_slice(&bytes))
}

fn parse_u256(value: &str) -> Result<U256, StoreError> {
    U256::from_dec_str(value).map_err(|e| StoreError::Serialization(format!("{value:?}: {e:?}")))
}

fn parse_standard(value: &str) -> Result<TokenStandard, StoreError> {
    value
        .parse::<TokenStandard>()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("{value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn owner(token: u64, to: u8, block_num: u64, log_index: u64) -> OwnerRecord {
        OwnerRecord {
            contract: addr(0xaa),
            token_id: U256::from(token),
            owner: addr(to),
            version: Version::new(block_num, log_index),
            standard: TokenStandard::Erc721,
            tx_hash: H256::repeat_byte(to),
            value: "1".to_string(),
        }
    }

    fn history(token: u64, log_index: u64) -> TransferHistoryRecord {
        TransferHistoryRecord {
            contract: addr(0xaa),
            token_id: U256::from(token),
            tx_hash: H256::repeat_byte(0x01),
            log_index,
            block_num: 10,
            from: addr(1),
            to: addr(2),
            standard: TokenStandard::Erc721,
            value: None,
        }
    }

    #[tokio::test]
    async fn test_owner_guard_rejects_older_and_equal_versions() {
        let store = SqliteStore::in_memory(10).unwrap();

        assert_eq!(store.upsert_owners(&[owner(1, 0x02, 10, 5)]).await.unwrap(), 1);
        // Older block, same block lower index, identical version: all ignored.
        assert_eq!(store.upsert_owners(&[owner(1, 0x03, 9, 99)]).await.unwrap(), 0);
        assert_eq!(store.upsert_owners(&[owner(1, 0x03, 10, 4)]).await.unwrap(), 0);
        assert_eq!(store.upsert_owners(&[owner(1, 0x03, 10, 5)]).await.unwrap(), 0);

        let found = store.find_owners(&[(addr(0xaa), U256::from(1))]).await.unwrap();
        assert_eq!(found, vec![owner(1, 0x02, 10, 5)]);

        // Same block, higher index wins.
        assert_eq!(store.upsert_owners(&[owner(1, 0x04, 10, 6)]).await.unwrap(), 1);
        let found = store.find_owners(&[(addr(0xaa), U256::from(1))]).await.unwrap();
        assert_eq!(found[0].owner, addr(0x04));
    }

    #[tokio::test]
    async fn test_find_owners_only_returns_requested_keys() {
        let store = SqliteStore::in_memory(2).unwrap();
        let owners: Vec<_> = (0..5).map(|i| owner(i, 0x02, 1, i)).collect();
        store.upsert_owners(&owners).await.unwrap();

        let keys: Vec<TokenKey> = [1u64, 3, 4, 99]
            .iter()
            .map(|i| (addr(0xaa), U256::from(*i)))
            .collect();
        let mut found: Vec<u64> = store
            .find_owners(&keys)
            .await
            .unwrap()
            .iter()
            .map(|o| o.token_id.low_u64())
            .collect();
        found.sort_unstable();
        assert_eq!(found, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_find_owners_stays_under_variable_limit() {
        let store = SqliteStore::in_memory(500).unwrap();
        let owners: Vec<_> = (0..7).map(|i| owner(i, 0x02, 1, i)).collect();
        store.upsert_owners(&owners).await.unwrap();

        // Room for two keys per query, far below the write batch size.
        let _ = store
            .lock()
            .unwrap()
            .set_limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER, 5);

        let keys: Vec<TokenKey> = (0..7u64).map(|i| (addr(0xaa), U256::from(i))).collect();
        let found = store.find_owners(&keys).await.unwrap();
        assert_eq!(found.len(), 7);
    }

    #[tokio::test]
    async fn test_history_upsert_is_idempotent() {
        let store = SqliteStore::in_memory(500).unwrap();
        let records = vec![history(1, 0), history(1, 1)];

        assert_eq!(store.upsert_transfer_history(&records).await.unwrap(), 2);
        assert_eq!(store.upsert_transfer_history(&records).await.unwrap(), 0);
        assert_eq!(store.count(StoreTable::TransferHistory).await.unwrap(), 2);

        let rows = store.transfer_history(addr(0xaa), U256::from(1)).await.unwrap();
        assert_eq!(rows, records);
    }

    #[tokio::test]
    async fn test_token_source_is_first_seen() {
        let store = SqliteStore::in_memory(500).unwrap();
        let key = (addr(0xbb), U256::from(7));
        let token = |source, value: u64, tx: u8| TokenRecord {
            contract: key.0,
            token_id: key.1,
            standard: TokenStandard::Erc1155,
            source,
            value: Some(U256::from(value)),
            tx_hash: Some(H256::repeat_byte(tx)),
        };

        store.upsert_tokens(&[token(SourceTag::Archive, 5, 1)]).await.unwrap();
        store.upsert_tokens(&[token(SourceTag::Monitor, 8, 2)]).await.unwrap();

        let stored = store.find_token(key).await.unwrap().unwrap();
        assert_eq!(stored.source, SourceTag::Archive);
        assert_eq!(stored.value, Some(U256::from(8)));
        assert_eq!(stored.tx_hash, Some(H256::repeat_byte(2)));
        assert_eq!(store.count(StoreTable::Tokens).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collections_insert_if_absent() {
        let store = SqliteStore::in_memory(500).unwrap();
        let first = CollectionRecord {
            contract: addr(0xcc),
            standard: TokenStandard::Erc721,
            source: SourceTag::Monitor,
        };
        let again = CollectionRecord { source: SourceTag::Archive, ..first.clone() };

        assert_eq!(store.insert_collections_if_absent(&[first.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_collections_if_absent(&[again]).await.unwrap(), 0);
        assert_eq!(store.collections().await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_duplicate_task_is_classified_and_siblings_survive() {
        let store = SqliteStore::in_memory(500).unwrap();
        let task = OwnerTask {
            contract: addr(0xdd),
            token_id: U256::from(3),
            task_id: Uuid::new_v4(),
            standard: TokenStandard::Erc1155,
            priority: 10,
            is_processing: false,
            created_at: Utc::now(),
        };
        let sibling = OwnerTask { task_id: Uuid::new_v4(), token_id: U256::from(4), ..task.clone() };

        store.insert_owner_tasks(&[task.clone()]).await.unwrap();
        let err = store
            .insert_owner_tasks(&[task.clone(), sibling.clone()])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateKey(_)), "got {err:?}");
        let tasks = store.owner_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].task_id, sibling.task_id);
    }

    #[tokio::test]
    async fn test_block_task_lifecycle() {
        let store = SqliteStore::in_memory(500).unwrap();

        store
            .upsert_block_task(&BlockMonitorTask::new("m-1", 42, BlockTaskStatus::Processing))
            .await
            .unwrap();
        store
            .upsert_block_task(
                &BlockMonitorTask::new("m-1", 42, BlockTaskStatus::Error).with_error("boom"),
            )
            .await
            .unwrap();

        let task = store.find_block_task("m-1").await.unwrap().unwrap();
        assert_eq!(task.block_num, 42);
        assert_eq!(task.status, BlockTaskStatus::Error);
        assert_eq!(task.error_message.as_deref(), Some("boom"));

        store.delete_block_task("m-1").await.unwrap();
        assert!(store.find_block_task("m-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nft.db");
        {
            let store = SqliteStore::open(&path, 100).unwrap();
            store.upsert_owners(&[owner(1, 0x02, 1, 0)]).await.unwrap();
        }
        let store = SqliteStore::open(&path, 100).unwrap();
        assert_eq!(store.count(StoreTable::Owners).await.unwrap(), 1);
    }
}
