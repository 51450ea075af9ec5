//! Durable Raft log backed by `redb`.
//!
//! Entries are stored as JSON keyed by log index; the vote, the committed
//! log id and the purge watermark live in a small metadata table encoded
//! with `bincode`.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, OptionalSend, StorageError, Vote};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tokio::sync::Mutex;
use tracing::debug;

use crate::typ::{NodeId, TypeConfig};

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("trellis_log");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("trellis_meta");

const VOTE_KEY: &str = "vote";
const PURGED_KEY: &str = "last_purged";
const COMMITTED_KEY: &str = "committed";

pub struct DiskLogStore {
    db: Arc<Database>,
    /// Cached purge watermark, mirrored in the metadata table.
    last_purged: Arc<Mutex<Option<LogId<NodeId>>>>,
}

impl DiskLogStore {
    /// Open or create the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError<NodeId>> {
        let db = Database::create(path).map_err(|e| store_err(e, "open database"))?;
        let store = Self {
            db: Arc::new(db),
            last_purged: Arc::new(Mutex::new(None)),
        };

        store.write(|txn| {
            txn.open_table(LOG_TABLE)
                .map_err(|e| store_err(e, "create log table"))?;
            txn.open_table(META_TABLE)
                .map_err(|e| store_err(e, "create meta table"))?;
            Ok(())
        })?;

        let purged = store.read_meta::<LogId<NodeId>>(PURGED_KEY)?;
        Ok(Self {
            last_purged: Arc::new(Mutex::new(purged)),
            ..store
        })
    }

    /// Run `f` in a write transaction and commit it.
    fn write<F>(&self, f: F) -> Result<(), StorageError<NodeId>>
    where
        F: FnOnce(&WriteTransaction) -> Result<(), StorageError<NodeId>>,
    {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| store_err(e, "begin write txn"))?;
        f(&txn)?;
        txn.commit().map_err(|e| store_err(e, "commit"))
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError<NodeId>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| store_err(e, "begin read txn"))?;
        let table = txn
            .open_table(META_TABLE)
            .map_err(|e| store_err(e, "open meta table"))?;
        let Some(raw) = table.get(key).map_err(|e| store_err(e, "read meta"))? else {
            return Ok(None);
        };
        bincode::deserialize(raw.value())
            .map(Some)
            .map_err(|e| store_err(e, "decode meta"))
    }

    fn write_meta<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError<NodeId>> {
        let bytes = bincode::serialize(value).map_err(|e| store_err(e, "encode meta"))?;
        self.write(|txn| put_meta(txn, key, &bytes))
    }

    /// Delete every entry whose index falls in `range`.
    fn remove_entries(
        txn: &WriteTransaction,
        range: impl RangeBounds<u64>,
    ) -> Result<usize, StorageError<NodeId>> {
        let mut table = txn
            .open_table(LOG_TABLE)
            .map_err(|e| store_err(e, "open log table"))?;
        let keys = table
            .range(range)
            .map_err(|e| store_err(e, "range"))?
            .map(|item| item.map(|(k, _)| k.value()))
            .collect::<Result<Vec<u64>, _>>()
            .map_err(|e| store_err(e, "collect keys"))?;
        for key in &keys {
            table.remove(key).map_err(|e| store_err(e, "remove entry"))?;
        }
        Ok(keys.len())
    }
}

fn put_meta(txn: &WriteTransaction, key: &str, bytes: &[u8]) -> Result<(), StorageError<NodeId>> {
    let mut table = txn
        .open_table(META_TABLE)
        .map_err(|e| store_err(e, "open meta table"))?;
    table
        .insert(key, bytes)
        .map_err(|e| store_err(e, "insert meta"))?;
    Ok(())
}

impl RaftLogReader<TypeConfig> for DiskLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| store_err(e, "begin read txn"))?;
        let table = txn
            .open_table(LOG_TABLE)
            .map_err(|e| store_err(e, "open log table"))?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(|e| store_err(e, "range"))? {
            let (_, raw) = item.map_err(|e| store_err(e, "iterate log"))?;
            let entry: Entry<TypeConfig> =
                serde_json::from_slice(raw.value()).map_err(|e| store_err(e, "decode entry"))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for DiskLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = *self.last_purged.lock().await;

        let txn = self
            .db
            .begin_read()
            .map_err(|e| store_err(e, "begin read txn"))?;
        let table = txn
            .open_table(LOG_TABLE)
            .map_err(|e| store_err(e, "open log table"))?;
        let last_log_id = match table.last().map_err(|e| store_err(e, "read last entry"))? {
            Some((_, raw)) => {
                let entry: Entry<TypeConfig> = serde_json::from_slice(raw.value())
                    .map_err(|e| store_err(e, "decode last entry"))?;
                Some(entry.log_id)
            }
            None => last_purged,
        };

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Self {
            db: self.db.clone(),
            last_purged: self.last_purged.clone(),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write_meta(VOTE_KEY, vote)?;
        debug!(?vote, "vote saved");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.read_meta(VOTE_KEY)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        match committed {
            Some(c) => self.write_meta(COMMITTED_KEY, &c),
            None => Ok(()),
        }
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.read_meta(COMMITTED_KEY)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        self.write(|txn| {
            let mut table = txn
                .open_table(LOG_TABLE)
                .map_err(|e| store_err(e, "open log table"))?;
            for entry in entries {
                let bytes =
                    serde_json::to_vec(&entry).map_err(|e| store_err(e, "encode entry"))?;
                table
                    .insert(entry.log_id.index, bytes.as_slice())
                    .map_err(|e| store_err(e, "insert entry"))?;
            }
            Ok(())
        })?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write(|txn| Self::remove_entries(txn, log_id.index..).map(|_| ()))?;
        debug!(?log_id, "log truncated");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let watermark = bincode::serialize(&log_id).map_err(|e| store_err(e, "encode purge"))?;
        self.write(|txn| {
            Self::remove_entries(txn, ..=log_id.index)?;
            put_meta(txn, PURGED_KEY, &watermark)
        })?;

        *self.last_purged.lock().await = Some(log_id);
        debug!(?log_id, "log purged");
        Ok(())
    }
}

fn store_err(e: impl std::fmt::Display, context: &str) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, e)),
    )
}
