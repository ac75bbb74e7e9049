//! SQLite-backed document store.
//!
//! Each dataset is keyed by its metadata hash. The `metadata` table holds
//! one record per dataset (identity fields, predecessor stubs, and the
//! index extent), so `range()` is a single indexed lookup that never
//! touches rows. Payloads are chunked by time range in `payload_chunks`;
//! a partial read only deserialises the chunks overlapping the requested
//! window. All writes run inside a transaction, so replace is atomic and
//! readers never observe a splice.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{check_ownership, merge_frames, PersistenceEngine};
use crate::error::EngineError;
use crate::hash::Hash32;
use crate::metadata::{stub_identity_hash, DatasetMetadata, DatasetMetadataStub, EngineId};
use crate::params::{Parameter, Params};
use crate::series::{Frame, Payload};
use crate::time::{TimeRange, Timestamp};

static NEXT_MEMORY_STORE: AtomicU64 = AtomicU64::new(0);

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS metadata (
    hash TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    static INTEGER NOT NULL,
    time_level TEXT,
    params TEXT NOT NULL,
    predecessors TEXT NOT NULL,
    engine_id TEXT NOT NULL,
    range_start INTEGER,
    range_end INTEGER,
    row_count INTEGER NOT NULL DEFAULT 0,
    static_payload TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_metadata_name ON metadata(name);
CREATE INDEX IF NOT EXISTS idx_metadata_name_version ON metadata(name, version);

CREATE TABLE IF NOT EXISTS payload_chunks (
    dataset_hash TEXT NOT NULL,
    chunk_start INTEGER NOT NULL,
    chunk_end INTEGER NOT NULL,
    rows TEXT NOT NULL,
    PRIMARY KEY (dataset_hash, chunk_start)
) WITHOUT ROWID;
"#;

/// One predecessor entry as stored inside a metadata record.
#[derive(Serialize, Deserialize)]
struct PredecessorRecord {
    param_name: String,
    #[serde(flatten)]
    stub: DatasetMetadataStub,
}

/// Identity fields of a stored record, used for query matching.
struct StoredIdentity {
    name: String,
    version: String,
    is_static: bool,
    time_level: Option<String>,
    params: Params,
    predecessors: Vec<PredecessorRecord>,
    engine_id: EngineId,
    hash: Hash32,
}

impl StoredIdentity {
    fn own_parameter(&self, name: &str) -> Option<Parameter> {
        match name {
            "name" => Some(Parameter::Str(self.name.clone())),
            "version" => Some(Parameter::Str(self.version.clone())),
            "static" => Some(Parameter::Bool(self.is_static)),
            "time_level" => Some(match &self.time_level {
                Some(level) => Parameter::Str(level.clone()),
                None => Parameter::Null,
            }),
            _ => self.params.get(name).cloned(),
        }
    }

    fn stub(&self) -> DatasetMetadataStub {
        DatasetMetadataStub::new(
            self.name.clone(),
            self.version.clone(),
            self.is_static,
            self.time_level.clone(),
            self.params.clone(),
            self.engine_id.clone(),
            self.hash,
        )
    }
}

fn stub_parameter(stub: &DatasetMetadataStub, name: &str) -> Option<Parameter> {
    match name {
        "name" => Some(Parameter::Str(stub.name().to_string())),
        "version" => Some(Parameter::Str(stub.version().to_string())),
        "static" => Some(Parameter::Bool(stub.is_static())),
        "time_level" => Some(match stub.time_level() {
            Some(level) => Parameter::Str(level.to_string()),
            None => Parameter::Null,
        }),
        _ => stub.params().get(name).cloned(),
    }
}

fn bound_nanos(t: Timestamp) -> Result<i64, EngineError> {
    t.nanos().ok_or_else(|| {
        EngineError::Conflict(format!("timestamp {t} is outside the storable range"))
    })
}

/// Document-store persistence engine backed by SQLite.
#[derive(Debug)]
pub struct DocumentStore {
    id: EngineId,
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open (or create) a store at `path`. The engine id is derived from
    /// the path, so reopening the same file yields the same identity.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, EngineError> {
        let path: Utf8PathBuf = path.as_ref().to_owned();
        let conn = Connection::open(path.as_std_path())?;
        conn.execute_batch(SCHEMA)?;
        debug!(%path, "opened document store");

        Ok(DocumentStore {
            id: EngineId::new(format!("docstore:{path}")),
            conn: Mutex::new(conn),
        })
    }

    /// A private in-memory store; every call yields a distinct engine.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let n = NEXT_MEMORY_STORE.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(DocumentStore {
            id: EngineId::new(format!("docstore:memory:{n}")),
            conn: Mutex::new(conn),
        })
    }

    fn load_identity(
        conn: &Connection,
        hash: Hash32,
    ) -> Result<Option<StoredIdentity>, EngineError> {
        let row = conn
            .query_row(
                "SELECT name, version, static, time_level, params, predecessors, engine_id
                 FROM metadata WHERE hash = ?1",
                params![hash.to_hex()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((name, version, is_static, time_level, params, predecessors, engine_id)) = row
        else {
            return Ok(None);
        };

        let identity = StoredIdentity {
            name,
            version,
            is_static,
            time_level,
            params: serde_json::from_str(&params)?,
            predecessors: serde_json::from_str(&predecessors)?,
            engine_id: EngineId::new(engine_id),
            hash,
        };

        // Integrity check: the record must still hash to its key.
        let children: BTreeMap<String, Hash32> = identity
            .predecessors
            .iter()
            .map(|record| (record.param_name.clone(), record.stub.hash()))
            .collect();
        if stub_identity_hash(&identity.stub(), &children) != hash {
            return Err(EngineError::Conflict(format!(
                "stored record for dataset '{}' does not match its hash",
                identity.name
            )));
        }

        Ok(Some(identity))
    }

    /// `(is_static, data_range, row_count)` for a stored dataset.
    #[allow(clippy::type_complexity)]
    fn load_extent(
        conn: &Connection,
        hash: Hash32,
    ) -> Result<Option<(bool, Option<(i64, i64)>, i64)>, EngineError> {
        let row = conn
            .query_row(
                "SELECT static, range_start, range_end, row_count FROM metadata WHERE hash = ?1",
                params![hash.to_hex()],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(is_static, start, end, rows)| {
            (is_static, start.zip(end), rows)
        }))
    }

    fn load_frame(
        conn: &Connection,
        hash: Hash32,
        range: Option<&TimeRange>,
    ) -> Result<Frame, EngineError> {
        let mut chunks: Vec<String> = Vec::new();

        match range {
            None => {
                let mut stmt = conn.prepare(
                    "SELECT rows FROM payload_chunks WHERE dataset_hash = ?1
                     ORDER BY chunk_start",
                )?;
                let mut query = stmt.query(params![hash.to_hex()])?;
                while let Some(row) = query.next()? {
                    chunks.push(row.get(0)?);
                }
            }
            Some(range) => {
                let start = bound_nanos(range.start())?;
                let end = bound_nanos(range.end())?;
                let mut stmt = conn.prepare(
                    "SELECT rows FROM payload_chunks WHERE dataset_hash = ?1
                     AND chunk_end > ?2 AND chunk_start < ?3
                     ORDER BY chunk_start",
                )?;
                let mut query = stmt.query(params![hash.to_hex(), start, end])?;
                while let Some(row) = query.next()? {
                    chunks.push(row.get(0)?);
                }
            }
        }

        let mut frame = Frame::default();
        for chunk in chunks {
            let parsed: Frame = serde_json::from_str(&chunk)?;
            frame = frame.concat(&parsed)?;
        }

        Ok(match range {
            Some(range) => frame.view(range),
            None => frame,
        })
    }

    fn upsert_metadata(
        tx: &Transaction<'_>,
        metadata: &DatasetMetadata,
        range: Option<(i64, i64)>,
        row_count: i64,
        static_payload: Option<&str>,
    ) -> Result<(), EngineError> {
        let predecessors: Vec<PredecessorRecord> = metadata
            .predecessors()
            .iter()
            .map(|(key, predecessor)| PredecessorRecord {
                param_name: key.clone(),
                stub: predecessor.stub(),
            })
            .collect();

        tx.execute(
            "INSERT INTO metadata
                 (hash, name, version, static, time_level, params, predecessors,
                  engine_id, range_start, range_end, row_count, static_payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(hash) DO UPDATE SET
                 range_start = excluded.range_start,
                 range_end = excluded.range_end,
                 row_count = excluded.row_count,
                 static_payload = excluded.static_payload",
            params![
                metadata.hash().to_hex(),
                metadata.name(),
                metadata.version(),
                metadata.is_static(),
                metadata.time_level(),
                serde_json::to_string(metadata.params())?,
                serde_json::to_string(&predecessors)?,
                metadata.engine_id().as_str(),
                range.map(|(start, _)| start),
                range.map(|(_, end)| end),
                row_count,
                static_payload,
            ],
        )?;
        Ok(())
    }

    fn insert_chunk(tx: &Transaction<'_>, hash: Hash32, frame: &Frame) -> Result<(), EngineError> {
        let Some(range) = frame.time_range() else {
            return Ok(());
        };
        tx.execute(
            "INSERT INTO payload_chunks (dataset_hash, chunk_start, chunk_end, rows)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                hash.to_hex(),
                bound_nanos(range.start())?,
                bound_nanos(range.end())?,
                serde_json::to_string(frame)?,
            ],
        )?;
        Ok(())
    }

    /// Rewrite a series dataset as a single chunk. Runs inside `tx`, so the
    /// delete and insert are indivisible.
    fn rewrite(
        tx: &Transaction<'_>,
        metadata: &DatasetMetadata,
        frame: &Frame,
    ) -> Result<(), EngineError> {
        let hash = metadata.hash();
        tx.execute(
            "DELETE FROM payload_chunks WHERE dataset_hash = ?1",
            params![hash.to_hex()],
        )?;
        Self::insert_chunk(tx, hash, frame)?;

        let range = match frame.time_range() {
            Some(range) => Some((bound_nanos(range.start())?, bound_nanos(range.end())?)),
            None => None,
        };
        Self::upsert_metadata(tx, metadata, range, frame.len() as i64, None)?;
        Ok(())
    }

    fn lookup_parameter(
        conn: &Connection,
        identity: &StoredIdentity,
        path: &str,
    ) -> Result<Option<Parameter>, EngineError> {
        match path.split_once('.') {
            None => Ok(identity.own_parameter(path)),
            Some((head, rest)) => {
                let Some(record) = identity
                    .predecessors
                    .iter()
                    .find(|record| record.param_name == head)
                else {
                    return Ok(None);
                };

                if !rest.contains('.') {
                    // Answerable from the stub alone.
                    return Ok(stub_parameter(&record.stub, rest));
                }

                // Deeper paths need the predecessor's own record.
                match Self::load_identity(conn, record.stub.hash())? {
                    Some(predecessor) => Self::lookup_parameter(conn, &predecessor, rest),
                    None => Ok(None),
                }
            }
        }
    }
}

impl PersistenceEngine for DocumentStore {
    fn engine_id(&self) -> &EngineId {
        &self.id
    }

    fn exists(&self, metadata: &DatasetMetadata) -> Result<bool, EngineError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM metadata WHERE hash = ?1",
                params![metadata.hash().to_hex()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn predecessors_of(
        &self,
        hash: Hash32,
    ) -> Result<BTreeMap<String, DatasetMetadataStub>, EngineError> {
        let conn = self.conn.lock();
        let identity =
            Self::load_identity(&conn, hash)?.ok_or(EngineError::NotFound(hash))?;

        Ok(identity
            .predecessors
            .into_iter()
            .map(|record| (record.param_name, record.stub))
            .collect())
    }

    fn read(
        &self,
        metadata: &DatasetMetadata,
        range: Option<&TimeRange>,
    ) -> Result<Payload, EngineError> {
        let conn = self.conn.lock();
        let hash = metadata.hash();
        let (is_static, _, _) =
            Self::load_extent(&conn, hash)?.ok_or(EngineError::NotFound(hash))?;

        if is_static {
            if range.is_some() {
                return Err(EngineError::StaticDataset("read with range"));
            }
            let payload: Option<String> = conn.query_row(
                "SELECT static_payload FROM metadata WHERE hash = ?1",
                params![hash.to_hex()],
                |row| row.get(0),
            )?;
            let payload = payload.ok_or(EngineError::NotFound(hash))?;
            return Ok(Payload::Scalar(serde_json::from_str(&payload)?));
        }

        Ok(Self::load_frame(&conn, hash, range)?.into())
    }

    fn range(&self, metadata: &DatasetMetadata) -> Result<Option<TimeRange>, EngineError> {
        let conn = self.conn.lock();
        let Some((is_static, extent, _)) = Self::load_extent(&conn, metadata.hash())? else {
            return Ok(None);
        };
        if is_static {
            return Err(EngineError::StaticDataset("range"));
        }

        Ok(match extent {
            Some((start, end)) => Some(
                TimeRange::new(Timestamp::from_nanos(start), Timestamp::from_nanos(end))
                    .map_err(|e| EngineError::Conflict(e.to_string()))?,
            ),
            None => None,
        })
    }

    fn append(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;
        let Payload::Series(new) = payload else {
            return Err(EngineError::StaticDataset("append"));
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let hash = metadata.hash();

        let extent = match Self::load_extent(&tx, hash)? {
            Some((true, _, _)) => return Err(EngineError::StaticDataset("append")),
            Some((false, extent, rows)) => Some((extent, rows)),
            None => None,
        };

        let new_range = match new.time_range() {
            Some(range) => Some((bound_nanos(range.start())?, bound_nanos(range.end())?)),
            None => None,
        };

        let (range, row_count) = match (extent, new_range) {
            // Nothing stored yet: plain insert.
            (None, _) => (new_range, new.len() as i64),
            // Appending an empty frame changes nothing.
            (Some((extent, rows)), None) => (extent, rows),
            (Some((extent, rows)), Some((new_start, new_end))) => {
                if let Some((_, existing_end)) = extent {
                    if new_start < existing_end {
                        return Err(EngineError::AppendOverlap {
                            new_start: Timestamp::from_nanos(new_start),
                            existing_end: Timestamp::from_nanos(existing_end),
                        });
                    }
                }
                let start = extent.map_or(new_start, |(start, _)| start);
                (Some((start, new_end)), rows + new.len() as i64)
            }
        };

        Self::insert_chunk(&tx, hash, &new)?;
        Self::upsert_metadata(&tx, metadata, range, row_count, None)?;
        tx.commit()?;
        Ok(())
    }

    fn merge(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;
        let Payload::Series(new) = payload else {
            return Err(EngineError::StaticDataset("merge"));
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let hash = metadata.hash();

        let combined = match Self::load_extent(&tx, hash)? {
            Some((true, _, _)) => return Err(EngineError::StaticDataset("merge")),
            Some((false, _, _)) => merge_frames(&Self::load_frame(&tx, hash, None)?, &new),
            None => new,
        };

        Self::rewrite(&tx, metadata, &combined)?;
        tx.commit()?;
        Ok(())
    }

    fn replace(&self, metadata: &DatasetMetadata, payload: Payload) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        match payload {
            Payload::Series(frame) => {
                Self::rewrite(&tx, metadata, &frame)?;
            }
            Payload::Scalar(value) => {
                tx.execute(
                    "DELETE FROM payload_chunks WHERE dataset_hash = ?1",
                    params![metadata.hash().to_hex()],
                )?;
                let serialised = serde_json::to_string(&value)?;
                Self::upsert_metadata(&tx, metadata, None, 0, Some(&serialised))?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete(
        &self,
        metadata: &DatasetMetadata,
        range: Option<&TimeRange>,
    ) -> Result<(), EngineError> {
        check_ownership(&self.id, metadata)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let hash = metadata.hash();

        match range {
            None => {
                tx.execute(
                    "DELETE FROM payload_chunks WHERE dataset_hash = ?1",
                    params![hash.to_hex()],
                )?;
                tx.execute(
                    "DELETE FROM metadata WHERE hash = ?1",
                    params![hash.to_hex()],
                )?;
            }
            Some(range) => {
                match Self::load_extent(&tx, hash)? {
                    None => return Err(EngineError::NotFound(hash)),
                    Some((true, _, _)) => {
                        return Err(EngineError::StaticDataset("delete with range"))
                    }
                    Some((false, _, _)) => {}
                }
                let remaining = Self::load_frame(&tx, hash, None)?.without(range);
                Self::rewrite(&tx, metadata, &remaining)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn query(
        &self,
        name: Option<&str>,
        params_filter: Option<&Params>,
    ) -> Result<Vec<DatasetMetadataStub>, EngineError> {
        let conn = self.conn.lock();

        let hashes: Vec<String> = match name {
            Some(name) => {
                let mut stmt =
                    conn.prepare("SELECT hash FROM metadata WHERE name = ?1 ORDER BY hash")?;
                let mut query = stmt.query(params![name])?;
                let mut hashes = Vec::new();
                while let Some(row) = query.next()? {
                    hashes.push(row.get(0)?);
                }
                hashes
            }
            None => {
                let mut stmt = conn.prepare("SELECT hash FROM metadata ORDER BY hash")?;
                let mut query = stmt.query([])?;
                let mut hashes = Vec::new();
                while let Some(row) = query.next()? {
                    hashes.push(row.get(0)?);
                }
                hashes
            }
        };

        let mut stubs = Vec::new();
        for hex in hashes {
            let hash = Hash32::from_hex(&hex).ok_or_else(|| {
                EngineError::Conflict(format!("malformed hash key '{hex}'"))
            })?;
            let Some(identity) = Self::load_identity(&conn, hash)? else {
                continue;
            };

            let matched = match params_filter {
                None => true,
                Some(filter) => {
                    let mut all = true;
                    for (path, expected) in filter {
                        if Self::lookup_parameter(&conn, &identity, path)?.as_ref()
                            != Some(expected)
                        {
                            all = false;
                            break;
                        }
                    }
                    all
                }
            };

            if matched {
                stubs.push(identity.stub());
            }
        }

        Ok(stubs)
    }
}
