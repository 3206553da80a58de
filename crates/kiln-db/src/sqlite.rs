//! SQLite implementation of [`RecordStore`].
//!
//! [`SqliteRecordStore`] keeps records in a WAL-mode database. Every
//! [`ChangeSet`] is applied inside one transaction, so a process killed
//! mid-commit leaves the previous state intact. Nodes are stored in their
//! prefixed text encoding (see [`DepNode::encode`]).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use kiln_core::{ContentHash, DepNode, Dependency, QueryKey, Revision};

use crate::error::StorageError;
use crate::record::{ChangeSet, InputState, QueryRecord, Snapshot};
use crate::traits::RecordStore;

const REVISION_KEY: &str = "revision";

pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path.as_ref())?;
        Ok(SqliteRecordStore { conn })
    }

    /// Opens a private in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteRecordStore { conn })
    }

    fn write_changes(tx: &Transaction<'_>, changes: &ChangeSet) -> Result<(), StorageError> {
        if let Some(revision) = changes.revision {
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![REVISION_KEY, revision.0.to_string()],
            )?;
        }

        for key in &changes.removed_records {
            // Dependencies and outputs go with the row via ON DELETE CASCADE.
            tx.execute(
                "DELETE FROM records WHERE node = ?1",
                params![DepNode::Query(key.clone()).encode()],
            )?;
        }

        for record in &changes.records {
            Self::write_record(tx, record)?;
        }

        for (key, revision) in &changes.dirtied {
            tx.execute(
                "UPDATE records SET dirty = 1, dirtied_at = ?2 WHERE node = ?1",
                params![DepNode::Query(key.clone()).encode(), revision.0 as i64],
            )?;
        }

        for node in &changes.removed_inputs {
            tx.execute("DELETE FROM inputs WHERE node = ?1", params![node.encode()])?;
        }

        for input in &changes.inputs {
            tx.execute(
                "INSERT INTO inputs (node, fingerprint, dirty, dirtied_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(node) DO UPDATE SET
                    fingerprint = excluded.fingerprint,
                    dirty = excluded.dirty,
                    dirtied_at = excluded.dirtied_at",
                params![
                    input.node.encode(),
                    input.fingerprint.map(|h| h.to_hex()),
                    input.dirty,
                    input.dirtied_at.map(|r| r.0 as i64),
                ],
            )?;
        }
        Ok(())
    }

    fn write_record(tx: &Transaction<'_>, record: &QueryRecord) -> Result<(), StorageError> {
        let node = DepNode::Query(record.key.clone()).encode();
        tx.execute(
            "INSERT INTO records
                (node, name, args_json, value_json, value_hash,
                 changed_at, verified_at, dirty, dirtied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(node) DO UPDATE SET
                value_json = excluded.value_json,
                value_hash = excluded.value_hash,
                changed_at = excluded.changed_at,
                verified_at = excluded.verified_at,
                dirty = excluded.dirty,
                dirtied_at = excluded.dirtied_at",
            params![
                node,
                record.key.name(),
                record.key.args_json(),
                &*record.value,
                record.value_hash.to_hex(),
                record.changed_at.0 as i64,
                record.verified_at.0 as i64,
                record.dirty,
                record.dirtied_at.map(|r| r.0 as i64),
            ],
        )?;

        tx.execute("DELETE FROM dependencies WHERE record = ?1", params![node])?;
        tx.execute("DELETE FROM outputs WHERE record = ?1", params![node])?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO dependencies (record, position, dep, fingerprint)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, dep) in record.dependencies.iter().enumerate() {
                stmt.execute(params![
                    node,
                    position as i64,
                    dep.node.encode(),
                    dep.fingerprint.to_hex()
                ])?;
            }
        }

        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO outputs (record, blob) VALUES (?1, ?2)",
        )?;
        for blob in &record.outputs {
            stmt.execute(params![node, blob.to_hex()])?;
        }
        Ok(())
    }

    fn load_revision(&self) -> Result<Option<Revision>, StorageError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![REVISION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u64>()
                .map(|n| Some(Revision(n)))
                .map_err(|_| StorageError::Integrity {
                    reason: format!("revision is not a number: '{raw}'"),
                }),
        }
    }

    fn load_dependencies(&self) -> Result<HashMap<String, Vec<Dependency>>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT record, dep, fingerprint FROM dependencies ORDER BY record, position",
        )?;
        let rows = stmt.query_map([], |row| {
            let record: String = row.get(0)?;
            let dep: String = row.get(1)?;
            let fingerprint: String = row.get(2)?;
            Ok((record, dep, fingerprint))
        })?;

        let mut deps: HashMap<String, Vec<Dependency>> = HashMap::new();
        for row in rows {
            let (record, dep, fingerprint) = row?;
            deps.entry(record).or_default().push(Dependency::new(
                DepNode::decode(&dep)?,
                ContentHash::from_hex(&fingerprint)?,
            ));
        }
        Ok(deps)
    }

    fn load_outputs(&self) -> Result<HashMap<String, Vec<ContentHash>>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record, blob FROM outputs ORDER BY record, blob")?;
        let rows = stmt.query_map([], |row| {
            let record: String = row.get(0)?;
            let blob: String = row.get(1)?;
            Ok((record, blob))
        })?;

        let mut outputs: HashMap<String, Vec<ContentHash>> = HashMap::new();
        for row in rows {
            let (record, blob) = row?;
            outputs
                .entry(record)
                .or_default()
                .push(ContentHash::from_hex(&blob)?);
        }
        Ok(outputs)
    }

    fn load_records(&self) -> Result<Vec<QueryRecord>, StorageError> {
        let mut deps = self.load_dependencies()?;
        let mut outputs = self.load_outputs()?;

        let mut stmt = self.conn.prepare(
            "SELECT node, name, args_json, value_json, value_hash,
                    changed_at, verified_at, dirty, dirtied_at
             FROM records",
        )?;
        let rows = stmt.query_map([], |row| {
            let node: String = row.get(0)?;
            let name: String = row.get(1)?;
            let args_json: String = row.get(2)?;
            let value_json: String = row.get(3)?;
            let value_hash: String = row.get(4)?;
            let changed_at: i64 = row.get(5)?;
            let verified_at: i64 = row.get(6)?;
            let dirty: bool = row.get(7)?;
            let dirtied_at: Option<i64> = row.get(8)?;
            Ok((
                node,
                name,
                args_json,
                value_json,
                value_hash,
                changed_at,
                verified_at,
                dirty,
                dirtied_at,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                node,
                name,
                args_json,
                value_json,
                value_hash,
                changed_at,
                verified_at,
                dirty,
                dirtied_at,
            ) = row?;
            let key = QueryKey::from_parts(&name, &args_json)?;
            if DepNode::Query(key.clone()).encode() != node {
                return Err(StorageError::Integrity {
                    reason: format!("record '{node}' does not match its key {key}"),
                });
            }
            records.push(QueryRecord {
                key,
                value: Arc::from(value_json),
                value_hash: ContentHash::from_hex(&value_hash)?,
                dependencies: deps.remove(&node).unwrap_or_default(),
                outputs: outputs.remove(&node).unwrap_or_default(),
                changed_at: Revision(changed_at as u64),
                verified_at: Revision(verified_at as u64),
                dirty,
                dirtied_at: dirtied_at.map(|r| Revision(r as u64)),
            });
        }
        Ok(records)
    }

    fn load_inputs(&self) -> Result<Vec<InputState>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT node, fingerprint, dirty, dirtied_at FROM inputs")?;
        let rows = stmt.query_map([], |row| {
            let node: String = row.get(0)?;
            let fingerprint: Option<String> = row.get(1)?;
            let dirty: bool = row.get(2)?;
            let dirtied_at: Option<i64> = row.get(3)?;
            Ok((node, fingerprint, dirty, dirtied_at))
        })?;

        let mut inputs = Vec::new();
        for row in rows {
            let (node, fingerprint, dirty, dirtied_at) = row?;
            inputs.push(InputState {
                node: DepNode::decode(&node)?,
                fingerprint: fingerprint
                    .as_deref()
                    .map(ContentHash::from_hex)
                    .transpose()?,
                dirty,
                dirtied_at: dirtied_at.map(|r| Revision(r as u64)),
            });
        }
        Ok(inputs)
    }
}

impl RecordStore for SqliteRecordStore {
    fn load(&self) -> Result<Snapshot, StorageError> {
        Ok(Snapshot {
            revision: self.load_revision()?,
            records: self.load_records()?,
            inputs: self.load_inputs()?,
        })
    }

    fn commit(&mut self, changes: &ChangeSet) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        Self::write_changes(&tx, changes)?;
        tx.commit()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
