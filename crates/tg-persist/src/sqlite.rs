//! Append-only SQLite audit store. Triggers reject UPDATE and DELETE so a
//! stored incident or chain record can only be superseded, never edited.

use std::path::Path;

use rusqlite::{Connection, params};
use tg_chain::ChainRecord;
use tg_runtime::ContainmentIncident;
use tg_types::FieldId;

use crate::PersistError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS incidents (
    field_id     TEXT    NOT NULL,
    incident_id  INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    trig         TEXT    NOT NULL,
    signature    TEXT    NOT NULL,
    payload      TEXT    NOT NULL,
    PRIMARY KEY (field_id, incident_id)
);
CREATE TABLE IF NOT EXISTS chain_records (
    field_id    TEXT    NOT NULL,
    sequence_id INTEGER NOT NULL,
    chain_hash  TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    PRIMARY KEY (field_id, sequence_id)
);
CREATE TRIGGER IF NOT EXISTS incidents_no_update BEFORE UPDATE ON incidents
BEGIN SELECT RAISE(ABORT, 'incidents are append-only'); END;
CREATE TRIGGER IF NOT EXISTS incidents_no_delete BEFORE DELETE ON incidents
BEGIN SELECT RAISE(ABORT, 'incidents are append-only'); END;
CREATE TRIGGER IF NOT EXISTS chain_no_update BEFORE UPDATE ON chain_records
BEGIN SELECT RAISE(ABORT, 'chain records are append-only'); END;
CREATE TRIGGER IF NOT EXISTS chain_no_delete BEFORE DELETE ON chain_records
BEGIN SELECT RAISE(ABORT, 'chain records are append-only'); END;
";

#[derive(Debug)]
pub struct SqliteAuditStore {
    conn: Connection,
}

impl SqliteAuditStore {
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, PersistError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn append_incident(
        &self,
        field_id: &FieldId,
        incident: &ContainmentIncident,
    ) -> Result<(), PersistError> {
        let payload = serde_json::to_string(incident).map_err(PersistError::Encode)?;
        self.conn.execute(
            "INSERT INTO incidents (field_id, incident_id, timestamp_ms, trig, signature, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                field_id.as_str(),
                to_sql_int("incident_id", incident.incident_id)?,
                to_sql_int("timestamp_ms", incident.timestamp_ms)?,
                incident.trigger.as_str(),
                incident.signature,
                payload
            ],
        )?;
        Ok(())
    }

    pub fn append_chain_record(
        &self,
        field_id: &FieldId,
        record: &ChainRecord,
    ) -> Result<(), PersistError> {
        let payload = serde_json::to_string(record).map_err(PersistError::Encode)?;
        let chain_hash = hex::encode(record.chain_hash);
        self.conn.execute(
            "INSERT INTO chain_records (field_id, sequence_id, chain_hash, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                field_id.as_str(),
                to_sql_int("sequence_id", record.sequence_id)?,
                chain_hash,
                payload
            ],
        )?;
        Ok(())
    }

    pub fn incidents(&self, field_id: &FieldId) -> Result<Vec<ContainmentIncident>, PersistError> {
        self.payloads(
            "SELECT payload FROM incidents WHERE field_id = ?1 ORDER BY incident_id",
            field_id,
        )
    }

    pub fn chain_records(&self, field_id: &FieldId) -> Result<Vec<ChainRecord>, PersistError> {
        self.payloads(
            "SELECT payload FROM chain_records WHERE field_id = ?1 ORDER BY sequence_id",
            field_id,
        )
    }

    fn payloads<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        field_id: &FieldId,
    ) -> Result<Vec<T>, PersistError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![field_id.as_str()], |row| row.get::<_, String>(0))?;
        let mut items = Vec::new();
        for (index, payload) in rows.enumerate() {
            let payload = payload?;
            let item = serde_json::from_str(&payload).map_err(|source| PersistError::CorruptLine {
                line: index + 1,
                source,
            })?;
            items.push(item);
        }
        Ok(items)
    }
}

fn to_sql_int(field: &'static str, value: u64) -> Result<i64, PersistError> {
    i64::try_from(value).map_err(|_| PersistError::OutOfRange { field, value })
}
