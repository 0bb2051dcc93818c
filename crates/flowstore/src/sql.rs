use crate::entry::{ModifiedBy, SearchQuery, StoreEntry};
use crate::error::{StoreError, StoreResult};
use crate::namespace::{claimed, mismatch, StoreNamespace, TransactionFn, Update};
use chrono::{DateTime, SecondsFormat, Utc};
use flowcore::{status, Context, Output, OutputKind, Payload};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const COLUMNS: &str = "key, output_kind, content_type, status_code, value_bytes, value_plain, \
                       value_json, modification_time, modified_by, reason";

/// How long a connection waits for another namespace's write to finish
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Namespace backed by one SQLite table.
///
/// Every namespace owns its connection; the connection mutex is the
/// namespace lock, so namespaces never wait on each other's locks and
/// read-modify-write operations run inside a single SQL transaction.
pub struct SqlNamespace {
    conn: Mutex<Connection>,
    table: String,
}

/// Columns of one row before they are turned back into an entry
struct RawRow {
    key: String,
    kind: String,
    content_type: Option<String>,
    status: i64,
    bytes: Option<Vec<u8>>,
    plain: Option<String>,
    json: Option<String>,
    time: String,
    modified_by: Option<String>,
    reason: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            kind: row.get(1)?,
            content_type: row.get(2)?,
            status: row.get(3)?,
            bytes: row.get(4)?,
            plain: row.get(5)?,
            json: row.get(6)?,
            time: row.get(7)?,
            modified_by: row.get(8)?,
            reason: row.get(9)?,
        })
    }

    fn into_entry(self) -> StoreResult<(String, StoreEntry)> {
        let code = u16::try_from(self.status).unwrap_or(status::INTERNAL_SERVER_ERROR);
        let kind = OutputKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Backend(format!("invalid output kind \"{}\" in db", self.kind)))?;
        let plain = || self.plain.clone().unwrap_or_default();
        let mut output = match kind {
            OutputKind::Empty => Output::empty(),
            OutputKind::Error => Output::error(code, plain()),
            OutputKind::Plain => Output::plain(plain()),
            OutputKind::Integer => Output::integer(plain().parse().unwrap_or_default()),
            OutputKind::Float => Output::float(plain().parse().unwrap_or_default()),
            OutputKind::Bytes => Output::bytes(self.bytes.clone().unwrap_or_default()),
            OutputKind::Object => {
                Output::json(serde_json::from_str(self.json.as_deref().unwrap_or("null"))?)
            }
        };
        if kind != OutputKind::Error {
            output = output.with_status(code);
        }
        if let Some(content_type) = &self.content_type {
            output = output.with_content_type(content_type.clone());
        }
        let timestamp = DateTime::parse_from_rfc3339(&self.time)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Backend(format!("invalid timestamp in db: {}", e)))?;
        let modified_by = self.modified_by.map(|id| ModifiedBy {
            id,
            reason: self.reason.unwrap_or_default(),
        });
        Ok((self.key, StoreEntry::at(output, timestamp, modified_by)))
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn cutoff(max_age: Duration) -> String {
    let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    format_time(cutoff)
}

impl SqlNamespace {
    /// Creates the table if needed. `table` must already be a sanitized
    /// identifier.
    pub fn new(conn: Connection, table: impl Into<String>) -> StoreResult<Self> {
        let table = table.into();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                output_kind TEXT NOT NULL,
                content_type TEXT,
                status_code INTEGER NOT NULL,
                value_bytes BLOB,
                value_plain TEXT,
                value_json TEXT,
                modification_time TEXT NOT NULL,
                modified_by TEXT,
                reason TEXT
            );
            CREATE INDEX IF NOT EXISTS {table}_modification_time ON {table} (modification_time);"
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
            table,
        })
    }

    /// Opens a connection of its own to the database file, creating the
    /// file if needed. WAL lets other namespaces read while one writes.
    pub fn open(path: impl AsRef<Path>, table: impl Into<String>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("SQLite journal mode: {}", mode);
        Self::new(conn, table)
    }

    /// A private in-memory database holding just this namespace
    pub fn open_in_memory(table: impl Into<String>) -> StoreResult<Self> {
        Self::new(Connection::open_in_memory()?, table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Takes the write lock up front so a transaction never fails upgrading
/// from read to write while another connection writes
fn begin(conn: &mut Connection) -> StoreResult<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

impl SqlNamespace {

    fn select(&self, conn: &Connection, key: &str) -> StoreResult<Option<StoreEntry>> {
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM {} WHERE key = ?1", self.table),
                params![key],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(|r| r.into_entry().map(|(_, entry)| entry)).transpose()
    }

    fn select_all(&self, conn: &Connection, limit: usize) -> StoreResult<Vec<(String, StoreEntry)>> {
        let limit = if limit == 0 { -1 } else { i64::try_from(limit).unwrap_or(i64::MAX) };
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {} ORDER BY modification_time DESC LIMIT ?1",
            self.table
        ))?;
        let rows = stmt.query_map(params![limit], RawRow::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    fn upsert(&self, conn: &Connection, key: &str, entry: &StoreEntry) -> StoreResult<()> {
        let output = entry.data();
        let (bytes, plain, json): (Option<Vec<u8>>, Option<String>, Option<String>) =
            match output.payload() {
                Payload::Empty => (None, None, None),
                Payload::Bytes(data) => (Some(data.clone()), None, None),
                Payload::Object(value) => (None, None, Some(serde_json::to_string(value)?)),
                _ => (None, Some(output.to_text()), None),
            };
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                self.table
            ),
            params![
                key,
                output.kind().as_str(),
                output.explicit_content_type(),
                i64::from(output.status_code()),
                bytes,
                plain,
                json,
                format_time(entry.timestamp()),
                entry.modified_by().map(|m| m.id.as_str()),
                entry.modified_by().map(|m| m.reason.as_str()),
            ],
        )?;
        Ok(())
    }

    fn write(&self, conn: &Connection, key: &str, value: Output, ctx: &Context) -> StoreResult<StoreEntry> {
        let entry = StoreEntry::written_by(value, ctx);
        self.upsert(conn, key, &entry)?;
        Ok(entry)
    }
}

impl StoreNamespace for SqlNamespace {
    fn get(&self, key: &str) -> StoreResult<Option<StoreEntry>> {
        let conn = self.lock();
        self.select(&conn, key)
    }

    fn set(&self, key: &str, value: Output, ctx: &Context) -> StoreResult<StoreEntry> {
        let conn = self.lock();
        self.write(&conn, key, value, ctx)
    }

    fn set_if_absent_or_older(
        &self,
        key: &str,
        value: Output,
        max_age: Duration,
        ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        let mut conn = self.lock();
        let tx = begin(&mut conn)?;
        if let Some(current) = self.select(&tx, key)? {
            if !current.is_older_than(max_age) {
                return Err(claimed(key, &current));
            }
        }
        let entry = self.write(&tx, key, value, ctx)?;
        tx.commit()?;
        Ok(entry)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: Output,
        ctx: &Context,
    ) -> StoreResult<StoreEntry> {
        let mut conn = self.lock();
        let tx = begin(&mut conn)?;
        let current = self
            .select(&tx, key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if current.data().to_text() != expected {
            return Err(mismatch());
        }
        let entry = self.write(&tx, key, value, ctx)?;
        tx.commit()?;
        Ok(entry)
    }

    fn update_transaction(
        &self,
        key: &str,
        f: &mut TransactionFn<'_>,
        ctx: &Context,
    ) -> StoreResult<Option<StoreEntry>> {
        let mut conn = self.lock();
        let tx = begin(&mut conn)?;
        let current = self.select(&tx, key)?;
        match f(current.as_ref()).map_err(StoreError::Aborted)? {
            Update::Unchanged => Ok(current),
            Update::Write(value) => {
                let entry = self.write(&tx, key, value, ctx)?;
                tx.commit()?;
                Ok(Some(entry))
            }
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.lock()
            .execute(&format!("DELETE FROM {} WHERE key = ?1", self.table), params![key])?;
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT key FROM {} ORDER BY key", self.table))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn len(&self) -> StoreResult<usize> {
        let count: i64 = self.lock().query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn all(&self, limit: usize) -> StoreResult<BTreeMap<String, Arc<Output>>> {
        let conn = self.lock();
        Ok(self
            .select_all(&conn, limit)?
            .into_iter()
            .map(|(key, entry)| (key, entry.shared_data()))
            .collect())
    }

    fn search(&self, query: &SearchQuery) -> StoreResult<BTreeMap<String, StoreEntry>> {
        let conn = self.lock();
        Ok(self
            .select_all(&conn, 0)?
            .into_iter()
            .filter(|(key, entry)| query.matches(key, entry))
            .collect())
    }

    fn delete_older(&self, max_age: Duration) -> StoreResult<usize> {
        let deleted = self.lock().execute(
            &format!("DELETE FROM {} WHERE modification_time < ?1", self.table),
            params![cutoff(max_age)],
        )?;
        Ok(deleted)
    }

    fn trim(&self, max_entries: usize) -> StoreResult<usize> {
        let keep = i64::try_from(max_entries).unwrap_or(i64::MAX);
        let deleted = self.lock().execute(
            &format!(
                "DELETE FROM {table} WHERE key NOT IN \
                 (SELECT key FROM {table} ORDER BY modification_time DESC LIMIT ?1)",
                table = self.table
            ),
            params![keep],
        )?;
        Ok(deleted)
    }

    fn set_all(&self, values: BTreeMap<String, serde_json::Value>, ctx: &Context) -> StoreResult<usize> {
        let mut conn = self.lock();
        let tx = begin(&mut conn)?;
        let count = values.len();
        for (key, value) in values {
            self.write(&tx, &key, Output::json(value), ctx)?;
        }
        tx.commit()?;
        Ok(count)
    }
}
