use crate::entry::{SearchQuery, StoreEntry};
use crate::error::{StoreError, StoreResult};
use crate::namespace::{StoreNamespace, TransactionFn};
use chrono::{DateTime, Utc};
use flowcore::{Context, Output};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

const BACKEND: &str = "file";

/// Namespace storing one file per key in a directory. Values are written
/// as raw bytes and read back as bytes; the file's modification time is the
/// entry timestamp. Operations on one namespace are serialized so a read
/// never sees a half-written file.
pub struct FileNamespace {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileNamespace {
    /// Uses `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            debug!("Created file namespace directory: {:?}", dir);
        }
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(StoreError::BadRequest(format!("Invalid key \"{}\"", key)));
        }
        Ok(self.dir.join(key))
    }

    fn files(&self) -> StoreResult<Vec<(String, fs::Metadata)>> {
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let metadata = dir_entry.metadata()?;
            if metadata.is_file() {
                files.push((dir_entry.file_name().to_string_lossy().into_owned(), metadata));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

fn modified(metadata: &fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

impl StoreNamespace for FileNamespace {
    fn get(&self, key: &str) -> StoreResult<Option<StoreEntry>> {
        let path = self.path(key)?;
        let _guard = self.lock();
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let timestamp = modified(&file.metadata()?);
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(StoreEntry::at(Output::bytes(data), timestamp, None)))
    }

    fn set(&self, key: &str, value: Output, ctx: &Context) -> StoreResult<StoreEntry> {
        let path = self.path(key)?;
        let _guard = self.lock();
        fs::write(&path, value.to_bytes())?;
        Ok(StoreEntry::written_by(value, ctx))
    }

    fn set_if_absent_or_older(&self, _: &str, _: Output, _: Duration, _: &Context) -> StoreResult<StoreEntry> {
        Err(StoreError::unsupported(BACKEND, "setIfAbsentOrOlder"))
    }

    fn compare_and_swap(&self, _: &str, _: &str, _: Output, _: &Context) -> StoreResult<StoreEntry> {
        Err(StoreError::unsupported(BACKEND, "compareAndSwap"))
    }

    fn update_transaction(
        &self,
        _: &str,
        _: &mut TransactionFn<'_>,
        _: &Context,
    ) -> StoreResult<Option<StoreEntry>> {
        Err(StoreError::unsupported(BACKEND, "updateTransaction"))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path(key)?;
        let _guard = self.lock();
        match fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let _guard = self.lock();
        Ok(self.files()?.into_iter().map(|(name, _)| name).collect())
    }

    fn len(&self) -> StoreResult<usize> {
        let _guard = self.lock();
        Ok(self.files()?.len())
    }

    fn all(&self, _: usize) -> StoreResult<BTreeMap<String, Arc<Output>>> {
        Err(StoreError::unsupported(BACKEND, "getAll"))
    }

    fn search(&self, query: &SearchQuery) -> StoreResult<BTreeMap<String, StoreEntry>> {
        let query = SearchQuery {
            value: None,
            modified_by: None,
            ..query.clone()
        };
        let _guard = self.lock();
        Ok(self
            .files()?
            .into_iter()
            .map(|(name, metadata)| {
                let summary = Output::plain(format!("File of size: {}", metadata.len()));
                let entry = StoreEntry::at(summary, modified(&metadata), None);
                (name, entry)
            })
            .filter(|(name, entry)| query.matches(name, entry))
            .collect())
    }

    fn delete_older(&self, _: Duration) -> StoreResult<usize> {
        Err(StoreError::unsupported(BACKEND, "deleteOlder"))
    }

    fn trim(&self, _: usize) -> StoreResult<usize> {
        Err(StoreError::unsupported(BACKEND, "trim"))
    }

    fn set_all(&self, _: BTreeMap<String, serde_json::Value>, _: &Context) -> StoreResult<usize> {
        Err(StoreError::unsupported(BACKEND, "setAll"))
    }
}
