//! On-disk table snapshots with atomic replacement and corruption recovery.
//!
//! A table is one JSON file holding every record keyed by id, plus a SHA-256
//! checksum of the record payload. Saves go through a temporary file and an
//! atomic rename; loads that hit unparsable JSON or a checksum mismatch move
//! the corrupt file aside and reinitialize the table to empty rather than
//! failing the caller.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use foreman_core::{AgentRecord, ForemanError, Result, TaskRecord};

/// A record that can live in a [`Table`].
///
/// `validate()` is the schema boundary: it runs on every insert, so no
/// component can persist a record the rest of the system cannot read.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn key(&self) -> &str;
    fn validate(&self) -> Result<()>;
}

impl Record for TaskRecord {
    fn key(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<()> {
        TaskRecord::validate(self)
    }
}

impl Record for AgentRecord {
    fn key(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        AgentRecord::validate(self)
    }
}

/// On-disk snapshot format: records plus an integrity checksum.
#[derive(Serialize, Deserialize)]
struct Snapshot<T> {
    checksum: String,
    records: BTreeMap<String, T>,
}

/// One logical table, fully held in memory and snapshotted to disk.
pub struct Table<T: Record> {
    name: String,
    path: PathBuf,
    records: BTreeMap<String, T>,
}

impl<T: Record> Table<T> {
    /// Load a table from `<dir>/<name>.json`.
    ///
    /// A missing file yields an empty table. A corrupt file is backed up to
    /// `<name>.json.corrupt-<unix-ts>` and the table reinitialized empty,
    /// with a warning; the caller never sees the corruption as an error.
    pub async fn load(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", name));

        let records = match fs::read(&path).await {
            Ok(data) => match parse_snapshot::<T>(&data) {
                Ok(records) => records,
                Err(reason) => {
                    back_up_corrupt(&path, name, &reason).await;
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Table {} does not exist yet, starting empty", name);
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded table {} with {} records", name, records.len());
        Ok(Self {
            name: name.to_string(),
            path,
            records,
        })
    }

    /// Persist the table: serialize, write to a temp file, atomically rename.
    pub async fn save(&self) -> Result<()> {
        let payload = serde_json::to_string(&self.records)?;
        let snapshot = Snapshot {
            checksum: checksum(&payload),
            records: self.records.clone(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, &self.path).await?;

        debug!("Saved table {} ({} records)", self.name, self.records.len());
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.records.get(key)
    }

    /// Insert or replace a record after validating it.
    pub fn insert(&mut self, record: T) -> Result<()> {
        record.validate()?;
        self.records.insert(record.key().to_string(), record);
        Ok(())
    }

    /// Insert a record, failing if the key already exists.
    pub fn insert_new(&mut self, record: T) -> Result<()> {
        record.validate()?;
        let key = record.key().to_string();
        if self.records.contains_key(&key) {
            return Err(ForemanError::Store(format!(
                "record {} already exists in table {}",
                key, self.name
            )));
        }
        self.records.insert(key, record);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.records.remove(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keep only records matching the predicate; returns how many were dropped.
    pub fn retain<F: Fn(&T) -> bool>(&mut self, keep: F) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| keep(record));
        before - self.records.len()
    }
}

fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

fn parse_snapshot<T: Record>(data: &[u8]) -> std::result::Result<BTreeMap<String, T>, String> {
    let snapshot: Snapshot<T> =
        serde_json::from_slice(data).map_err(|e| format!("unparsable snapshot: {}", e))?;

    let payload = serde_json::to_string(&snapshot.records)
        .map_err(|e| format!("unserializable records: {}", e))?;
    if checksum(&payload) != snapshot.checksum {
        return Err("checksum mismatch".to_string());
    }

    Ok(snapshot.records)
}

async fn back_up_corrupt(path: &Path, name: &str, reason: &str) {
    let backup = PathBuf::from(format!(
        "{}.corrupt-{}",
        path.display(),
        chrono::Utc::now().timestamp()
    ));
    match fs::rename(path, &backup).await {
        Ok(()) => warn!(
            "Table {} was corrupt ({}); backed up to {} and reinitialized empty",
            name,
            reason,
            backup.display()
        ),
        Err(e) => warn!(
            "Table {} was corrupt ({}) and backup failed ({}); reinitializing empty",
            name, reason, e
        ),
    }
}
