//! Prescription persistence with file locking.
//!
//! All records live in one JSON document. Every write is a locked
//! read-modify-write that lands through an atomic rename, so a prescription
//! and its computed schedule are always stored together and a failed write
//! leaves the previous document in place.

use crate::{Error, PrescriptionRecord, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use uuid::Uuid;

const DOCUMENT_VERSION: u32 = 1;

/// Durable storage for prescriptions and their schedules
pub trait PrescriptionStore: Send + Sync {
    /// Insert or replace a record as one unit
    fn save(&self, record: &PrescriptionRecord) -> Result<()>;

    fn load(&self, id: Uuid) -> Result<PrescriptionRecord>;

    fn delete(&self, id: Uuid) -> Result<()>;

    /// Every stored record, oldest first
    fn list(&self) -> Result<Vec<PrescriptionRecord>>;

    /// Hold off other processes working on the same prescription until the
    /// guard drops. Stores with no cross-process readers need not lock.
    fn lock_record(&self, _id: Uuid) -> Result<RecordLock> {
        Ok(RecordLock::default())
    }
}

/// Exclusive hold on one prescription, released on drop
#[derive(Debug, Default)]
pub struct RecordLock {
    file: Option<File>,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                tracing::warn!("Failed to release prescription lock: {}", e);
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    records: BTreeMap<Uuid, PrescriptionRecord>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            records: BTreeMap::new(),
        }
    }
}

/// JSON document store guarded by `fs2` locks
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes writers inside this process; the lock file covers other processes.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn record_lock_path(&self, id: Uuid) -> Result<PathBuf> {
        Ok(self.parent_dir()?.join("locks").join(format!("{}.lock", id)))
    }

    fn parent_dir(&self) -> Result<&Path> {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "store path missing parent",
                ))
            })
    }

    /// Read the whole document under a shared lock
    fn read_document(&self) -> Result<StoreDocument> {
        if !self.path.exists() {
            return Ok(StoreDocument::default());
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        file.unlock()?;
        read?;

        if contents.trim().is_empty() {
            return Ok(StoreDocument::default());
        }

        let document: StoreDocument = serde_json::from_str(&contents).map_err(|e| {
            tracing::error!("Prescription store {:?} is unreadable: {}", self.path, e);
            e
        })?;
        Ok(document)
    }

    /// Write the document to a temp file and rename it over the store
    fn write_document(&self, document: &StoreDocument) -> Result<()> {
        let temp = NamedTempFile::new_in(self.parent_dir()?)?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(document)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Load, modify and save the document while holding both locks
    fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreDocument) -> Result<T>,
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        std::fs::create_dir_all(self.parent_dir()?)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        lock_file.lock_exclusive()?;

        let result = self.read_document().and_then(|mut document| {
            let value = f(&mut document)?;
            self.write_document(&document)?;
            Ok(value)
        });

        lock_file.unlock()?;
        result
    }

    /// Copy a consistent snapshot of the store to `dest`
    pub fn backup(&self, dest: &Path) -> Result<usize> {
        let document = self.read_document()?;

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, &document)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(dest).map_err(|e| Error::Io(e.error))?;

        tracing::info!(
            "Backed up {} prescriptions to {:?}",
            document.records.len(),
            dest
        );
        Ok(document.records.len())
    }
}

impl PrescriptionStore for JsonFileStore {
    fn save(&self, record: &PrescriptionRecord) -> Result<()> {
        self.update(|document| {
            document.records.insert(record.id(), record.clone());
            Ok(())
        })?;
        tracing::debug!("Saved prescription {} to {:?}", record.id(), self.path);
        Ok(())
    }

    fn load(&self, id: Uuid) -> Result<PrescriptionRecord> {
        self.read_document()?
            .records
            .remove(&id)
            .ok_or(Error::NotFound(id))
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.update(|document| {
            document
                .records
                .remove(&id)
                .map(|_| ())
                .ok_or(Error::NotFound(id))
        })?;
        tracing::debug!("Deleted prescription {} from {:?}", id, self.path);
        Ok(())
    }

    fn lock_record(&self, id: Uuid) -> Result<RecordLock> {
        // Lock files outlive their prescription; unlinking one under a waiter would split the lock.
        let path = self.record_lock_path(id)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(RecordLock { file: Some(file) })
    }

    fn list(&self) -> Result<Vec<PrescriptionRecord>> {
        let mut records: Vec<_> = self.read_document()?.records.into_values().collect();
        records.sort_by(|a, b| {
            a.prescription
                .created_at
                .cmp(&b.prescription.created_at)
                .then_with(|| a.prescription.name.cmp(&b.prescription.name))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Interval, Prescription, PrescriptionDraft, ReminderPlan, ReminderPreferences,
        StartAnchor,
    };
    use chrono::{NaiveDate, Utc};

    fn create_test_record(name: &str) -> PrescriptionRecord {
        let draft = PrescriptionDraft {
            name: name.into(),
            dosage_per_interval: 1,
            interval: Interval::days(1).unwrap(),
            supply_count: 30,
            start: StartAnchor::OnDate {
                date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            },
            reminders: ReminderPreferences::primary_only(Interval::days(3).unwrap()),
            notes: None,
        };
        let prescription = Prescription::from_draft(draft, Utc::now()).unwrap();
        PrescriptionRecord {
            depletion: prescription.start.instant(),
            prescription,
            plan: ReminderPlan::default(),
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("prescriptions.json"));

        let record = create_test_record("Metformin");
        store.save(&record).unwrap();

        let loaded = store.load(record.id()).unwrap();
        assert_eq!(loaded.prescription.name, "Metformin");
        assert_eq!(loaded.depletion, record.depletion);
    }

    #[test]
    fn test_missing_store_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("nonexistent.json"));

        assert!(store.list().unwrap().is_empty());
        let id = Uuid::new_v4();
        assert!(matches!(store.load(id), Err(Error::NotFound(missing)) if missing == id));
    }

    #[test]
    fn test_save_replaces_existing_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("prescriptions.json"));

        let mut record = create_test_record("Metformin");
        store.save(&record).unwrap();
        record.prescription.supply_count = 90;
        store.save(&record).unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].prescription.supply_count, 90);
    }

    #[test]
    fn test_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("prescriptions.json"));

        let keep = create_test_record("Keep");
        let drop = create_test_record("Drop");
        store.save(&keep).unwrap();
        store.save(&drop).unwrap();

        store.delete(drop.id()).unwrap();
        let remaining: Vec<_> = store.list().unwrap().into_iter().map(|r| r.id()).collect();
        assert_eq!(remaining, vec![keep.id()]);

        assert!(matches!(store.delete(drop.id()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_corrupted_store_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("prescriptions.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.list(), Err(Error::Json(_))));

        // A failed write must not clobber the unreadable document
        assert!(store.save(&create_test_record("New")).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ invalid json }");
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("prescriptions.json"));
        store.save(&create_test_record("Metformin")).unwrap();

        let extras: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "prescriptions.json" && e.file_name() != "prescriptions.lock")
            .collect();
        assert!(extras.is_empty(), "Unexpected files: {:?}", extras);
    }

    #[test]
    fn test_concurrent_saves_keep_every_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileStore::new(
            temp_dir.path().join("prescriptions.json"),
        ));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.save(&create_test_record(&format!("Med {}", i))).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list().unwrap().len(), 8);
    }

    #[test]
    fn test_record_lock_excludes_other_holders() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileStore::new(
            temp_dir.path().join("prescriptions.json"),
        ));
        let id = Uuid::new_v4();
        let inside = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        // Each thread opens its own descriptor, as separate processes would
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        let _lock = store.lock_record(id).unwrap();
                        let holders = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        assert_eq!(holders, 0, "Two holders of the same record lock");
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Other prescriptions are not held up
        let _held = store.lock_record(id).unwrap();
        let _other = store.lock_record(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_backup() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("prescriptions.json"));
        store.save(&create_test_record("Metformin")).unwrap();

        let dest = temp_dir.path().join("backups").join("snapshot.json");
        assert_eq!(store.backup(&dest).unwrap(), 1);

        let restored = JsonFileStore::new(&dest);
        assert_eq!(restored.list().unwrap()[0].prescription.name, "Metformin");
    }
}
