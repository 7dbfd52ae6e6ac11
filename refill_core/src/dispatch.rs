//! Notification dispatch.
//!
//! [`NotificationDispatcher`] is the boundary to whatever actually shows an
//! alert. [`JsonlOutbox`] is the bundled implementation: schedule, cancel and
//! delivery events are appended to a JSON Lines file under `fs2` locks, and a
//! notifier folds the log into the set of still-pending notifications.
//! [`JsonlOutbox::compact`] rolls the log up to just those pending entries.

use crate::{Error, ReminderId, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Failures reported by a dispatcher
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Nothing pending under this id (already fired, cancelled, or unknown)
    #[error("Reminder {1} of prescription {0} is not pending")]
    NotFound(Uuid, ReminderId),

    /// Dispatcher could not be reached or could not record the request
    #[error("Dispatcher unavailable: {0}")]
    Unavailable(String),

    /// Dispatcher refused the request
    #[error("Dispatcher rejected request: {0}")]
    Rejected(String),
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Fires a user-visible alert at or after a target time
pub trait NotificationDispatcher: Send + Sync {
    fn schedule(
        &self,
        prescription_id: Uuid,
        reminder_id: ReminderId,
        fire_at: DateTime<Utc>,
        message: &str,
    ) -> DispatchResult<()>;

    /// Cancelling something already fired or cancelled reports `NotFound`,
    /// which callers treat as success.
    fn cancel(&self, prescription_id: Uuid, reminder_id: ReminderId) -> DispatchResult<()>;
}

/// A line of the outbox
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OutboxEvent,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboxEvent {
    Scheduled {
        prescription_id: Uuid,
        reminder_id: ReminderId,
        fire_at: DateTime<Utc>,
        message: String,
    },
    Cancelled {
        prescription_id: Uuid,
        reminder_id: ReminderId,
    },
    Delivered {
        prescription_id: Uuid,
        reminder_id: ReminderId,
    },
}

/// A scheduled notification that has neither fired nor been cancelled
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingNotification {
    pub prescription_id: Uuid,
    pub reminder_id: ReminderId,
    pub fire_at: DateTime<Utc>,
    pub message: String,
}

/// Append-only JSONL outbox.
///
/// Writers serialize on a sidecar `.lock` file rather than the log itself,
/// so [`JsonlOutbox::compact`] can swap the log out by rename.
pub struct JsonlOutbox {
    path: PathBuf,
}

/// Exclusive hold on an outbox, released on drop
struct OutboxGuard {
    lock: File,
}

impl Drop for OutboxGuard {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path.with_extension("lock"))
}

impl JsonlOutbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::io::Result<OutboxGuard> {
        let lock = open_lock_file(&self.path)?;
        lock.lock_exclusive()?;
        Ok(OutboxGuard { lock })
    }

    fn open_append(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
    }

    fn write_entry(file: &File, event: OutboxEvent) -> std::io::Result<()> {
        let entry = OutboxEntry {
            recorded_at: Utc::now(),
            event,
        };
        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(&entry)?;
        // Terminate a partial line left behind by an interrupted write
        if !Self::ends_cleanly(file)? {
            writer.write_all(b"\n")?;
        }
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    fn ends_cleanly(mut file: &File) -> std::io::Result<bool> {
        if file.metadata()?.len() == 0 {
            return Ok(true);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        Ok(last[0] == b'\n')
    }

    /// Append `event` only if the reminder is currently pending
    fn retire(
        &self,
        prescription_id: Uuid,
        reminder_id: ReminderId,
        event: OutboxEvent,
    ) -> DispatchResult<()> {
        let _guard = self.lock().map_err(unavailable)?;

        let pending = fold_pending(read_unlocked(&self.path).map_err(unavailable)?);
        if !pending.contains_key(&(prescription_id, reminder_id)) {
            return Err(DispatchError::NotFound(prescription_id, reminder_id));
        }

        let file = self.open_append().map_err(unavailable)?;
        Self::write_entry(&file, event).map_err(unavailable)
    }

    /// Record that a pending notification was shown to the user
    pub fn mark_delivered(&self, prescription_id: Uuid, reminder_id: ReminderId) -> DispatchResult<()> {
        self.retire(
            prescription_id,
            reminder_id,
            OutboxEvent::Delivered {
                prescription_id,
                reminder_id,
            },
        )?;
        tracing::debug!("Delivered reminder {} for {}", reminder_id, prescription_id);
        Ok(())
    }

    /// Rewrite the outbox so it holds only still-pending notifications
    ///
    /// The new log is written to a temp file, fsynced, then renamed over the
    /// old one while the outbox lock is held. Returns the number of entries
    /// dropped.
    pub fn compact(&self) -> Result<usize> {
        let _guard = self.lock()?;

        let entries = read_unlocked(&self.path)?;
        if entries.is_empty() {
            return Ok(0);
        }
        let total = entries.len();
        let pending = fold_pending(entries);
        let kept = pending.len();

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for notification in pending.into_values() {
                let entry = OutboxEntry {
                    recorded_at: Utc::now(),
                    event: OutboxEvent::Scheduled {
                        prescription_id: notification.prescription_id,
                        reminder_id: notification.reminder_id,
                        fire_at: notification.fire_at,
                        message: notification.message,
                    },
                };
                serde_json::to_writer(&mut writer, &entry)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::info!(
            "Compacted outbox {:?}: kept {} of {} entries",
            self.path,
            kept,
            total
        );
        Ok(total - kept)
    }
}

fn unavailable(e: std::io::Error) -> DispatchError {
    DispatchError::Unavailable(e.to_string())
}

impl NotificationDispatcher for JsonlOutbox {
    fn schedule(
        &self,
        prescription_id: Uuid,
        reminder_id: ReminderId,
        fire_at: DateTime<Utc>,
        message: &str,
    ) -> DispatchResult<()> {
        let _guard = self.lock().map_err(unavailable)?;
        let file = self.open_append().map_err(unavailable)?;
        Self::write_entry(
            &file,
            OutboxEvent::Scheduled {
                prescription_id,
                reminder_id,
                fire_at,
                message: message.to_string(),
            },
        )
        .map_err(unavailable)?;

        tracing::debug!(
            "Scheduled reminder {} for {} at {}",
            reminder_id,
            prescription_id,
            fire_at
        );
        Ok(())
    }

    fn cancel(&self, prescription_id: Uuid, reminder_id: ReminderId) -> DispatchResult<()> {
        self.retire(
            prescription_id,
            reminder_id,
            OutboxEvent::Cancelled {
                prescription_id,
                reminder_id,
            },
        )?;
        tracing::debug!("Cancelled reminder {} for {}", reminder_id, prescription_id);
        Ok(())
    }
}

fn parse_entries(contents: &str) -> Vec<OutboxEntry> {
    let mut entries = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OutboxEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Failed to parse outbox entry at line {}: {}", line_num + 1, e);
            }
        }
    }
    entries
}

fn fold_pending(
    entries: impl IntoIterator<Item = OutboxEntry>,
) -> BTreeMap<(Uuid, ReminderId), PendingNotification> {
    let mut pending = BTreeMap::new();
    for entry in entries {
        match entry.event {
            OutboxEvent::Scheduled {
                prescription_id,
                reminder_id,
                fire_at,
                message,
            } => {
                pending.insert(
                    (prescription_id, reminder_id),
                    PendingNotification {
                        prescription_id,
                        reminder_id,
                        fire_at,
                        message,
                    },
                );
            }
            OutboxEvent::Cancelled {
                prescription_id,
                reminder_id,
            }
            | OutboxEvent::Delivered {
                prescription_id,
                reminder_id,
            } => {
                pending.remove(&(prescription_id, reminder_id));
            }
        }
    }
    pending
}

/// Read the log without taking the outbox lock
fn read_unlocked(path: &Path) -> std::io::Result<Vec<OutboxEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut contents = String::new();
    BufReader::new(File::open(path)?).read_to_string(&mut contents)?;
    Ok(parse_entries(&contents))
}

/// Read every entry of an outbox file
pub fn read_entries(path: &Path) -> Result<Vec<OutboxEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let lock = open_lock_file(path)?;
    lock.lock_shared()?;
    let entries = read_unlocked(path);
    lock.unlock()?;
    let entries = entries?;

    tracing::debug!("Read {} outbox entries", entries.len());
    Ok(entries)
}

/// Notifications still waiting to fire, earliest first
pub fn pending_notifications(path: &Path) -> Result<Vec<PendingNotification>> {
    let mut pending: Vec<_> = fold_pending(read_entries(path)?).into_values().collect();
    pending.sort_by(|a, b| {
        a.fire_at
            .cmp(&b.fire_at)
            .then_with(|| a.prescription_id.cmp(&b.prescription_id))
            .then_with(|| a.reminder_id.cmp(&b.reminder_id))
    });
    Ok(pending)
}

/// Pending notifications whose time has come
pub fn due_notifications(path: &Path, now: DateTime<Utc>) -> Result<Vec<PendingNotification>> {
    Ok(pending_notifications(path)?
        .into_iter()
        .filter(|n| n.fire_at <= now)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_schedule_and_read_pending() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outbox = JsonlOutbox::new(temp_dir.path().join("notifications.jsonl"));
        let id = Uuid::new_v4();

        outbox.schedule(id, ReminderId::new(1, 1), at(12), "second").unwrap();
        outbox.schedule(id, ReminderId::new(1, 0), at(9), "first").unwrap();

        let pending = pending_notifications(outbox.path()).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].message, "first");
        assert_eq!(pending[1].fire_at, at(12));
    }

    #[test]
    fn test_cancel_is_idempotent_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outbox = JsonlOutbox::new(temp_dir.path().join("notifications.jsonl"));
        let id = Uuid::new_v4();
        let reminder = ReminderId::new(1, 0);

        outbox.schedule(id, reminder, at(9), "refill soon").unwrap();
        outbox.cancel(id, reminder).unwrap();
        assert!(pending_notifications(outbox.path()).unwrap().is_empty());

        assert!(matches!(
            outbox.cancel(id, reminder),
            Err(DispatchError::NotFound(_, _))
        ));
        assert!(matches!(
            outbox.cancel(Uuid::new_v4(), reminder),
            Err(DispatchError::NotFound(_, _))
        ));
    }

    #[test]
    fn test_due_and_delivered() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outbox = JsonlOutbox::new(temp_dir.path().join("notifications.jsonl"));
        let id = Uuid::new_v4();

        outbox.schedule(id, ReminderId::new(1, 0), at(9), "early").unwrap();
        outbox.schedule(id, ReminderId::new(1, 1), at(15), "late").unwrap();

        let due = due_notifications(outbox.path(), at(10)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message, "early");

        outbox.mark_delivered(id, due[0].reminder_id).unwrap();
        assert!(due_notifications(outbox.path(), at(10)).unwrap().is_empty());

        // A delivered reminder can no longer be cancelled
        assert!(matches!(
            outbox.cancel(id, ReminderId::new(1, 0)),
            Err(DispatchError::NotFound(_, _))
        ));
        assert_eq!(pending_notifications(outbox.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_rescheduling_same_id_replaces() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outbox = JsonlOutbox::new(temp_dir.path().join("notifications.jsonl"));
        let id = Uuid::new_v4();
        let reminder = ReminderId::new(2, 0);

        outbox.schedule(id, reminder, at(9), "old").unwrap();
        outbox.schedule(id, reminder, at(9) + Duration::hours(1), "new").unwrap();

        let pending = pending_notifications(outbox.path()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, "new");
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("notifications.jsonl");
        let outbox = JsonlOutbox::new(&path);
        let id = Uuid::new_v4();

        outbox.schedule(id, ReminderId::new(1, 0), at(9), "kept").unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ not json").unwrap();

        let pending = pending_notifications(&path).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, "kept");
    }

    #[test]
    fn test_append_after_partial_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("notifications.jsonl");
        std::fs::write(&path, r#"{"recorded_at":"2025-06-01T00:00:00Z","ev"#).unwrap();

        let outbox = JsonlOutbox::new(&path);
        let id = Uuid::new_v4();
        outbox.schedule(id, ReminderId::new(1, 0), at(9), "after crash").unwrap();

        let pending = pending_notifications(&path).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, "after crash");
    }

    #[test]
    fn test_compact_keeps_only_pending() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outbox = JsonlOutbox::new(temp_dir.path().join("notifications.jsonl"));
        let id = Uuid::new_v4();

        for seq in 0..4 {
            outbox
                .schedule(id, ReminderId::new(1, seq), at(9 + seq), "refill soon")
                .unwrap();
        }
        outbox.cancel(id, ReminderId::new(1, 0)).unwrap();
        outbox.mark_delivered(id, ReminderId::new(1, 1)).unwrap();
        let before = pending_notifications(outbox.path()).unwrap();

        // 4 scheduled + 1 cancelled + 1 delivered, 2 still pending
        assert_eq!(outbox.compact().unwrap(), 4);
        assert_eq!(read_entries(outbox.path()).unwrap().len(), 2);
        assert_eq!(pending_notifications(outbox.path()).unwrap(), before);

        // The compacted log keeps working
        outbox.cancel(id, ReminderId::new(1, 2)).unwrap();
        assert!(matches!(
            outbox.cancel(id, ReminderId::new(1, 0)),
            Err(DispatchError::NotFound(_, _))
        ));
        assert_eq!(pending_notifications(outbox.path()).unwrap().len(), 1);

        let extras: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "notifications.jsonl" && e.file_name() != "notifications.lock")
            .collect();
        assert!(extras.is_empty(), "Unexpected files: {:?}", extras);
    }

    #[test]
    fn test_compact_missing_outbox() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outbox = JsonlOutbox::new(temp_dir.path().join("notifications.jsonl"));
        assert_eq!(outbox.compact().unwrap(), 0);
    }

    #[test]
    fn test_missing_outbox_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nonexistent.jsonl");
        assert!(pending_notifications(&path).unwrap().is_empty());
    }
}
