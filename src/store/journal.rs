// Copyright 2020 Joyent, Inc.

//! File-backed store.
//!
//! Each mutation is appended to the journal as one JSON object per line and
//! synced to disk before it is applied in memory, so a caller that sees `Ok`
//! from `create` or `complete` knows the change survives a restart.  A
//! mutation runs on its own task and finishes even if the caller stops
//! waiting for it.
//!
//! Opening a journal replays it from the start.  A final line without its
//! newline is the remains of an interrupted write; it is discarded and
//! truncated away.  Records still pending at that point were being worked
//! on by a process that is gone, and are completed as failed with
//! [`INTERRUPTED`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{
    Completion, RecordTable, RequestRecord, RequestStore, StoreError,
};
use crate::protocol::RequestId;

/// Failure recorded for work a previous process never finished.
pub const INTERRUPTED: &str = "interrupted by restart";

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Entry {
    Created {
        record: RequestRecord,
    },
    Completed {
        id: RequestId,
        completion: Completion,
        completed_at: DateTime<Utc>,
    },
}

struct Journal {
    table: RecordTable,
    file: File,
    path: PathBuf,
    /// Length of the file up to the last fully written entry.
    len: u64,
    /// Set when a failed append could not be rolled back.
    broken: bool,
}

pub struct JournalStore {
    inner: Arc<Mutex<Journal>>,
}

fn unavailable(path: &Path, e: io::Error) -> StoreError {
    StoreError::Unavailable(format!("journal {}: {}", path.display(), e))
}

fn apply(table: &mut RecordTable, entry: Entry) -> Result<(), StoreError> {
    match entry {
        Entry::Created { record } => table.insert(record),
        Entry::Completed {
            id,
            completion,
            completed_at,
        } => table.complete(&id, completion, completed_at),
    }
}

/// Like [`apply`], except that repeating a completion already in the table
/// is a no-op.
fn apply_replayed(
    table: &mut RecordTable,
    entry: Entry,
) -> Result<(), StoreError> {
    if let Entry::Completed { id, completion, .. } = &entry {
        let repeated = table
            .get(id)
            .map_or(false, |r| r.completion.as_ref() == Some(completion));
        if repeated {
            return Ok(());
        }
    }
    apply(table, entry)
}

/// Replay journal contents into `table`, returning the length of the prefix
/// made of complete lines.
fn replay(table: &mut RecordTable, contents: &str) -> Result<u64, StoreError> {
    let mut valid = 0;
    for (n, line) in contents.split_inclusive('\n').enumerate() {
        if !line.ends_with('\n') {
            break;
        }
        valid += line.len();
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(line)
            .map_err(|source| StoreError::Corrupt { line: n + 1, source })?;
        apply_replayed(table, entry)?;
    }
    Ok(valid as u64)
}

impl JournalStore {
    /// Open the journal at `path`, creating it if needed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<JournalStore, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut table = RecordTable::default();

        let (valid, total) = match fs::read_to_string(&path).await {
            Ok(contents) => (replay(&mut table, &contents)?, contents.len() as u64),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (0, 0),
            Err(e) => return Err(unavailable(&path, e)),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| unavailable(&path, e))?;
        if valid < total {
            file.set_len(valid).await.map_err(|e| unavailable(&path, e))?;
        }

        let mut journal = Journal {
            table,
            file,
            path,
            len: valid,
            broken: false,
        };
        for id in journal.table.pending() {
            let entry = Entry::Completed {
                id,
                completion: Completion::Failed(String::from(INTERRUPTED)),
                completed_at: Utc::now(),
            };
            journal.append(&entry).await?;
            apply(&mut journal.table, entry)?;
        }

        Ok(JournalStore {
            inner: Arc::new(Mutex::new(journal)),
        })
    }

    /// Validate, append and apply one entry on a task of its own, so that
    /// the file and the table never disagree about it.
    async fn mutate<F>(&self, prepare: F) -> Result<(), StoreError>
    where
        F: FnOnce(&RecordTable) -> Result<Entry, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut journal = inner.lock().await;
            if journal.broken {
                return Err(StoreError::Unavailable(format!(
                    "journal {} must be reopened",
                    journal.path.display()
                )));
            }
            let entry = prepare(&journal.table)?;
            journal.append(&entry).await?;
            apply(&mut journal.table, entry)
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Unavailable(format!(
                "journal write failed: {}",
                e
            ))),
        }
    }
}

impl Journal {
    async fn write(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line).await?;
        self.file.sync_data().await
    }

    /// Write one entry, or leave the file as it was.
    async fn append(&mut self, entry: &Entry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        line.push(b'\n');

        if let Err(e) = self.write(&line).await {
            if self.file.set_len(self.len).await.is_err() {
                self.broken = true;
            }
            return Err(unavailable(&self.path, e));
        }
        self.len += line.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl RequestStore for JournalStore {
    async fn create(
        &self,
        id: &RequestId,
        payload: Value,
    ) -> Result<(), StoreError> {
        let id = id.clone();
        self.mutate(move |table| {
            table.check_absent(&id)?;
            Ok(Entry::Created {
                record: RequestRecord::new(id, payload),
            })
        })
        .await
    }

    async fn complete(
        &self,
        id: &RequestId,
        completion: Completion,
    ) -> Result<(), StoreError> {
        let id = id.clone();
        self.mutate(move |table| {
            table.check_pending(&id)?;
            Ok(Entry::Completed {
                id,
                completion,
                completed_at: Utc::now(),
            })
        })
        .await
    }

    async fn get(
        &self,
        id: &RequestId,
    ) -> Result<Option<RequestRecord>, StoreError> {
        Ok(self.inner.lock().await.table.get(id))
    }

    async fn list_pending(&self) -> Result<Vec<RequestId>, StoreError> {
        Ok(self.inner.lock().await.table.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RequestStatus;
    use futures::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.journal");
        let (a, b) = (RequestId::generate(), RequestId::generate());

        {
            let store = JournalStore::open(&path).await.unwrap();
            store.create(&a, json!("x")).await.unwrap();
            store.create(&b, json!({"y": 2})).await.unwrap();
            store
                .complete(&a, Completion::Processed(json!("Processed: x")))
                .await
                .unwrap();
            assert_eq!(store.list_pending().await.unwrap(), vec![b.clone()]);
        }

        let store = JournalStore::open(&path).await.unwrap();
        let done = store.get(&a).await.unwrap().unwrap();
        assert_eq!(done.status, RequestStatus::Done);
        assert_eq!(
            done.completion,
            Some(Completion::Processed(json!("Processed: x")))
        );
        assert!(matches!(
            store.create(&a, json!("again")).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn reopen_fails_interrupted_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.journal");
        let id = RequestId::generate();

        {
            let store = JournalStore::open(&path).await.unwrap();
            store.create(&id, json!("x")).await.unwrap();
        }

        for _ in 0..2 {
            let store = JournalStore::open(&path).await.unwrap();
            assert!(store.list_pending().await.unwrap().is_empty());
            let record = store.get(&id).await.unwrap().unwrap();
            assert_eq!(
                record.completion,
                Some(Completion::Failed(INTERRUPTED.into()))
            );
        }
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.journal");
        let (a, b) = (RequestId::generate(), RequestId::generate());

        {
            let store = JournalStore::open(&path).await.unwrap();
            store.create(&a, json!(1)).await.unwrap();
            store
                .complete(&a, Completion::Processed(json!(1)))
                .await
                .unwrap();
        }
        let mut contents = std::fs::read_to_string(&path).unwrap();
        let intact = contents.len() as u64;
        contents.push_str(r#"{"op":"completed","id":"#);
        std::fs::write(&path, &contents).unwrap();

        let store = JournalStore::open(&path).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
        store.create(&b, json!(2)).await.unwrap();
        store
            .complete(&b, Completion::Failed("compute failed".into()))
            .await
            .unwrap();
        drop(store);

        let store = JournalStore::open(&path).await.unwrap();
        assert!(store.list_pending().await.unwrap().is_empty());
        assert!(store.get(&b).await.unwrap().unwrap().is_done());
    }

    #[tokio::test]
    async fn abandoned_completion_still_lands_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.journal");
        let id = RequestId::generate();
        let completion = Completion::Processed(json!("Processed: x"));

        let store = JournalStore::open(&path).await.unwrap();
        store.create(&id, json!("x")).await.unwrap();

        // The caller gives up after the first poll, as a timed-out
        // operation does.
        let abandoned = store.complete(&id, completion.clone()).now_or_never();
        assert!(abandoned.is_none());

        // A retry must not add a second entry that replay would reject.
        match store.complete(&id, completion.clone()).await {
            Ok(()) | Err(StoreError::AlreadyCompleted(_)) => (),
            other => panic!("unexpected retry outcome: {:?}", other),
        }
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.completion, Some(completion.clone()));
        drop(store);

        let store = JournalStore::open(&path).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.completion, Some(completion));
    }

    #[tokio::test]
    async fn repeated_completion_entry_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.journal");
        let id = RequestId::generate();

        {
            let store = JournalStore::open(&path).await.unwrap();
            store.create(&id, json!("x")).await.unwrap();
            store
                .complete(&id, Completion::Processed(json!("y")))
                .await
                .unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let last = contents.lines().last().unwrap().to_string();
        std::fs::write(&path, format!("{}{}\n", contents, last)).unwrap();

        let store = JournalStore::open(&path).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.completion, Some(Completion::Processed(json!("y"))));
    }

    #[tokio::test]
    async fn conflicting_completion_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.journal");
        let id = RequestId::generate();

        {
            let store = JournalStore::open(&path).await.unwrap();
            store.create(&id, json!("x")).await.unwrap();
            store
                .complete(&id, Completion::Processed(json!("y")))
                .await
                .unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let other = contents
            .lines()
            .last()
            .unwrap()
            .replace(r#""y""#, r#""z""#);
        std::fs::write(&path, format!("{}{}\n", contents, other)).unwrap();

        assert!(matches!(
            JournalStore::open(&path).await,
            Err(StoreError::AlreadyCompleted(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.journal");
        std::fs::write(&path, "not json\n").unwrap();

        assert!(matches!(
            JournalStore::open(&path).await,
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }
}
