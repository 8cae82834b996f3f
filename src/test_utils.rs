//! Test fixtures shared by unit and integration tests: an in-memory object
//! store, task publishers with canned behavior, and a deterministic clock.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tokio::runtime::Runtime;

use crate::{
    clock::Clock,
    storage::{ObjectStore, StorageError},
    task::{EnqueueError, Task, TaskPublisher},
};

/// Constructs a multi-thread tokio runtime for tests that exercise rusoto
/// clients.
pub fn test_runtime() -> Runtime {
    Runtime::new().unwrap()
}

/// An ObjectStore over a BTreeMap. Clones share the same underlying map, so a
/// test may hold onto a clone to seed and inspect the store while a Bucket
/// owns another.
#[derive(Clone, Debug)]
pub struct InMemoryObjectStore {
    path: String,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new(path: &str) -> InMemoryObjectStore {
        InMemoryObjectStore {
            path: path.to_owned(),
            objects: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn put_object(&self, key: &str, content: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_owned(), content.to_vec());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn list_prefixes(&self) -> Result<Vec<String>, StorageError> {
        let mut prefixes: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter_map(|key| key.split_once('/').map(|(first, _)| format!("{}/", first)))
            .collect();
        prefixes.dedup();
        Ok(prefixes)
    }

    fn put_empty_object(&self, key: &str) -> Result<(), StorageError> {
        self.put_object(key, b"");
        Ok(())
    }

    fn path(&self) -> String {
        self.path.clone()
    }
}

/// A TaskPublisher that records every published task.
#[derive(Debug)]
pub struct RecordingPublisher<T: Task> {
    published: Mutex<Vec<T>>,
}

impl<T: Task> RecordingPublisher<T> {
    pub fn new() -> RecordingPublisher<T> {
        RecordingPublisher {
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<T> {
        self.published.lock().unwrap().clone()
    }
}

impl<T: Task> Default for RecordingPublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Task> TaskPublisher<T> for RecordingPublisher<T> {
    fn publish(&self, task: &T) -> Result<(), EnqueueError> {
        self.published.lock().unwrap().push(task.clone());
        Ok(())
    }
}

/// A TaskPublisher whose publishes always fail.
#[derive(Debug)]
pub struct FailingPublisher {}

impl<T: Task> TaskPublisher<T> for FailingPublisher {
    fn publish(&self, _task: &T) -> Result<(), EnqueueError> {
        Err(EnqueueError::SnsClient(anyhow!("simulated publish failure")))
    }
}

/// A Clock frozen at a fixed instant.
#[derive(Clone, Debug)]
pub struct FixedClock {
    pub now: DateTime<Utc>,
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
