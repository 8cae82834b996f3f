mod gcs;
mod s3;

use anyhow::{Context, Result};
use dyn_clone::{clone_trait_object, DynClone};
use slog::{info, o, warn, Logger};
use std::{collections::HashSet, fmt::Debug};
use tokio::runtime::Handle;

pub use gcs::GcsObjectStore;
pub use s3::S3ObjectStore;

use crate::{
    aws_credentials,
    batch_path::{split_key_extensions, BatchPath},
    clock::Interval,
    config::{Identity, StoragePath},
    logging::event,
    metrics::ApiClientMetricsCollector,
};

/// All task markers live under this key prefix, which keeps them out of the
/// way of the per-aggregation-ID batch objects.
const TASK_MARKER_PREFIX: &str = "task-markers/";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Gcs(#[from] gcs::GcsError),
    #[error(transparent)]
    S3(#[from] s3::S3Error),
}

/// The capability set a cloud object store must provide for the workflow
/// manager: prefix listing with pagination handled internally, top-level
/// prefix discovery, and creation of empty objects. Implementations are
/// selected by URL scheme at startup.
pub trait ObjectStore: Debug + DynClone + Send + Sync {
    /// Lists the keys of all objects whose key begins with the provided
    /// prefix, concatenating paginated responses until the listing is
    /// exhausted. A listing of a nonexistent bucket returns an empty list.
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Lists the distinct first `/`-delimited key components in the bucket.
    /// Returned values include the trailing delimiter.
    fn list_prefixes(&self) -> Result<Vec<String>, StorageError>;

    /// Creates a zero-length object at the provided key. Re-creating an
    /// existing object is success.
    fn put_empty_object(&self, key: &str) -> Result<(), StorageError>;

    /// The bucket URL, for logging.
    fn path(&self) -> String;
}

clone_trait_object!(ObjectStore);

/// A bucket holding batches and task markers for some set of aggregation IDs.
/// The scheduler's view of storage: all listing, filtering and marker
/// bookkeeping goes through here, over whichever ObjectStore the bucket URL
/// selected.
#[derive(Clone, Debug)]
pub struct Bucket {
    store: Box<dyn ObjectStore>,
    dry_run: bool,
    logger: Logger,
}

impl Bucket {
    /// Creates a Bucket over the object store addressed by `path`, accessed
    /// as `identity`. `purpose` distinguishes the credential sessions of this
    /// process's buckets from one another. When `dry_run` is true, marker
    /// writes are logged but not performed; reads remain real.
    pub fn new(
        path: &StoragePath,
        identity: &Identity,
        purpose: &str,
        dry_run: bool,
        runtime_handle: &Handle,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> Result<Bucket> {
        let store: Box<dyn ObjectStore> = match path {
            StoragePath::GCSPath(gcs_path) => Box::new(GcsObjectStore::new(
                gcs_path.clone(),
                identity.clone(),
                parent_logger,
                api_metrics,
            )),
            StoragePath::S3Path(s3_path) => Box::new(S3ObjectStore::new(
                s3_path.clone(),
                aws_credentials::Provider::new(identity, purpose, parent_logger, api_metrics)
                    .context("failed to create AWS credentials provider")?,
                runtime_handle,
                parent_logger,
            )),
        };
        Ok(Self::new_with_object_store(store, dry_run, parent_logger))
    }

    /// Creates a Bucket over an arbitrary ObjectStore. Used by tests to run
    /// the scheduler against in-memory storage.
    pub fn new_with_object_store(
        store: Box<dyn ObjectStore>,
        dry_run: bool,
        parent_logger: &Logger,
    ) -> Bucket {
        let logger = parent_logger.new(o!(
            event::STORAGE_PATH => store.path(),
        ));
        Bucket {
            store,
            dry_run,
            logger,
        }
    }

    /// Lists the keys of all batch objects for the provided aggregation ID
    /// whose batch time falls within the interval. Object stores only index
    /// by key prefix, not by timestamp, so interval filtering happens here
    /// after parsing each key; keys that cannot be parsed are logged and
    /// skipped rather than failing the listing.
    pub fn list_batch_files(
        &self,
        aggregation_id: &str,
        interval: &Interval,
    ) -> Result<Vec<String>, StorageError> {
        let keys = self.store.list_objects(&format!("{}/", aggregation_id))?;

        let mut in_interval = Vec::with_capacity(keys.len());
        for key in keys {
            let (key_prefix, _) = split_key_extensions(&key);
            match BatchPath::from_key_prefix(key_prefix) {
                Ok(batch_path) => {
                    if interval.contains(&batch_path.time) {
                        in_interval.push(key);
                    }
                }
                Err(error) => {
                    warn!(
                        self.logger, "ignoring object with unparseable key";
                        event::STORAGE_KEY => &key,
                        "error" => format!("{:?}", error),
                    );
                }
            }
        }
        Ok(in_interval)
    }

    /// Enumerates the intake task markers for the provided aggregation ID.
    /// Intake marker names contain a batch ID but no timestamp, so the
    /// interval cannot narrow the listing; all markers under the prefix are
    /// returned.
    pub fn list_intake_task_markers(
        &self,
        aggregation_id: &str,
        interval: &Interval,
    ) -> Result<HashSet<String>, StorageError> {
        info!(
            self.logger, "listing intake task markers";
            event::AGGREGATION_ID => aggregation_id,
            event::INTERVAL => interval.to_string(),
        );
        self.list_task_markers(&format!("intake-{}-", aggregation_id))
    }

    /// Enumerates the aggregate task markers for the provided aggregation ID.
    pub fn list_aggregate_task_markers(
        &self,
        aggregation_id: &str,
    ) -> Result<HashSet<String>, StorageError> {
        info!(
            self.logger, "listing aggregate task markers";
            event::AGGREGATION_ID => aggregation_id,
        );
        self.list_task_markers(&format!("aggregate-{}-", aggregation_id))
    }

    fn list_task_markers(&self, marker_prefix: &str) -> Result<HashSet<String>, StorageError> {
        let keys = self
            .store
            .list_objects(&format!("{}{}", TASK_MARKER_PREFIX, marker_prefix))?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(TASK_MARKER_PREFIX))
            .map(ToOwned::to_owned)
            .collect())
    }

    /// Writes a zero-length task marker object whose presence records that
    /// the corresponding task was enqueued. Idempotent: concurrent scheduler
    /// instances may write the same marker. Under dry-run, the write is
    /// logged and skipped.
    pub fn write_task_marker(&self, marker: &str) -> Result<(), StorageError> {
        let key = format!("{}{}", TASK_MARKER_PREFIX, marker);
        if self.dry_run {
            info!(
                self.logger, "dry run: skipping task marker write";
                event::TASK_MARKER => marker,
            );
            return Ok(());
        }
        info!(
            self.logger, "writing task marker";
            event::TASK_MARKER => marker,
        );
        self.store.put_empty_object(&key)
    }

    /// Discovers the aggregation IDs present in this bucket: the distinct
    /// top-level key prefixes, minus the task marker prefix.
    pub fn list_aggregation_ids(&self) -> Result<Vec<String>, StorageError> {
        let prefixes = self.store.list_prefixes()?;
        Ok(prefixes
            .into_iter()
            .map(|prefix| prefix.trim_end_matches('/').to_owned())
            .filter(|prefix| prefix != TASK_MARKER_PREFIX.trim_end_matches('/'))
            .collect())
    }

    pub fn path(&self) -> String {
        self.store.path()
    }
}
