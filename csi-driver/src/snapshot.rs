//! Snapshot lifecycle manager
//!
//! Snapshots of share-backed volumes are share snapshots; snapshots of
//! file-backed volumes are file snapshots. Both are named after the CO's
//! snapshot name and identified externally by a [`SnapshotId`], which
//! carries the source path so delete and restore need no lookup table.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use storage_api::{ApiClient, TtlCache};
use tracing::{debug, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::locks::LockRegistry;
use crate::types::{SnapshotId, VolumePath, validate_name};

/// How long a created snapshot short-circuits repeated creates.
pub const RECENT_SNAPSHOT_TTL: Duration = Duration::from_secs(3600);
pub const RECENT_SNAPSHOT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub source_volume_id: String,
    pub size_bytes: i64,
    pub created_at: Option<SystemTime>,
}

/// Keep records matching both filters exactly; `None` matches everything.
pub fn filter_records(
    records: Vec<SnapshotRecord>,
    snapshot_id: Option<&str>,
    source_volume_id: Option<&str>,
) -> Vec<SnapshotRecord> {
    records
        .into_iter()
        .filter(|r| snapshot_id.is_none_or(|id| r.id.to_string() == id))
        .filter(|r| source_volume_id.is_none_or(|src| r.source_volume_id == src))
        .collect()
}

pub struct SnapshotManager {
    api: Arc<ApiClient>,
    locks: LockRegistry,
    recent: TtlCache<SnapshotRecord>,
}

impl SnapshotManager {
    pub fn new(api: Arc<ApiClient>, locks: LockRegistry) -> Self {
        Self {
            api,
            locks,
            recent: TtlCache::new(RECENT_SNAPSHOT_TTL, RECENT_SNAPSHOT_CAPACITY),
        }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, source_volume_id: &str) -> Result<SnapshotRecord> {
        validate_name("snapshot name", name)?;
        if source_volume_id.is_empty() {
            return Err(DriverError::InvalidArgument(
                "source volume id is required".to_string(),
            ));
        }
        let source: VolumePath = source_volume_id.parse()?;

        let _guard = self.locks.acquire(name).await?;

        if let Some(record) = self.recent.get(name) {
            if record.source_volume_id == source_volume_id {
                debug!(snapshot = %name, "Snapshot recently created");
                return Ok(record);
            }
            return Err(DriverError::AlreadyExists(format!(
                "snapshot {} already exists for volume {}",
                name, record.source_volume_id
            )));
        }

        let size_bytes = match &source {
            VolumePath::Share { name: share } => self.snapshot_share(share, name).await?,
            VolumePath::File { .. } => self.snapshot_file(&source, name).await?,
        };

        let record = SnapshotRecord {
            id: SnapshotId::new(name, source.to_string())?,
            source_volume_id: source_volume_id.to_string(),
            size_bytes,
            created_at: Some(SystemTime::now()),
        };
        self.recent.insert(name.to_string(), record.clone());
        info!(snapshot_id = %record.id, "Created snapshot");
        Ok(record)
    }

    async fn snapshot_share(&self, share: &str, snapshot: &str) -> Result<i64> {
        let source = self
            .api
            .get_share(share)
            .await?
            .filter(|s| !s.is_removed())
            .ok_or_else(|| DriverError::NotFound(format!("source volume /{} not found", share)))?;

        let existing = self.api.list_share_snapshots(share).await?;
        if existing.iter().any(|s| s == snapshot) {
            info!(share = %share, snapshot = %snapshot, "Share snapshot already exists");
        } else if !self.api.create_share_snapshot(share, snapshot).await? {
            return Err(DriverError::Internal(format!(
                "snapshot task for share {} did not complete",
                share
            )));
        }
        Ok(source.size())
    }

    async fn snapshot_file(&self, source: &VolumePath, snapshot: &str) -> Result<i64> {
        let path = source.to_string();
        let file = self
            .api
            .get_file(&path)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("source volume {} not found", path)))?;

        let existing = self.api.list_file_snapshots(&path).await?;
        if existing.iter().any(|s| s.name == snapshot) {
            info!(path = %path, snapshot = %snapshot, "File snapshot already exists");
        } else if !self.api.create_file_snapshot(&path, snapshot).await? {
            return Err(DriverError::Internal(format!(
                "snapshot task for {} did not complete",
                path
            )));
        }
        Ok(file.size)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, snapshot_id: &str) -> Result<()> {
        let id: SnapshotId = snapshot_id.parse()?;
        let _guard = self.locks.acquire(id.name()).await?;

        // Missing snapshots count as deleted. A share-level source is tried
        // as both kinds; a file path can only carry a file snapshot.
        let deleted = match id.source_path().parse::<VolumePath>() {
            Ok(VolumePath::File { .. }) => {
                self.api
                    .delete_file_snapshot(id.source_path(), id.name())
                    .await?
            }
            _ => {
                let share_done = self
                    .api
                    .delete_share_snapshot(id.source_name(), id.name())
                    .await?;
                if let Err(e) = self
                    .api
                    .delete_file_snapshot(id.source_path(), id.name())
                    .await
                {
                    debug!(snapshot_id = %id, error = %e, "No file snapshot to remove");
                }
                share_done
            }
        };
        if !deleted {
            return Err(DriverError::Internal(format!(
                "delete task for snapshot {} did not complete",
                id
            )));
        }

        self.recent.invalidate(id.name());
        info!(snapshot_id = %id, "Deleted snapshot");
        Ok(())
    }

    /// Snapshots matching the optional filters, ordered by id.
    pub async fn list(
        &self,
        snapshot_id: Option<&str>,
        source_volume_id: Option<&str>,
    ) -> Result<Vec<SnapshotRecord>> {
        let records = if let Some(raw) = snapshot_id {
            let Ok(id) = raw.parse::<SnapshotId>() else {
                debug!(snapshot_id = %raw, "Malformed snapshot id filter matches nothing");
                return Ok(Vec::new());
            };
            match id.source_path().parse::<VolumePath>() {
                Ok(source) => self.snapshots_of(&source).await?,
                Err(_) => Vec::new(),
            }
        } else if let Some(raw) = source_volume_id {
            match raw.parse::<VolumePath>() {
                Ok(source) => self.snapshots_of(&source).await?,
                Err(_) => Vec::new(),
            }
        } else {
            self.all_records().await?
        };

        let mut records = filter_records(records, snapshot_id, source_volume_id);
        records.sort_by_key(|r| r.id.to_string());
        records.dedup_by(|a, b| a.id == b.id);
        Ok(records)
    }

    /// Every snapshot the backend holds: each live share's own snapshots
    /// and the file snapshots of the images inside it.
    async fn all_records(&self) -> Result<Vec<SnapshotRecord>> {
        let shares = self.api.list_shares().await?;
        let mut records = Vec::new();
        for share in shares.into_iter().filter(|s| !s.is_removed()) {
            records.extend(self.snapshots_of(&VolumePath::share(&share.name)).await?);

            let expression = format!("/{}/*", share.name);
            for snapshot in self.api.list_file_snapshots(&expression).await? {
                let source = match snapshot.path.parse::<VolumePath>() {
                    Ok(source @ VolumePath::File { .. }) => source,
                    _ => {
                        debug!(
                            snapshot = %snapshot.name,
                            path = %snapshot.path,
                            "Skipping file snapshot without a volume path"
                        );
                        continue;
                    }
                };
                let created_at = created_time(snapshot.created);
                records.extend(self.record(snapshot.name, &source.to_string(), created_at));
            }
        }
        Ok(records)
    }

    async fn snapshots_of(&self, source: &VolumePath) -> Result<Vec<SnapshotRecord>> {
        let source_volume_id = source.to_string();
        let names_and_times: Vec<(String, Option<SystemTime>)> = match source {
            VolumePath::Share { name } => self
                .api
                .list_share_snapshots(name)
                .await?
                .into_iter()
                .map(|n| (n, None))
                .collect(),
            VolumePath::File { .. } => self
                .api
                .list_file_snapshots(&source_volume_id)
                .await?
                .into_iter()
                .map(|s| (s.name, created_time(s.created)))
                .collect(),
        };

        Ok(names_and_times
            .into_iter()
            .filter_map(|(name, created_at)| self.record(name, &source_volume_id, created_at))
            .collect())
    }

    fn record(
        &self,
        name: String,
        source_volume_id: &str,
        created_at: Option<SystemTime>,
    ) -> Option<SnapshotRecord> {
        let id = match SnapshotId::new(&name, source_volume_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(snapshot = %name, error = %e, "Skipping snapshot with unusable name");
                return None;
            }
        };
        let cached = self.recent.get(&name).filter(|r| r.id == id);
        Some(SnapshotRecord {
            id,
            source_volume_id: source_volume_id.to_string(),
            size_bytes: cached.as_ref().map(|r| r.size_bytes).unwrap_or(0),
            created_at: created_at.or(cached.and_then(|r| r.created_at)),
        })
    }
}

fn created_time(seconds: i64) -> Option<SystemTime> {
    (seconds > 0).then(|| UNIX_EPOCH + Duration::from_secs(seconds as u64))
}
