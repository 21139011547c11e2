//! Volume lifecycle reconciler
//!
//! Converges backend state for the three volume shapes:
//!
//! - share-backed filesystem: one NFS share per volume
//! - file-backed filesystem: an image file in a backing share, formatted
//!   with a local filesystem and loop-mounted on the node
//! - file-backed block: a raw file in a backing share exposed as a loop
//!   device
//!
//! Every mutating operation runs under the volume's lock and is safe to
//! repeat: a retried create finds what the first attempt built, a retried
//! delete finds nothing and succeeds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use storage_api::cache::KEY_FREE_CAPACITY;
use storage_api::{ApiClient, File, ShareRequest};
use tracing::{debug, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::locks::LockRegistry;
use crate::platform::HostOps;
use crate::portal::PortalSelector;
use crate::types::{
    Backing, DEFAULT_FILE_VOLUME_SIZE, SnapshotId, VolumeContext, VolumeMode, VolumeParameters,
    VolumePath, validate_name,
};

/// Extended-info key recording the delete delay chosen at creation.
pub const EXT_DELETE_DELAY: &str = "csi_delete_delay";
/// Extended-info key marking shares created by this driver.
pub const EXT_CREATED_BY: &str = "csi_created_by";
pub const EXT_COMMENT: &str = "comment";

/// Backend error text meaning a delete target is already gone.
const ALREADY_REMOVED_MARKER: &str = "already removed";

/// Filesystems a file-backed volume can be formatted with.
const IMAGE_FS_TYPES: [&str; 3] = ["ext3", "ext4", "xfs"];

/// Reconciler tunables.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub file_visibility_interval: Duration,
    pub file_visibility_timeout: Duration,
    pub default_file_size: i64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: crate::identity::DRIVER_NAME.to_string(),
            file_visibility_interval: Duration::from_secs(5),
            file_visibility_timeout: Duration::from_secs(600),
            default_file_size: DEFAULT_FILE_VOLUME_SIZE,
        }
    }
}

/// A create request after protocol-level validation.
#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub name: String,
    /// Requested bytes; zero when unspecified
    pub size: i64,
    pub mode: VolumeMode,
    pub parameters: VolumeParameters,
    pub source_snapshot: Option<SnapshotId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVolume {
    pub path: VolumePath,
    pub capacity: i64,
    pub context: VolumeContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandedVolume {
    pub capacity: i64,
    pub node_expansion_required: bool,
}

pub struct VolumeReconciler {
    api: Arc<ApiClient>,
    host: Arc<dyn HostOps>,
    portals: Arc<PortalSelector>,
    locks: LockRegistry,
    config: DriverConfig,
}

impl VolumeReconciler {
    pub fn new(
        api: Arc<ApiClient>,
        host: Arc<dyn HostOps>,
        portals: Arc<PortalSelector>,
        locks: LockRegistry,
        config: DriverConfig,
    ) -> Self {
        Self {
            api,
            host,
            portals,
            locks,
            config,
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    #[instrument(skip(self, request), fields(name = %request.name, mode = %request.mode))]
    pub async fn create(&self, request: &CreateVolumeRequest) -> Result<CreatedVolume> {
        let params = &request.parameters;
        let name = params.name_format.apply(&request.name);
        validate_name("volume name", &name)?;

        let (backing, backing_share) = params.backing_for(request.mode)?;
        let mut context = VolumeContext {
            mode: request.mode,
            backing,
            fs_type: params.fs_type.clone(),
            backing_share: backing_share.map(str::to_string),
            fqdn: params.fqdn.clone(),
            client_mount_options: params.client_mount_options.clone(),
        };

        match backing_share {
            None => {
                let path = VolumePath::share(&name);
                let _guard = self.locks.acquire(&path.to_string()).await?;
                let capacity = self.create_share_volume(&name, request).await?;
                Ok(CreatedVolume {
                    path,
                    capacity,
                    context,
                })
            }
            Some(share) => {
                if request.mode == VolumeMode::Filesystem
                    && !IMAGE_FS_TYPES.contains(&params.fs_type.as_str())
                {
                    return Err(DriverError::InvalidArgument(format!(
                        "unsupported fsType '{}' for file-backed volumes, expected one of {:?}",
                        params.fs_type, IMAGE_FS_TYPES
                    )));
                }
                if request.mode == VolumeMode::Block {
                    context.fs_type = String::new();
                }

                let path = VolumePath::file(share, &name);
                let _guard = self.locks.acquire(&path.to_string()).await?;
                let capacity = self.create_file_volume(&path, request).await?;
                Ok(CreatedVolume {
                    path,
                    capacity,
                    context,
                })
            }
        }
    }

    fn share_request(&self, name: &str, size: i64, params: &VolumeParameters) -> ShareRequest {
        let mut request = ShareRequest {
            name: name.to_string(),
            path: format!("/{}", name),
            comment: params.comment.clone(),
            share_size_limit: (size > 0).then_some(size),
            export_options: params.export_options.clone(),
            cache_enabled: params.cache_enabled,
            ..Default::default()
        };
        request
            .extended_info
            .insert(EXT_DELETE_DELAY.to_string(), params.delete_delay.to_string());
        request
            .extended_info
            .insert(EXT_CREATED_BY.to_string(), self.config.driver_name.clone());
        if let Some(comment) = &params.comment {
            request
                .extended_info
                .insert(EXT_COMMENT.to_string(), comment.clone());
        }
        request
    }

    async fn create_share_volume(&self, name: &str, request: &CreateVolumeRequest) -> Result<i64> {
        let params = &request.parameters;

        if let Some(existing) = self.api.get_share(name).await? {
            if existing.is_removed() {
                return Err(DriverError::Aborted(format!(
                    "share {} is being deleted, retry later",
                    name
                )));
            }
            if existing.size() == request.size {
                info!(share = %name, "Share already exists with requested size");
                return Ok(existing.size());
            }
            return Err(DriverError::AlreadyExists(format!(
                "share {} exists with size {}, requested {}",
                name,
                existing.size(),
                request.size
            )));
        }

        self.check_objectives(&params.objectives).await?;

        let share_request = self.share_request(name, request.size, params);
        match &request.source_snapshot {
            Some(snapshot) => {
                let source = snapshot.source_name();
                if self.api.get_share(source).await?.is_none() {
                    return Err(DriverError::NotFound(format!(
                        "source share {} not found",
                        source
                    )));
                }
                let snapshots = self.api.list_share_snapshots(source).await?;
                if !snapshots.iter().any(|s| s == snapshot.name()) {
                    return Err(DriverError::NotFound(format!(
                        "snapshot {} not found on share {}",
                        snapshot.name(),
                        source
                    )));
                }
                self.submit_share_create(&share_request, Some((source, snapshot.name())))
                    .await?;
            }
            None => self.submit_share_create(&share_request, None).await?,
        }

        for objective in &params.objectives {
            if !self.api.set_share_objective(name, objective).await? {
                return Err(DriverError::Internal(format!(
                    "failed to apply objective {} to share {}",
                    objective, name
                )));
            }
        }
        self.apply_tags(&share_request.path, &params.metadata_tags)
            .await;
        self.api.cache().invalidate(KEY_FREE_CAPACITY);

        info!(share = %name, size = request.size, "Created share-backed volume");
        Ok(request.size)
    }

    /// Create or restore a share, treating a concurrent creation of the same
    /// name as success.
    async fn submit_share_create(
        &self,
        request: &ShareRequest,
        restore_from: Option<(&str, &str)>,
    ) -> Result<()> {
        let result = match restore_from {
            Some((source, snapshot)) => {
                self.api
                    .restore_share_snapshot(source, snapshot, request)
                    .await
            }
            None => self.api.create_share(request).await,
        };

        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(DriverError::Internal(format!(
                "creation task for share {} did not complete",
                request.name
            ))),
            Err(e) if e.status() == Some(400) && self.creation_in_progress(&request.name).await => {
                info!(share = %request.name, "Share creation already in progress");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether an active backend task is creating a share called `name`.
    async fn creation_in_progress(&self, name: &str) -> bool {
        let tasks = match self.api.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(share = %name, error = %e, "Failed to list tasks");
                return false;
            }
        };
        tasks.iter().any(|task| {
            let kind: String = task
                .name
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            task.is_active()
                && kind.eq_ignore_ascii_case("sharecreate")
                && task.param_map.get("name").map(String::as_str) == Some(name)
        })
    }

    async fn check_objectives(&self, objectives: &[String]) -> Result<()> {
        if objectives.is_empty() {
            return Ok(());
        }
        let known = self.api.objective_names().await?;
        if let Some(unknown) = objectives.iter().find(|o| !known.contains(o)) {
            return Err(DriverError::InvalidArgument(format!(
                "objective '{}' does not exist on the cluster",
                unknown
            )));
        }
        Ok(())
    }

    /// Metadata tags are best effort; the backend may report success for a
    /// tag it did not store, so failures here are only logged.
    async fn apply_tags(&self, path: &str, tags: &[(String, String)]) {
        for (key, value) in tags {
            match self.api.set_tag(path, key, value).await {
                Ok(true) => debug!(path, key = %key, "Set metadata tag"),
                Ok(false) => warn!(path, key = %key, "Metadata tag task did not complete"),
                Err(e) => warn!(path, key = %key, error = %e, "Failed to set metadata tag"),
            }
        }
    }

    /// Make sure a backing share exists, creating an unlimited one if not.
    async fn ensure_backing_share(&self, name: &str, params: &VolumeParameters) -> Result<()> {
        match self.api.get_share(name).await? {
            Some(share) if share.is_removed() => Err(DriverError::Aborted(format!(
                "backing share {} is being deleted",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                info!(share = %name, "Creating backing share");
                let mut request = self.share_request(name, 0, params);
                request.comment = None;
                request.extended_info.remove(EXT_COMMENT);
                self.submit_share_create(&request, None).await
            }
        }
    }

    async fn create_file_volume(
        &self,
        path: &VolumePath,
        request: &CreateVolumeRequest,
    ) -> Result<i64> {
        let params = &request.parameters;
        let backend_path = path.to_string();

        self.check_objectives(&params.objectives).await?;
        self.ensure_backing_share(path.share_name(), params).await?;

        let backing = self.portals.lock_backing_share(path.share_name()).await?;
        let prepared = match self
            .portals
            .ensure_backing_mount(&backing, params.fqdn.as_deref())
            .await
        {
            Ok(()) => {
                self.prepare_file_volume(path, &backing.file_path(path.name()), request)
                    .await
            }
            Err(e) => Err(e),
        };
        self.portals.release_backing_share(backing).await;
        let known_size = prepared?;

        let file = self.wait_for_file(&backend_path).await?;

        for objective in &params.objectives {
            if !self.api.set_file_objective(&backend_path, objective).await? {
                return Err(DriverError::Internal(format!(
                    "failed to apply objective {} to {}",
                    objective, backend_path
                )));
            }
        }
        self.apply_tags(&backend_path, &params.metadata_tags).await;

        let capacity = known_size.unwrap_or(file.size);
        info!(volume_id = %path, capacity, "Created file-backed volume");
        Ok(capacity)
    }

    /// Put the image in place through the locked backing mount.
    ///
    /// Returns the image size when it is known locally. A restore without a
    /// requested size leaves it to the backend to report.
    async fn prepare_file_volume(
        &self,
        path: &VolumePath,
        local_file: &str,
        request: &CreateVolumeRequest,
    ) -> Result<Option<i64>> {
        let params = &request.parameters;
        let requested = (request.size > 0).then_some(request.size);

        if let Some(existing) = self.host.file_size(local_file).await? {
            let existing = existing as i64;
            return match requested {
                Some(size) if size != existing => Err(DriverError::AlreadyExists(format!(
                    "volume {} exists with size {}, requested {}",
                    path, existing, size
                ))),
                _ => {
                    info!(volume_id = %path, size = existing, "Volume file already exists");
                    Ok(Some(existing))
                }
            };
        }

        let needed = match &request.source_snapshot {
            Some(_) => requested,
            None => Some(requested.unwrap_or(self.config.default_file_size)),
        };
        if let Some(needed) = needed {
            let share = self
                .api
                .get_share(path.share_name())
                .await?
                .ok_or_else(|| {
                    DriverError::NotFound(format!("backing share {} not found", path.share_name()))
                })?;
            if needed > share.available_bytes() {
                return Err(DriverError::OutOfRange(format!(
                    "requested {} bytes but backing share {} has {} available",
                    needed,
                    path.share_name(),
                    share.available_bytes()
                )));
            }
        }

        match &request.source_snapshot {
            Some(snapshot) => {
                let snapshots = self.api.list_file_snapshots(snapshot.source_path()).await?;
                if !snapshots.iter().any(|s| s.name == snapshot.name()) {
                    return Err(DriverError::NotFound(format!(
                        "snapshot {} not found for {}",
                        snapshot.name(),
                        snapshot.source_path()
                    )));
                }
                let backend_path = path.to_string();
                let restored = self
                    .api
                    .restore_file_snapshot(snapshot.source_path(), snapshot.name(), &backend_path)
                    .await?;
                if !restored {
                    return Err(DriverError::Internal(format!(
                        "restore of {} into {} did not complete",
                        snapshot, backend_path
                    )));
                }
                Ok(requested)
            }
            None => {
                let size = requested.unwrap_or(self.config.default_file_size);
                self.host.allocate_file(local_file, size as u64).await?;
                if request.mode == VolumeMode::Filesystem
                    && let Err(e) = self.format_file(local_file, &params.fs_type).await
                {
                    // A half-built image would read as an existing volume on retry
                    if let Err(cleanup) = self.host.remove_file(local_file).await {
                        warn!(file = %local_file, error = %cleanup, "Failed to remove unformatted image");
                    }
                    return Err(e);
                }
                Ok(Some(size))
            }
        }
    }

    async fn format_file(&self, file: &str, fs_type: &str) -> Result<()> {
        let device = self.host.attach_loop_device(file).await?;
        let formatted = self.host.format_device(&device, fs_type).await;
        if let Err(e) = self.host.detach_loop_device(&device).await {
            warn!(device = %device, error = %e, "Failed to detach loop device after format");
        }
        formatted.map_err(DriverError::from)
    }

    /// Wait until the backend metadata service sees a freshly written file.
    async fn wait_for_file(&self, backend_path: &str) -> Result<File> {
        let started = Instant::now();
        loop {
            if let Some(file) = self.api.get_file(backend_path).await? {
                return Ok(file);
            }
            if started.elapsed() >= self.config.file_visibility_timeout {
                return Err(DriverError::Internal(format!(
                    "{} not visible to the backend after {:?}",
                    backend_path, self.config.file_visibility_timeout
                )));
            }
            debug!(path = %backend_path, "Waiting for file to become visible");
            tokio::time::sleep(self.config.file_visibility_interval).await;
        }
    }

    // ========================================================================
    // Delete
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn delete(&self, volume_id: &str) -> Result<()> {
        let path: VolumePath = match volume_id.parse() {
            Ok(path) => path,
            Err(e) => {
                warn!(volume_id, error = %e, "Ignoring delete of unrecognized volume id");
                return Ok(());
            }
        };

        let _guard = self.locks.acquire(&path.to_string()).await?;
        match path.backing() {
            Backing::Share => self.delete_share_volume(path.name()).await,
            Backing::File => self.delete_file_volume(&path).await,
        }
    }

    async fn delete_share_volume(&self, name: &str) -> Result<()> {
        let Some(share) = self.api.get_share(name).await? else {
            info!(share = %name, "Share already deleted");
            return Ok(());
        };
        if share.is_removed() {
            info!(share = %name, "Share already being removed");
            return Ok(());
        }

        let snapshots = self.api.list_share_snapshots(name).await?;
        if !snapshots.is_empty() {
            return Err(DriverError::FailedPrecondition(format!(
                "share {} still has {} snapshot(s)",
                name,
                snapshots.len()
            )));
        }

        let delete_delay = match share.extended_info.get(EXT_DELETE_DELAY) {
            None => -1,
            Some(raw) => raw.parse::<i64>().unwrap_or_else(|_| {
                warn!(share = %name, value = %raw, "Unparsable delete delay, using cluster default");
                -1
            }),
        };

        match self.api.delete_share(name, delete_delay).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(DriverError::Internal(format!(
                    "delete task for share {} did not complete",
                    name
                )));
            }
            // Backend quirk: deleting a share mid-removal answers with an error
            // whose text says it is already removed.
            Err(e) if e.body().to_lowercase().contains(ALREADY_REMOVED_MARKER) => {
                info!(share = %name, "Share was already removed");
            }
            Err(e) => return Err(e.into()),
        }

        self.api.cache().invalidate(KEY_FREE_CAPACITY);
        info!(share = %name, delete_delay, "Deleted share-backed volume");
        Ok(())
    }

    async fn delete_file_volume(&self, path: &VolumePath) -> Result<()> {
        let backend_path = path.to_string();
        if self.api.get_file(&backend_path).await?.is_none() {
            info!(volume_id = %path, "Volume file already deleted");
            return Ok(());
        }

        let snapshots = self.api.list_file_snapshots(&backend_path).await?;
        if !snapshots.is_empty() {
            return Err(DriverError::FailedPrecondition(format!(
                "volume {} still has {} snapshot(s)",
                path,
                snapshots.len()
            )));
        }

        let backing = self.portals.lock_backing_share(path.share_name()).await?;
        let removed = match self.portals.ensure_backing_mount(&backing, None).await {
            Ok(()) => self
                .host
                .remove_file(&backing.file_path(path.name()))
                .await
                .map_err(DriverError::from),
            Err(e) => Err(e),
        };
        self.portals.release_backing_share(backing).await;
        removed?;

        info!(volume_id = %path, "Deleted file-backed volume");
        Ok(())
    }

    // ========================================================================
    // Expand
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn expand(&self, volume_id: &str, requested: i64) -> Result<ExpandedVolume> {
        let path: VolumePath = volume_id.parse()?;
        let _guard = self.locks.acquire(&path.to_string()).await?;

        match path.backing() {
            Backing::Share => self.expand_share_volume(path.name(), requested).await,
            Backing::File => self.expand_file_volume(&path, requested).await,
        }
    }

    async fn expand_share_volume(&self, name: &str, requested: i64) -> Result<ExpandedVolume> {
        let share = self
            .api
            .get_share(name)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("share {} not found", name)))?;

        let current = share.size();
        if current == 0 {
            debug!(share = %name, "Share has no size limit, nothing to expand");
            return Ok(ExpandedVolume {
                capacity: requested,
                node_expansion_required: false,
            });
        }
        if requested <= current {
            debug!(share = %name, current, requested, "Share already large enough");
            return Ok(ExpandedVolume {
                capacity: current,
                node_expansion_required: false,
            });
        }

        let request = ShareRequest {
            name: name.to_string(),
            path: if share.path.is_empty() {
                format!("/{}", name)
            } else {
                share.path.clone()
            },
            share_size_limit: Some(requested),
            ..Default::default()
        };
        if !self.api.update_share(&request).await? {
            return Err(DriverError::Internal(format!(
                "resize task for share {} did not complete",
                name
            )));
        }
        self.api.cache().invalidate(KEY_FREE_CAPACITY);

        info!(share = %name, from = current, to = requested, "Expanded share-backed volume");
        Ok(ExpandedVolume {
            capacity: requested,
            node_expansion_required: false,
        })
    }

    async fn expand_file_volume(&self, path: &VolumePath, requested: i64) -> Result<ExpandedVolume> {
        let backing = self.portals.lock_backing_share(path.share_name()).await?;
        let result = match self.portals.ensure_backing_mount(&backing, None).await {
            Ok(()) => {
                self.grow_file(path, &backing.file_path(path.name()), requested)
                    .await
            }
            Err(e) => Err(e),
        };
        self.portals.release_backing_share(backing).await;
        result
    }

    async fn grow_file(
        &self,
        path: &VolumePath,
        local_file: &str,
        requested: i64,
    ) -> Result<ExpandedVolume> {
        let current = self
            .host
            .file_size(local_file)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("volume {} not found", path)))?
            as i64;

        if requested <= current {
            debug!(volume_id = %path, current, requested, "Volume already large enough");
            return Ok(ExpandedVolume {
                capacity: current,
                node_expansion_required: false,
            });
        }

        let share = self
            .api
            .get_share(path.share_name())
            .await?
            .ok_or_else(|| {
                DriverError::NotFound(format!("backing share {} not found", path.share_name()))
            })?;
        let growth = requested - current;
        if growth > share.available_bytes() {
            return Err(DriverError::OutOfRange(format!(
                "growing {} by {} bytes exceeds the {} available on {}",
                path,
                growth,
                share.available_bytes(),
                path.share_name()
            )));
        }

        self.host.allocate_file(local_file, requested as u64).await?;
        info!(volume_id = %path, from = current, to = requested, "Expanded file-backed volume");
        Ok(ExpandedVolume {
            capacity: requested,
            node_expansion_required: true,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Confirm a volume exists.
    pub async fn validate(&self, volume_id: &str) -> Result<VolumePath> {
        let path: VolumePath = volume_id
            .parse()
            .map_err(|_| DriverError::NotFound(format!("volume {} not found", volume_id)))?;

        let exists = match path.backing() {
            Backing::Share => self
                .api
                .get_share(path.name())
                .await?
                .is_some_and(|s| !s.is_removed()),
            Backing::File => self.api.get_file(&path.to_string()).await?.is_some(),
        };
        if !exists {
            return Err(DriverError::NotFound(format!("volume {} not found", volume_id)));
        }
        Ok(path)
    }

    /// Bytes available for new volumes of the given shape.
    pub async fn capacity(
        &self,
        block: bool,
        mount: bool,
        params: &VolumeParameters,
    ) -> Result<i64> {
        if block && mount {
            return Ok(0);
        }
        let mode = if block {
            VolumeMode::Block
        } else {
            VolumeMode::Filesystem
        };

        match params.backing_for(mode) {
            Ok((Backing::File, Some(share))) => Ok(self
                .api
                .get_share(share)
                .await?
                .map(|s| s.available_bytes())
                .unwrap_or(0)),
            Ok(_) => Ok(self.api.free_capacity().await? as i64),
            Err(e) => {
                debug!(error = %e, "No backing share configured, reporting no capacity");
                Ok(0)
            }
        }
    }
}
