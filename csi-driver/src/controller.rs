//! CSI Controller Service Implementation
//!
//! Translates CSI controller RPCs into volume and snapshot lifecycle
//! operations against the storage cluster.

use std::sync::Arc;

use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::csi;
use crate::error::{DriverError, Result};
use crate::metrics::OperationTimer;
use crate::snapshot::{SnapshotManager, SnapshotRecord};
use crate::types::{Backing, SnapshotId, VolumeMode, VolumeParameters};
use crate::volume::{CreateVolumeRequest, CreatedVolume, VolumeReconciler};

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation, deletion and expansion
/// - Capacity reporting
/// - Snapshot creation, deletion and listing
/// - Capability reporting
pub struct ControllerService {
    volumes: Arc<VolumeReconciler>,
    snapshots: Arc<SnapshotManager>,
}

/// Page through `items` using an index token.
///
/// An unparsable or out-of-range token is `Aborted`, as CSI asks for.
fn paginate<T>(items: Vec<T>, max_entries: i32, starting_token: &str) -> Result<(Vec<T>, String)> {
    let total_len = items.len();
    let max_entries = if max_entries > 0 {
        max_entries as usize
    } else {
        total_len
    };

    let start_idx = if starting_token.is_empty() {
        0
    } else {
        starting_token
            .parse::<usize>()
            .ok()
            .filter(|idx| *idx <= total_len)
            .ok_or_else(|| {
                DriverError::Aborted(format!("invalid starting_token '{}'", starting_token))
            })?
    };

    let end_idx = start_idx.saturating_add(max_entries).min(total_len);
    let paginated: Vec<T> = items
        .into_iter()
        .skip(start_idx)
        .take(end_idx - start_idx)
        .collect();

    let next_token = if end_idx < total_len {
        end_idx.to_string()
    } else {
        String::new()
    };

    Ok((paginated, next_token))
}

/// Decide block vs filesystem from the requested capabilities.
fn volume_mode(capabilities: &[csi::VolumeCapability]) -> Result<VolumeMode> {
    use csi::volume_capability::AccessType;

    if capabilities.is_empty() {
        return Err(DriverError::InvalidArgument(
            "volume capabilities are required".into(),
        ));
    }

    let mut block = false;
    let mut mount = false;
    for cap in capabilities {
        match &cap.access_type {
            Some(AccessType::Block(_)) => block = true,
            Some(AccessType::Mount(_)) => mount = true,
            None => {
                return Err(DriverError::InvalidArgument(
                    "volume capability must specify an access type".into(),
                ));
            }
        }
    }

    match (block, mount) {
        (true, true) => Err(DriverError::InvalidArgument(
            "block and mount access cannot be requested together".into(),
        )),
        (true, false) => Ok(VolumeMode::Block),
        _ => Ok(VolumeMode::Filesystem),
    }
}

/// Requested size in bytes, zero when the CO left it open.
fn requested_size(range: Option<&csi::CapacityRange>) -> Result<i64> {
    let Some(range) = range else {
        return Ok(0);
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(DriverError::InvalidArgument(
            "capacity range must not be negative".into(),
        ));
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(DriverError::OutOfRange(format!(
            "required_bytes {} exceeds limit_bytes {}",
            range.required_bytes, range.limit_bytes
        )));
    }
    Ok(if range.required_bytes > 0 {
        range.required_bytes
    } else {
        range.limit_bytes
    })
}

/// Reasons the capabilities cannot be served for a volume with `backing`.
fn unsupported_reasons(capabilities: &[csi::VolumeCapability], backing: Backing) -> Vec<String> {
    use csi::volume_capability::AccessType;
    use csi::volume_capability::access_mode::Mode;

    let mut reasons = Vec::new();
    for cap in capabilities {
        match (&cap.access_type, backing) {
            (None, _) => reasons.push("volume capability must specify access type".to_string()),
            (Some(AccessType::Block(_)), Backing::Share) => {
                reasons.push("block access is not available for share-backed volumes".to_string())
            }
            _ => {}
        }

        let Some(access_mode) = &cap.access_mode else {
            continue;
        };
        match Mode::try_from(access_mode.mode) {
            Ok(mode @ (Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter))
                if backing == Backing::File =>
            {
                // A loop-mounted image cannot be written from several nodes
                reasons.push(format!(
                    "{} is not supported for file-backed volumes",
                    mode.as_str_name()
                ));
            }
            Ok(Mode::Unknown) | Err(_) => {
                reasons.push(format!("Unknown access mode: {}", access_mode.mode))
            }
            Ok(_) => {}
        }
    }
    reasons
}

fn snapshot_to_csi(record: &SnapshotRecord) -> csi::Snapshot {
    csi::Snapshot {
        size_bytes: record.size_bytes,
        snapshot_id: record.id.to_string(),
        source_volume_id: record.source_volume_id.clone(),
        creation_time: record.created_at.map(Timestamp::from),
        ready_to_use: true,
        group_snapshot_id: String::new(),
    }
}

fn volume_to_csi(
    created: &CreatedVolume,
    content_source: Option<csi::VolumeContentSource>,
) -> csi::Volume {
    csi::Volume {
        capacity_bytes: created.capacity,
        volume_id: created.path.to_string(),
        volume_context: created.context.to_map(),
        content_source,
        accessible_topology: vec![],
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

impl ControllerService {
    pub fn new(volumes: Arc<VolumeReconciler>, snapshots: Arc<SnapshotManager>) -> Self {
        Self { volumes, snapshots }
    }

    async fn do_create_volume(&self, req: csi::CreateVolumeRequest) -> Result<csi::CreateVolumeResponse> {
        use csi::volume_content_source::Type as SourceType;

        if req.name.is_empty() {
            return Err(DriverError::InvalidArgument("Volume name is required".into()));
        }
        let mode = volume_mode(&req.volume_capabilities)?;
        let size = requested_size(req.capacity_range.as_ref())?;
        let parameters = VolumeParameters::parse(&req.parameters)?;

        let (backing, _) = parameters.backing_for(mode)?;
        let reasons = unsupported_reasons(&req.volume_capabilities, backing);
        if !reasons.is_empty() {
            return Err(DriverError::InvalidArgument(reasons.join("; ")));
        }

        let source_snapshot = match req.volume_content_source.as_ref().and_then(|s| s.r#type.as_ref()) {
            Some(SourceType::Snapshot(source)) => Some(
                source
                    .snapshot_id
                    .parse::<SnapshotId>()
                    .map_err(|e| DriverError::NotFound(format!("source snapshot: {}", e)))?,
            ),
            Some(SourceType::Volume(_)) => {
                return Err(DriverError::InvalidArgument(
                    "cloning from a volume is not supported".into(),
                ));
            }
            None => None,
        };

        info!(
            name = %req.name,
            size_bytes = size,
            mode = %mode,
            backing = %backing,
            from_snapshot = source_snapshot.is_some(),
            "CreateVolume request"
        );

        let created = self
            .volumes
            .create(&CreateVolumeRequest {
                name: req.name.clone(),
                size,
                mode,
                parameters,
                source_snapshot,
            })
            .await?;

        info!(
            volume_id = %created.path,
            capacity_bytes = created.capacity,
            "Volume created successfully"
        );
        Ok(csi::CreateVolumeResponse {
            volume: Some(volume_to_csi(&created, req.volume_content_source)),
        })
    }

    async fn do_expand_volume(
        &self,
        req: csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(DriverError::InvalidArgument("Volume ID is required".into()));
        }
        let requested = requested_size(req.capacity_range.as_ref())?;
        if requested <= 0 {
            return Err(DriverError::InvalidArgument(
                "a capacity range with a positive size is required".into(),
            ));
        }

        info!(volume_id = %req.volume_id, requested, "ControllerExpandVolume request");
        let expanded = self.volumes.expand(&req.volume_id, requested).await?;
        Ok(csi::ControllerExpandVolumeResponse {
            capacity_bytes: expanded.capacity,
            node_expansion_required: expanded.node_expansion_required,
        })
    }

    async fn do_list_snapshots(&self, req: csi::ListSnapshotsRequest) -> Result<csi::ListSnapshotsResponse> {
        let records = self
            .snapshots
            .list(non_empty(&req.snapshot_id), non_empty(&req.source_volume_id))
            .await?;
        let (page, next_token) = paginate(records, req.max_entries, &req.starting_token)?;

        let entries: Vec<csi::list_snapshots_response::Entry> = page
            .iter()
            .map(|s| csi::list_snapshots_response::Entry {
                snapshot: Some(snapshot_to_csi(s)),
            })
            .collect();

        info!(count = entries.len(), "ListSnapshots completed");
        Ok(csi::ListSnapshotsResponse {
            entries,
            next_token,
        })
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let result = self.do_create_volume(request.into_inner()).await;
        Ok(Response::new(timer.finish(result)?))
    }

    /// Delete a volume. Deleting a missing volume succeeds.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %req.volume_id, "DeleteVolume request");
        timer.finish(self.volumes.delete(&req.volume_id).await)?;
        info!(volume_id = %req.volume_id, "Volume deleted successfully");
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Expand a volume.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("expand_volume");
        let result = self.do_expand_volume(request.into_inner()).await;
        Ok(Response::new(timer.finish(result)?))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::CreateDeleteSnapshot,
            Type::ExpandVolume,
            Type::GetCapacity,
            Type::ListSnapshots,
        ]
        .into_iter()
        .map(|t| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = OperationTimer::new("create_snapshot");
        let req = request.into_inner();

        if req.name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Snapshot name is required"));
        }
        if req.source_volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Source volume ID is required"));
        }

        info!(name = %req.name, source_volume_id = %req.source_volume_id, "CreateSnapshot request");
        let record = timer.finish(
            self.snapshots
                .create(&req.name, &req.source_volume_id)
                .await,
        )?;

        info!(snapshot_id = %record.id, "Snapshot created successfully");
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(snapshot_to_csi(&record)),
        }))
    }

    /// Delete a snapshot. Deleting a missing snapshot succeeds.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = OperationTimer::new("delete_snapshot");
        let req = request.into_inner();

        if req.snapshot_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Snapshot ID is required"));
        }

        info!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");
        timer.finish(self.snapshots.delete(&req.snapshot_id).await)?;
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        info!(volume_id = %req.volume_id, "ValidateVolumeCapabilities request");
        let path = self.volumes.validate(&req.volume_id).await?;

        let reasons = unsupported_reasons(&req.volume_capabilities, path.backing());
        if !reasons.is_empty() {
            let message = reasons.join("; ");
            warn!(volume_id = %req.volume_id, message = %message, "Volume capabilities not supported");
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    /// Publish a volume to a node (not needed, nodes mount over NFS).
    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerPublishVolume is not supported",
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerUnpublishVolume is not supported",
        ))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> std::result::Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        use csi::volume_capability::AccessType;

        let timer = OperationTimer::new("get_capacity");
        let req = request.into_inner();

        let block = req
            .volume_capabilities
            .iter()
            .any(|c| matches!(c.access_type, Some(AccessType::Block(_))));
        let mount = req
            .volume_capabilities
            .iter()
            .any(|c| matches!(c.access_type, Some(AccessType::Mount(_))));

        debug!(parameters = ?req.parameters, block, mount, "GetCapacity request");

        let result = match VolumeParameters::parse(&req.parameters) {
            Ok(params) => self.volumes.capacity(block, mount, &params).await,
            Err(e) => Err(e.into()),
        };
        let available_capacity = timer.finish(result)?;

        info!(available_capacity, "GetCapacity completed");
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity,
            maximum_volume_size: None,
            minimum_volume_size: None,
        }))
    }

    /// List snapshots with optional filtering and pagination.
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        let timer = OperationTimer::new("list_snapshots");
        let req = request.into_inner();

        info!(
            source_volume_id = %req.source_volume_id,
            snapshot_id = %req.snapshot_id,
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListSnapshots request"
        );

        let result = self.do_list_snapshots(req).await;
        Ok(Response::new(timer.finish(result)?))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerGetVolume is not supported",
        ))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerModifyVolume is not supported",
        ))
    }
}
