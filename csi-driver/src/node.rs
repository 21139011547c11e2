//! CSI Node Service Implementation
//!
//! Share-backed volumes are NFS-mounted straight onto the target path from
//! the best data portal. File-backed volumes need their backing share
//! mounted on the node (at stage time); publish then attaches the image to
//! a loop device and either mounts it or exposes the device node.
//!
//! Every step that touches a backing share, its mount or the loop devices
//! of its images runs with the share locked. One image may be published to
//! several targets on a node; its loop device stays attached until the last
//! of them is unpublished.
//!
//! All host interaction goes through [`HostOps`].

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::csi;
use crate::error::{DriverError, Result};
use crate::metrics::OperationTimer;
use crate::platform::{self, HostOps, PathType};
use crate::portal::PortalSelector;
use crate::types::{Backing, VolumeContext, VolumeMode, VolumePath};

/// Topology segment key identifying the node a volume is reachable from.
pub const TOPOLOGY_KEY: &str = "topology.csi-nfs-portal/node";

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (mount the backing share of file-backed volumes)
/// - Volume unstaging (release the backing share once nothing uses it)
/// - Volume publishing (NFS mount, or loop device plus mount/bind)
/// - Volume unpublishing, expansion and usage statistics
/// - Node capability reporting
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    portals: Arc<PortalSelector>,
    host: Arc<dyn HostOps>,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(DriverError::InvalidArgument(format!("{} is required", what)));
    }
    Ok(())
}

/// Validate a CO-supplied path before it reaches a command line.
fn checked_path(path: &str, what: &str) -> Result<()> {
    require(path, what)?;
    platform::validate_path(path).map_err(|e| DriverError::InvalidArgument(e.to_string()))
}

fn parse_volume_id(volume_id: &str) -> Result<VolumePath> {
    require(volume_id, "Volume ID")?;
    volume_id
        .parse()
        .map_err(|e| DriverError::NotFound(format!("volume {}: {}", volume_id, e)))
}

/// Volume context, falling back to what the volume id implies when the
/// CO sent none (e.g. statically provisioned volumes).
fn volume_context(path: &VolumePath, map: &HashMap<String, String>) -> Result<VolumeContext> {
    if map.is_empty() {
        return Ok(VolumeContext {
            backing: path.backing(),
            backing_share: match path {
                VolumePath::File { share, .. } => Some(share.clone()),
                VolumePath::Share { .. } => None,
            },
            ..VolumeContext::default()
        });
    }
    Ok(VolumeContext::from_map(map)?)
}

/// Mount flags requested through the volume capability.
fn capability_mount_flags(capability: Option<&csi::VolumeCapability>) -> Vec<String> {
    use csi::volume_capability::AccessType;
    match capability.and_then(|c| c.access_type.as_ref()) {
        Some(AccessType::Mount(m)) => m.mount_flags.clone(),
        _ => Vec::new(),
    }
}

fn is_block_capability(capability: Option<&csi::VolumeCapability>) -> bool {
    use csi::volume_capability::AccessType;
    matches!(
        capability.and_then(|c| c.access_type.as_ref()),
        Some(AccessType::Block(_))
    )
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl NodeService {
    /// Create a new NodeService with the specified node ID.
    pub fn new(node_id: String, portals: Arc<PortalSelector>, host: Arc<dyn HostOps>) -> Self {
        Self {
            node_id,
            portals,
            host,
        }
    }

    fn backing_share_of<'a>(path: &'a VolumePath, context: &'a VolumeContext) -> &'a str {
        context
            .backing_share
            .as_deref()
            .unwrap_or_else(|| path.share_name())
    }

    async fn loop_devices_for(&self, file: &str) -> Result<Vec<String>> {
        Ok(self
            .host
            .list_loop_devices()
            .await?
            .into_iter()
            .filter(|l| l.backing_file == file)
            .map(|l| l.device)
            .collect())
    }

    async fn do_stage(&self, req: csi::NodeStageVolumeRequest) -> Result<()> {
        let path = parse_volume_id(&req.volume_id)?;
        checked_path(&req.staging_target_path, "Staging target path")?;
        let context = volume_context(&path, &req.volume_context)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            backing = %context.backing,
            "NodeStageVolume request"
        );

        if context.backing == Backing::Share {
            debug!(volume_id = %req.volume_id, "Share-backed volume needs no staging");
            return Ok(());
        }

        let share = self
            .portals
            .lock_backing_share(Self::backing_share_of(&path, &context))
            .await?;
        self.portals
            .ensure_backing_mount(&share, context.fqdn.as_deref())
            .await?;

        info!(
            volume_id = %req.volume_id,
            mount_point = %share.mount_point(),
            "Volume staged successfully"
        );
        Ok(())
    }

    async fn do_unstage(&self, req: csi::NodeUnstageVolumeRequest) -> Result<()> {
        require(&req.volume_id, "Volume ID")?;
        checked_path(&req.staging_target_path, "Staging target path")?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        // An unparsable id was never staged by this driver
        let Ok(VolumePath::File { share, .. }) = req.volume_id.parse::<VolumePath>() else {
            return Ok(());
        };

        let share = self.portals.lock_backing_share(&share).await?;
        self.portals.unmount_if_unused(&share).await?;

        info!(volume_id = %req.volume_id, "Volume unstaged successfully");
        Ok(())
    }

    async fn do_publish(&self, req: csi::NodePublishVolumeRequest) -> Result<()> {
        let path = parse_volume_id(&req.volume_id)?;
        checked_path(&req.target_path, "Target path")?;
        if req.volume_capability.is_none() {
            return Err(DriverError::InvalidArgument(
                "Volume capability is required".into(),
            ));
        }
        let context = volume_context(&path, &req.volume_context)?;
        let capability = req.volume_capability.as_ref();

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            readonly = req.readonly,
            backing = %context.backing,
            "NodePublishVolume request"
        );

        if self.host.is_mounted(&req.target_path).await? {
            info!(target_path = %req.target_path, "Volume already published");
            return Ok(());
        }

        let mut options = context.client_mount_options.clone();
        options.extend(capability_mount_flags(capability));
        if req.readonly {
            options.push("ro".to_string());
        }

        match (&path, context.backing) {
            (VolumePath::Share { .. }, _) | (_, Backing::Share) => {
                if is_block_capability(capability) {
                    return Err(DriverError::InvalidArgument(
                        "share-backed volumes cannot be published as block devices".into(),
                    ));
                }
                let candidate = self
                    .portals
                    .mount_share(
                        &path.to_string(),
                        &req.target_path,
                        context.fqdn.as_deref(),
                        &options,
                    )
                    .await?;
                info!(
                    volume_id = %req.volume_id,
                    address = %candidate.address,
                    "Volume published successfully"
                );
            }
            (VolumePath::File { name, .. }, Backing::File) => {
                let share = self
                    .portals
                    .lock_backing_share(Self::backing_share_of(&path, &context))
                    .await?;
                self.portals
                    .ensure_backing_mount(&share, context.fqdn.as_deref())
                    .await?;
                let image = share.file_path(name);

                let existing = self.loop_devices_for(&image).await?;
                let (device, attached) = match existing.into_iter().next() {
                    Some(device) => (device, false),
                    None => (self.host.attach_loop_device(&image).await?, true),
                };

                let block = is_block_capability(capability) || context.mode == VolumeMode::Block;
                let published = if block {
                    self.host
                        .bind_mount(&device, &req.target_path, req.readonly)
                        .await
                } else {
                    self.host
                        .mount(&device, &req.target_path, &context.fs_type, &options)
                        .await
                };

                if let Err(e) = published {
                    if attached
                        && let Err(detach_err) = self.host.detach_loop_device(&device).await
                    {
                        warn!(device = %device, error = %detach_err, "Failed to detach loop device");
                    }
                    return Err(e.into());
                }

                info!(
                    volume_id = %req.volume_id,
                    device = %device,
                    block,
                    "Volume published successfully"
                );
            }
        }
        Ok(())
    }

    async fn do_unpublish(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<()> {
        require(&req.volume_id, "Volume ID")?;
        checked_path(&req.target_path, "Target path")?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        self.host.unmount(&req.target_path).await?;

        if let Ok(VolumePath::File { share, name }) = req.volume_id.parse::<VolumePath>() {
            let share = self.portals.lock_backing_share(&share).await?;
            let image = share.file_path(&name);
            for device in self.loop_devices_for(&image).await? {
                let users = self.host.device_mounts(&device).await?;
                if users.is_empty() {
                    self.host.detach_loop_device(&device).await?;
                    debug!(device = %device, image = %image, "Detached loop device");
                } else {
                    info!(
                        device = %device,
                        targets = ?users,
                        "Loop device still published elsewhere, leaving it attached"
                    );
                }
            }
            self.portals.release_backing_share(share).await;
        }

        if let Err(e) = self.host.cleanup_mount_point(&req.target_path).await {
            warn!(error = %e, target_path = %req.target_path, "Could not remove target path");
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "Volume unpublished successfully"
        );
        Ok(())
    }

    async fn do_expand(&self, req: csi::NodeExpandVolumeRequest) -> Result<i64> {
        let path = parse_volume_id(&req.volume_id)?;
        checked_path(&req.volume_path, "Volume path")?;

        info!(
            volume_id = %req.volume_id,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );

        let VolumePath::File { share, name } = &path else {
            // NFS clients see share quota changes without help
            let stats = self.host.filesystem_stats(&req.volume_path).await?;
            return Ok(to_i64(stats.total_bytes));
        };

        let share = self.portals.lock_backing_share(share).await?;
        let image = share.file_path(name);
        let device = self
            .loop_devices_for(&image)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DriverError::FailedPrecondition(format!(
                    "volume {} is not attached on this node",
                    req.volume_id
                ))
            })?;

        self.host.refresh_loop_device(&device).await?;

        let block = is_block_capability(req.volume_capability.as_ref())
            || self.host.path_type(&req.volume_path).await? != PathType::Directory;
        if !block {
            self.host.grow_filesystem(&device, &req.volume_path).await?;
        }

        let capacity = to_i64(self.host.block_device_size(&device).await?);
        info!(
            volume_id = %req.volume_id,
            capacity_bytes = capacity,
            "Volume expansion completed"
        );
        Ok(capacity)
    }

    async fn do_stats(&self, req: csi::NodeGetVolumeStatsRequest) -> Result<Vec<csi::VolumeUsage>> {
        use csi::volume_usage::Unit;

        require(&req.volume_id, "Volume ID")?;
        checked_path(&req.volume_path, "Volume path")?;

        match self.host.path_type(&req.volume_path).await? {
            PathType::Missing => Err(DriverError::NotFound(format!(
                "volume path {} does not exist",
                req.volume_path
            ))),
            PathType::Directory => {
                let stats = self.host.filesystem_stats(&req.volume_path).await?;
                Ok(vec![
                    csi::VolumeUsage {
                        available: to_i64(stats.available_bytes),
                        total: to_i64(stats.total_bytes),
                        used: to_i64(stats.used_bytes),
                        unit: Unit::Bytes as i32,
                    },
                    csi::VolumeUsage {
                        available: to_i64(stats.free_inodes),
                        total: to_i64(stats.total_inodes),
                        used: to_i64(stats.used_inodes),
                        unit: Unit::Inodes as i32,
                    },
                ])
            }
            PathType::Other => {
                let total = to_i64(self.host.block_device_size(&req.volume_path).await?);
                Ok(vec![csi::VolumeUsage {
                    available: 0,
                    total,
                    used: 0,
                    unit: Unit::Bytes as i32,
                }])
            }
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume. Only file-backed volumes have work to do here.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        timer.finish(self.do_stage(request.into_inner()).await)?;
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    /// Unstage a volume from the staging path.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        timer.finish(self.do_unstage(request.into_inner()).await)?;
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    /// Publish a volume to a target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        timer.finish(self.do_publish(request.into_inner()).await)?;
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        timer.finish(self.do_unpublish(request.into_inner()).await)?;
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: Some(csi::Topology {
                segments: HashMap::from([(TOPOLOGY_KEY.to_string(), self.node_id.clone())]),
            }),
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [
            Type::StageUnstageVolume,
            Type::GetVolumeStats,
            Type::ExpandVolume,
        ]
        .into_iter()
        .map(|t| csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Expand a volume on this node.
    /// Share quotas apply on the server; loop-backed images are re-read and
    /// their filesystem grown.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_expand_volume");
        let capacity_bytes = timer.finish(self.do_expand(request.into_inner()).await)?;
        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let usage = self.do_stats(request.into_inner()).await?;
        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage,
            volume_condition: None,
        }))
    }
}
