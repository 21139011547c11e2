//! Integration tests for csi-driver
//!
//! These tests drive the reconcilers and CSI services against a mockito
//! server standing in for the management API and an in-memory host that
//! records mounts, loop devices and files instead of touching the machine.
//! Tests focus on:
//! - Idempotent create and delete
//! - Data-portal ordering and NFS version fallback
//! - Backing-share reference handling
//! - Expansion limits and lock contention
//! - Backing-share serialization and loop device sharing
//! - Snapshot identity and idempotency
//! - Node publish/unpublish flows

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockito::{Matcher, Server, ServerGuard};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tonic::{Code, Request};

use csi_driver::csi;
use csi_driver::csi::controller_server::Controller;
use csi_driver::csi::identity_server::Identity;
use csi_driver::csi::node_server::Node;
use csi_driver::platform::{
    FsStats, HostOps, LoopDevice, PathType, PlatformError, PlatformResult,
};
use csi_driver::portal::CandidateKind;
use csi_driver::types::{
    Backing, SnapshotId, VolumeContext, VolumeMode, VolumeParameters, VolumePath,
};
use csi_driver::volume::CreateVolumeRequest;
use csi_driver::{
    ControllerService, DRIVER_NAME, DriverConfig, DriverError, IdentityService, Locks,
    MountConfig, NodeService, PortalSelector, SnapshotManager, VolumeReconciler,
};
use storage_api::{ApiClient, ApiConfig, PollPolicy, TtlCache};

const GIB: i64 = 1024 * 1024 * 1024;
const API: &str = "/mgmt/v1.2/rest";

// ============================================================================
// In-memory host
// ============================================================================

#[derive(Debug, Clone)]
struct MountCall {
    source: String,
    target: String,
    fs_type: String,
    options: Vec<String>,
}

#[derive(Default)]
struct HostState {
    /// target -> source
    mounts: HashMap<String, String>,
    mount_calls: Vec<MountCall>,
    loops: Vec<LoopDevice>,
    next_loop: u32,
    files: HashMap<String, u64>,
    /// host -> exported paths
    exports: HashMap<String, Vec<String>>,
    /// mounts whose options contain one of these fail
    failing_options: Vec<String>,
    /// mounts from these sources fail
    failing_sources: Vec<String>,
    fail_format: bool,
    /// allocation of this path waits for the notify
    allocation_gate: Option<(String, Arc<Notify>)>,
    gate_reached: bool,
    /// allocated path and whether its parent was mounted at the time
    allocations: Vec<(String, bool)>,
}

#[derive(Default)]
struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    fn export(&self, host: &str, path: &str) {
        self.state
            .lock()
            .exports
            .entry(host.to_string())
            .or_default()
            .push(path.to_string());
    }

    fn fail_mounts_with(&self, option: &str) {
        self.state.lock().failing_options.push(option.to_string());
    }

    fn fail_mounts_from(&self, source: &str) {
        self.state.lock().failing_sources.push(source.to_string());
    }

    fn fail_format(&self) {
        self.state.lock().fail_format = true;
    }

    /// Hold the allocation of `path` until the returned notify fires.
    fn gate_allocation(&self, path: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state.lock().allocation_gate = Some((path.to_string(), notify.clone()));
        notify
    }

    fn gate_reached(&self) -> bool {
        self.state.lock().gate_reached
    }

    fn allocations(&self) -> Vec<(String, bool)> {
        self.state.lock().allocations.clone()
    }

    fn set_mounted(&self, target: &str, source: &str) {
        self.state
            .lock()
            .mounts
            .insert(target.to_string(), source.to_string());
    }

    fn add_loop(&self, device: &str, file: &str) {
        self.state.lock().loops.push(LoopDevice {
            device: device.to_string(),
            backing_file: file.to_string(),
        });
    }

    fn add_file(&self, path: &str, size: u64) {
        self.state.lock().files.insert(path.to_string(), size);
    }

    fn mount_source(&self, target: &str) -> Option<String> {
        self.state.lock().mounts.get(target).cloned()
    }

    fn mount_calls(&self) -> Vec<MountCall> {
        self.state.lock().mount_calls.clone()
    }

    fn loops(&self) -> Vec<LoopDevice> {
        self.state.lock().loops.clone()
    }

    fn file(&self, path: &str) -> Option<u64> {
        self.state.lock().files.get(path).copied()
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> PlatformResult<()> {
        let mut state = self.state.lock();
        state.mount_calls.push(MountCall {
            source: source.to_string(),
            target: target.to_string(),
            fs_type: fs_type.to_string(),
            options: options.to_vec(),
        });
        if options.iter().any(|o| state.failing_options.contains(o))
            || state.failing_sources.iter().any(|s| s == source)
        {
            return Err(PlatformError::CommandFailed {
                command: "mount".to_string(),
                stderr: "mount.nfs: Protocol not supported".to_string(),
            });
        }
        state.mounts.insert(target.to_string(), source.to_string());
        Ok(())
    }

    async fn bind_mount(&self, source: &str, target: &str, _read_only: bool) -> PlatformResult<()> {
        self.set_mounted(target, source);
        Ok(())
    }

    async fn unmount(&self, target: &str) -> PlatformResult<()> {
        self.state.lock().mounts.remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &str) -> PlatformResult<bool> {
        Ok(self.state.lock().mounts.contains_key(target))
    }

    async fn device_mounts(&self, device: &str) -> PlatformResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .mounts
            .iter()
            .filter(|(_, source)| source.as_str() == device)
            .map(|(target, _)| target.clone())
            .collect())
    }

    async fn attach_loop_device(&self, file: &str) -> PlatformResult<String> {
        let mut state = self.state.lock();
        let device = format!("/dev/loop{}", state.next_loop);
        state.next_loop += 1;
        state.loops.push(LoopDevice {
            device: device.clone(),
            backing_file: file.to_string(),
        });
        Ok(device)
    }

    async fn detach_loop_device(&self, device: &str) -> PlatformResult<()> {
        self.state.lock().loops.retain(|l| l.device != device);
        Ok(())
    }

    async fn refresh_loop_device(&self, _device: &str) -> PlatformResult<()> {
        Ok(())
    }

    async fn list_loop_devices(&self) -> PlatformResult<Vec<LoopDevice>> {
        Ok(self.loops())
    }

    async fn format_device(&self, device: &str, fs_type: &str) -> PlatformResult<()> {
        if self.state.lock().fail_format {
            return Err(PlatformError::CommandFailed {
                command: format!("mkfs.{} {}", fs_type, device),
                stderr: "mkfs: device is busy".to_string(),
            });
        }
        Ok(())
    }

    async fn grow_filesystem(&self, _device: &str, _mount_path: &str) -> PlatformResult<()> {
        Ok(())
    }

    async fn allocate_file(&self, path: &str, size: u64) -> PlatformResult<()> {
        let gate = {
            let mut state = self.state.lock();
            match &state.allocation_gate {
                Some((gated, notify)) if gated == path => {
                    let notify = notify.clone();
                    state.gate_reached = true;
                    Some(notify)
                }
                _ => None,
            }
        };
        if let Some(notify) = gate {
            notify.notified().await;
        }

        let mut state = self.state.lock();
        let parent_mounted = state
            .mounts
            .keys()
            .any(|m| path.starts_with(&format!("{}/", m)));
        state.allocations.push((path.to_string(), parent_mounted));
        state.files.insert(path.to_string(), size);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> PlatformResult<()> {
        self.state.lock().files.remove(path);
        Ok(())
    }

    async fn file_size(&self, path: &str) -> PlatformResult<Option<u64>> {
        Ok(self.file(path))
    }

    async fn list_nfs_exports(&self, host: &str) -> PlatformResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .exports
            .get(host)
            .cloned()
            .unwrap_or_default())
    }

    async fn nfs_service_alive(&self, _host: &str) -> bool {
        true
    }

    async fn resolve_host(&self, _host: &str) -> PlatformResult<Vec<IpAddr>> {
        Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }

    async fn filesystem_stats(&self, _path: &str) -> PlatformResult<FsStats> {
        Ok(FsStats {
            total_bytes: GIB as u64,
            used_bytes: 1024,
            available_bytes: GIB as u64 - 1024,
            total_inodes: 1000,
            used_inodes: 10,
            free_inodes: 990,
        })
    }

    async fn block_device_size(&self, device: &str) -> PlatformResult<u64> {
        let state = self.state.lock();
        Ok(state
            .loops
            .iter()
            .find(|l| l.device == device)
            .and_then(|l| state.files.get(&l.backing_file).copied())
            .unwrap_or(0))
    }

    async fn path_type(&self, path: &str) -> PlatformResult<PathType> {
        Ok(if self.state.lock().mounts.contains_key(path) {
            PathType::Directory
        } else {
            PathType::Missing
        })
    }

    async fn cleanup_mount_point(&self, _path: &str) -> PlatformResult<()> {
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

struct Fixture {
    api: Arc<ApiClient>,
    host: Arc<FakeHost>,
    portals: Arc<PortalSelector>,
    locks: Locks,
}

impl Fixture {
    fn new(server: &ServerGuard) -> Self {
        Self::with_lock_timeout(server, Duration::from_secs(5))
    }

    fn with_lock_timeout(server: &ServerGuard, lock_timeout: Duration) -> Self {
        let mut config = ApiConfig::new(server.url(), "admin", "secret");
        config.request_timeout = Duration::from_secs(5);
        config.poll = PollPolicy {
            initial: Duration::from_millis(5),
            factor: 1.5,
            max_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
        };
        let api = Arc::new(
            ApiClient::new(config, Arc::new(TtlCache::new(Duration::from_secs(300), 16))).unwrap(),
        );

        let host = Arc::new(FakeHost::default());
        let dyn_host: Arc<dyn HostOps> = host.clone();
        let mount_config = MountConfig {
            node_id: "node-a".to_string(),
            backing_mount_dir: "/backing".to_string(),
            ..MountConfig::default()
        };
        let locks = Locks::new(lock_timeout);
        let portals = Arc::new(PortalSelector::new(
            api.clone(),
            dyn_host,
            mount_config,
            locks.backing_shares.clone(),
        ));

        Self {
            api,
            host,
            portals,
            locks,
        }
    }

    fn volumes(&self) -> VolumeReconciler {
        VolumeReconciler::new(
            self.api.clone(),
            self.host.clone(),
            self.portals.clone(),
            self.locks.volumes.clone(),
            DriverConfig {
                file_visibility_interval: Duration::from_millis(10),
                file_visibility_timeout: Duration::from_secs(1),
                ..DriverConfig::default()
            },
        )
    }

    fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(self.api.clone(), self.locks.snapshots.clone())
    }

    fn node(&self) -> NodeService {
        NodeService::new("node-a".to_string(), self.portals.clone(), self.host.clone())
    }
}

fn share_json(name: &str, size: i64, available: i64, delete_delay: Option<&str>) -> String {
    let mut share = json!({
        "name": name,
        "path": format!("/{}", name),
        "shareSizeLimit": size,
        "space": {"used": 0, "total": size, "available": available},
    });
    if let Some(delay) = delete_delay {
        share["extendedInfo"] = json!({ "csi_delete_delay": delay });
    }
    share.to_string()
}

fn portals_json() -> String {
    let portal = |node: &str, address: &str| {
        json!({
            "operState": "UP",
            "adminState": "UP",
            "dataPortalType": "NFS_V4_2",
            "node": {"name": node, "mgmtIpAddress": {"address": address}},
        })
    };
    json!([portal("node-b", "10.0.0.2"), portal("node-a", "10.0.0.1")]).to_string()
}

fn share_volume_request(name: &str, size: i64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_string(),
        size,
        mode: VolumeMode::Filesystem,
        parameters: VolumeParameters::default(),
        source_snapshot: None,
    }
}

async fn mock_portals(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("GET", format!("{}/data-portals/", API).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(portals_json())
        .create_async()
        .await
}

fn file_volume_request(name: &str, share: &str, size: i64, mode: VolumeMode) -> CreateVolumeRequest {
    let params = match mode {
        VolumeMode::Block => HashMap::from([("blockBackingShareName".to_string(), share.to_string())]),
        VolumeMode::Filesystem => HashMap::from([
            ("mountBackingShareName".to_string(), share.to_string()),
            ("fsType".to_string(), "ext4".to_string()),
        ]),
    };
    CreateVolumeRequest {
        name: name.to_string(),
        size,
        mode,
        parameters: VolumeParameters::parse(&params).unwrap(),
        source_snapshot: None,
    }
}

async fn mock_share(server: &mut ServerGuard, name: &str, size: i64, available: i64) -> mockito::Mock {
    server
        .mock("GET", format!("{}/shares/{}", API, name).as_str())
        .with_status(200)
        .with_body(share_json(name, size, available, None))
        .create_async()
        .await
}

/// Backend metadata for a file, as seen once it is visible.
async fn mock_file(server: &mut ServerGuard, path: &str, size: i64) -> mockito::Mock {
    let name = path.rsplit('/').next().unwrap_or_default();
    server
        .mock("GET", format!("{}/files", API).as_str())
        .match_query(Matcher::UrlEncoded("path".into(), path.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"name": name, "path": path, "size": size}).to_string())
        .create_async()
        .await
}

// ============================================================================
// Volume lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_share_volume_is_idempotent() {
    let mut server = Server::new_async().await;
    let _share = server
        .mock("GET", format!("{}/shares/pvc-1", API).as_str())
        .with_status(200)
        .with_body(share_json("pvc-1", GIB, GIB, None))
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let volumes = fixture.volumes();

    let created = volumes
        .create(&share_volume_request("pvc-1", GIB))
        .await
        .unwrap();
    assert_eq!(created.path, VolumePath::share("pvc-1"));
    assert_eq!(created.path.to_string(), "/pvc-1");
    assert_eq!(created.capacity, GIB);
    assert_eq!(created.context.backing, Backing::Share);

    // Same name, different size
    let err = volumes
        .create(&share_volume_request("pvc-1", 2 * GIB))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_create_share_volume_submits_share() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", format!("{}/shares/pvc-new", API).as_str())
        .with_status(404)
        .create_async()
        .await;
    let create = server
        .mock("POST", format!("{}/shares", API).as_str())
        .match_body(Matcher::PartialJson(json!({
            "name": "pvc-new",
            "path": "/pvc-new",
            "shareSizeLimit": GIB,
            "extendedInfo": {"csi_created_by": DRIVER_NAME},
        })))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let created = fixture
        .volumes()
        .create(&share_volume_request("pvc-new", GIB))
        .await
        .unwrap();

    assert_eq!(created.capacity, GIB);
    create.assert_async().await;
}

#[tokio::test]
async fn test_create_share_tolerates_concurrent_creation() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", format!("{}/shares/pvc-race", API).as_str())
        .with_status(404)
        .create_async()
        .await;
    let _rejected = server
        .mock("POST", format!("{}/shares", API).as_str())
        .with_status(400)
        .with_body("share name in use")
        .create_async()
        .await;
    let tasks = server
        .mock("GET", format!("{}/tasks", API).as_str())
        .with_status(200)
        .with_body(
            json!([{
                "uuid": "t-1",
                "name": "ShareCreate",
                "status": "EXECUTING",
                "paramMap": {"name": "pvc-race"},
            }])
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let created = fixture
        .volumes()
        .create(&share_volume_request("pvc-race", GIB))
        .await
        .unwrap();

    assert_eq!(created.path.to_string(), "/pvc-race");
    tasks.assert_async().await;
}

#[tokio::test]
async fn test_create_share_rejected_without_matching_task() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", format!("{}/shares/pvc-bad", API).as_str())
        .with_status(404)
        .create_async()
        .await;
    let _rejected = server
        .mock("POST", format!("{}/shares", API).as_str())
        .with_status(400)
        .with_body("invalid export options")
        .create_async()
        .await;
    let _tasks = server
        .mock("GET", format!("{}/tasks", API).as_str())
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let err = fixture
        .volumes()
        .create(&share_volume_request("pvc-bad", GIB))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Backend(_)));
}

#[tokio::test]
async fn test_delete_missing_volume_succeeds() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", format!("{}/shares/pvc-gone", API).as_str())
        .with_status(404)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let volumes = fixture.volumes();

    volumes.delete("/pvc-gone").await.unwrap();
    // Repeating is just as fine
    volumes.delete("/pvc-gone").await.unwrap();
    // Ids this driver never issued are treated as already gone
    volumes.delete("not-a-volume-id").await.unwrap();
}

#[tokio::test]
async fn test_delete_share_with_snapshots_is_refused() {
    let mut server = Server::new_async().await;
    let _share = server
        .mock("GET", format!("{}/shares/pvc-1", API).as_str())
        .with_status(200)
        .with_body(share_json("pvc-1", GIB, GIB, None))
        .create_async()
        .await;
    let _snapshots = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/pvc-1", API).as_str(),
        )
        .with_status(200)
        .with_body(r#"["snap-a"]"#)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let err = fixture.volumes().delete("/pvc-1").await.unwrap_err();
    assert!(matches!(err, DriverError::FailedPrecondition(_)));
}

#[tokio::test]
async fn test_delete_share_uses_recorded_delay() {
    let mut server = Server::new_async().await;
    let _share = server
        .mock("GET", format!("{}/shares/pvc-1", API).as_str())
        .with_status(200)
        .with_body(share_json("pvc-1", GIB, GIB, Some("30")))
        .create_async()
        .await;
    let _snapshots = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/pvc-1", API).as_str(),
        )
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    let delete = server
        .mock("DELETE", format!("{}/shares/pvc-1", API).as_str())
        .match_query(Matcher::UrlEncoded("delete-delay".into(), "30".into()))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    fixture.volumes().delete("/pvc-1").await.unwrap();
    delete.assert_async().await;
}

#[tokio::test]
async fn test_delete_share_already_removed_counts_as_deleted() {
    let mut server = Server::new_async().await;
    let _share = server
        .mock("GET", format!("{}/shares/pvc-1", API).as_str())
        .with_status(200)
        .with_body(share_json("pvc-1", GIB, GIB, None))
        .create_async()
        .await;
    let _snapshots = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/pvc-1", API).as_str(),
        )
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    let _delete = server
        .mock("DELETE", format!("{}/shares/pvc-1", API).as_str())
        .with_status(400)
        .with_body("Share pvc-1 is already removed")
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    fixture.volumes().delete("/pvc-1").await.unwrap();
}

#[tokio::test]
async fn test_expand_file_volume_checks_headroom() {
    let mut server = Server::new_async().await;
    let _backing = server
        .mock("GET", format!("{}/shares/blk", API).as_str())
        .with_status(200)
        .with_body(share_json("blk", 0, GIB / 2, None))
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    // Attached on this node, so the backing share stays mounted
    fixture.host.set_mounted("/backing/blk", "10.0.0.1:/blk");
    fixture.host.add_file("/backing/blk/pvc-2", GIB as u64);
    fixture.host.add_loop("/dev/loop7", "/backing/blk/pvc-2");
    let volumes = fixture.volumes();

    // Shrinking is a no-op reporting the current size
    let same = volumes.expand("/blk/pvc-2", GIB / 2).await.unwrap();
    assert_eq!(same.capacity, GIB);
    assert!(!same.node_expansion_required);

    let grown = volumes.expand("/blk/pvc-2", GIB + GIB / 4).await.unwrap();
    assert_eq!(grown.capacity, GIB + GIB / 4);
    assert!(grown.node_expansion_required);
    assert_eq!(
        fixture.host.file("/backing/blk/pvc-2"),
        Some((GIB + GIB / 4) as u64)
    );

    let err = volumes.expand("/blk/pvc-2", 4 * GIB).await.unwrap_err();
    assert!(matches!(err, DriverError::OutOfRange(_)));
    assert!(fixture.host.mount_source("/backing/blk").is_some());
}

#[tokio::test]
async fn test_expand_unlimited_share_reports_requested_size() {
    let mut server = Server::new_async().await;
    let _share = server
        .mock("GET", format!("{}/shares/pvc-1", API).as_str())
        .with_status(200)
        .with_body(share_json("pvc-1", 0, 10 * GIB, None))
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let expanded = fixture.volumes().expand("/pvc-1", 3 * GIB).await.unwrap();
    assert_eq!(expanded.capacity, 3 * GIB);
    assert!(!expanded.node_expansion_required);
}

#[tokio::test]
async fn test_held_volume_lock_reports_unavailable() {
    let server = Server::new_async().await;
    let fixture = Fixture::with_lock_timeout(&server, Duration::from_millis(50));
    let volumes = fixture.volumes();

    let _held = fixture.locks.volumes.acquire("/pvc-1").await.unwrap();
    let err = volumes.delete("/pvc-1").await.unwrap_err();
    assert!(matches!(err, DriverError::Lock(_)));

    let status: tonic::Status = err.into();
    assert_eq!(status.code(), Code::Unavailable);
}

#[tokio::test]
async fn test_capacity_by_volume_shape() {
    let mut server = Server::new_async().await;
    let _backing = server
        .mock("GET", format!("{}/shares/blk", API).as_str())
        .with_status(200)
        .with_body(share_json("blk", 0, 5 * GIB, None))
        .create_async()
        .await;
    let _state = server
        .mock("GET", format!("{}/cntl/state", API).as_str())
        .with_status(200)
        .with_body(r#"[{"capacity": {"total": 100, "free": 42}}]"#)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let volumes = fixture.volumes();

    let block_params = VolumeParameters::parse(&HashMap::from([(
        "blockBackingShareName".to_string(),
        "blk".to_string(),
    )]))
    .unwrap();
    assert_eq!(volumes.capacity(true, false, &block_params).await.unwrap(), 5 * GIB);
    assert_eq!(volumes.capacity(true, true, &block_params).await.unwrap(), 0);

    let nfs_params = VolumeParameters::default();
    assert_eq!(volumes.capacity(false, true, &nfs_params).await.unwrap(), 42);
    // Block without a backing share has nowhere to go
    assert_eq!(volumes.capacity(true, false, &nfs_params).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_creates_submit_one_share() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", format!("{}/shares/pvc-dup", API).as_str())
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let _created = mock_share(&mut server, "pvc-dup", GIB, GIB).await;
    let create = server
        .mock("POST", format!("{}/shares", API).as_str())
        .match_body(Matcher::PartialJson(json!({"name": "pvc-dup"})))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let volumes = Arc::new(fixture.volumes());

    let first = tokio::spawn({
        let volumes = volumes.clone();
        async move { volumes.create(&share_volume_request("pvc-dup", GIB)).await }
    });
    let second = tokio::spawn({
        let volumes = volumes.clone();
        async move { volumes.create(&share_volume_request("pvc-dup", GIB)).await }
    });

    for created in [first.await.unwrap(), second.await.unwrap()] {
        let created = created.unwrap();
        assert_eq!(created.path.to_string(), "/pvc-dup");
        assert_eq!(created.capacity, GIB);
    }
    create.assert_async().await;
}

#[tokio::test]
async fn test_create_share_volume_from_snapshot() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", format!("{}/shares/pvc-new", API).as_str())
        .with_status(404)
        .create_async()
        .await;
    let _source = mock_share(&mut server, "pvc-src", GIB, GIB).await;
    let _snapshots = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/pvc-src", API).as_str(),
        )
        .with_status(200)
        .with_body(r#"["snap-1"]"#)
        .create_async()
        .await;
    let restore = server
        .mock(
            "POST",
            format!("{}/share-snapshots/snapshot-restore/pvc-src/snap-1", API).as_str(),
        )
        .match_body(Matcher::PartialJson(json!({"name": "pvc-new", "path": "/pvc-new"})))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let volumes = fixture.volumes();

    let mut request = share_volume_request("pvc-new", GIB);
    request.source_snapshot = Some(SnapshotId::new("snap-1", "/pvc-src").unwrap());
    let created = volumes.create(&request).await.unwrap();
    assert_eq!(created.capacity, GIB);
    restore.assert_async().await;

    request.source_snapshot = Some(SnapshotId::new("snap-9", "/pvc-src").unwrap());
    let err = volumes.create(&request).await.unwrap_err();
    assert!(matches!(err, DriverError::NotFound(_)));
}

#[tokio::test]
async fn test_create_file_volume_creates_backing_share() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("GET", format!("{}/shares/blk", API).as_str())
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let _backing = mock_share(&mut server, "blk", 0, 10 * GIB).await;
    let create = server
        .mock("POST", format!("{}/shares", API).as_str())
        .match_body(Matcher::PartialJson(json!({"name": "blk", "path": "/blk"})))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;
    let _portals = mock_portals(&mut server).await;
    let _file = mock_file(&mut server, "/blk/pvc-2", GIB).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/blk");

    let created = fixture
        .volumes()
        .create(&file_volume_request("pvc-2", "blk", GIB, VolumeMode::Block))
        .await
        .unwrap();
    assert_eq!(created.path, VolumePath::file("blk", "pvc-2"));
    assert_eq!(created.capacity, GIB);
    assert_eq!(created.context.backing, Backing::File);
    assert_eq!(created.context.backing_share.as_deref(), Some("blk"));
    create.assert_async().await;

    assert_eq!(fixture.host.file("/backing/blk/pvc-2"), Some(GIB as u64));
    assert_eq!(
        fixture.host.allocations(),
        vec![("/backing/blk/pvc-2".to_string(), true)]
    );
    let calls = fixture.host.mount_calls();
    assert_eq!(calls[0].source, "10.0.0.1:/blk");
    assert_eq!(calls[0].target, "/backing/blk");
    // Nothing is attached, so the backing share is released
    assert!(fixture.host.mount_source("/backing/blk").is_none());
}

#[tokio::test]
async fn test_create_file_volume_checks_headroom() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "blk", 0, GIB / 2).await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/blk");

    let err = fixture
        .volumes()
        .create(&file_volume_request("pvc-2", "blk", GIB, VolumeMode::Block))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::OutOfRange(_)));
    assert!(fixture.host.file("/backing/blk/pvc-2").is_none());
    assert!(fixture.host.mount_source("/backing/blk").is_none());
}

#[tokio::test]
async fn test_failed_format_removes_image() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "img", 0, 10 * GIB).await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/img");
    fixture.host.fail_format();

    let err = fixture
        .volumes()
        .create(&file_volume_request("pvc-3", "img", GIB, VolumeMode::Filesystem))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Platform(_)));

    // The image was written, then removed so a retry starts over
    assert_eq!(fixture.host.allocations().len(), 1);
    assert!(fixture.host.file("/backing/img/pvc-3").is_none());
    assert!(fixture.host.loops().is_empty());
    assert!(fixture.host.mount_source("/backing/img").is_none());
}

#[tokio::test]
async fn test_create_file_volume_times_out_waiting_for_backend() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "blk", 0, 10 * GIB).await;
    let _portals = mock_portals(&mut server).await;
    let _invisible = server
        .mock("GET", format!("{}/files", API).as_str())
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/blk");

    let err = fixture
        .volumes()
        .create(&file_volume_request("pvc-2", "blk", GIB, VolumeMode::Block))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Internal(_)));
    assert!(fixture.host.file("/backing/blk/pvc-2").is_some());
}

#[tokio::test]
async fn test_create_file_volume_retry_matches_existing_image() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "blk", 0, 10 * GIB).await;
    let _portals = mock_portals(&mut server).await;
    let _file = mock_file(&mut server, "/blk/pvc-2", 3 * GIB).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/blk");
    fixture.host.add_file("/backing/blk/pvc-2", 3 * GIB as u64);
    let volumes = fixture.volumes();

    // No requested size accepts whatever is there
    let created = volumes
        .create(&file_volume_request("pvc-2", "blk", 0, VolumeMode::Block))
        .await
        .unwrap();
    assert_eq!(created.capacity, 3 * GIB);

    let same = volumes
        .create(&file_volume_request("pvc-2", "blk", 3 * GIB, VolumeMode::Block))
        .await
        .unwrap();
    assert_eq!(same.capacity, 3 * GIB);

    let err = volumes
        .create(&file_volume_request("pvc-2", "blk", GIB, VolumeMode::Block))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::AlreadyExists(_)));
    assert!(fixture.host.allocations().is_empty());
}

#[tokio::test]
async fn test_create_file_volume_from_snapshot() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "blk", 0, 10 * GIB).await;
    let _portals = mock_portals(&mut server).await;
    let _snapshots = server
        .mock("GET", format!("{}/file-snapshots/list", API).as_str())
        .match_query(Matcher::UrlEncoded(
            "filename-expression".into(),
            "/blk/pvc-2".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"name": "snap-f", "path": "/blk/pvc-2", "created": 1700000000}]"#)
        .create_async()
        .await;
    let restore = server
        .mock("POST", format!("{}/file-snapshots/restore", API).as_str())
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("filename-expression".into(), "/blk/pvc-2".into()),
            Matcher::UrlEncoded("date-time-expression".into(), "snap-f".into()),
            Matcher::UrlEncoded("destination-path".into(), "/blk/pvc-r".into()),
        ]))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;
    let _restored = mock_file(&mut server, "/blk/pvc-r", 2 * GIB).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/blk");

    let mut request = file_volume_request("pvc-r", "blk", 0, VolumeMode::Block);
    request.source_snapshot = Some(SnapshotId::new("snap-f", "/blk/pvc-2").unwrap());
    let created = fixture.volumes().create(&request).await.unwrap();

    // Size comes from the restored image
    assert_eq!(created.capacity, 2 * GIB);
    restore.assert_async().await;
    assert!(fixture.host.allocations().is_empty());
    assert!(fixture.host.mount_source("/backing/blk").is_none());
}

#[tokio::test]
async fn test_creates_on_one_backing_share_are_serialized() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "blk", 0, 10 * GIB).await;
    let _portals = mock_portals(&mut server).await;
    let _file_a = mock_file(&mut server, "/blk/pvc-a", GIB).await;
    let _file_b = mock_file(&mut server, "/blk/pvc-b", GIB).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/blk");
    let gate = fixture.host.gate_allocation("/backing/blk/pvc-a");
    let volumes = Arc::new(fixture.volumes());

    let first = tokio::spawn({
        let volumes = volumes.clone();
        async move {
            volumes
                .create(&file_volume_request("pvc-a", "blk", GIB, VolumeMode::Block))
                .await
        }
    });
    while !fixture.host.gate_reached() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = tokio::spawn({
        let volumes = volumes.clone();
        async move {
            volumes
                .create(&file_volume_request("pvc-b", "blk", GIB, VolumeMode::Block))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    // pvc-b waits for the backing share while pvc-a is being written
    assert!(!second.is_finished());
    assert!(fixture.host.mount_source("/backing/blk").is_some());

    gate.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let allocations = fixture.host.allocations();
    assert_eq!(allocations.len(), 2);
    assert!(allocations.iter().all(|(_, mounted)| *mounted));
    assert!(fixture.host.mount_source("/backing/blk").is_none());
}

#[tokio::test]
async fn test_delete_file_volume() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "blk", 0, 10 * GIB).await;
    let _portals = mock_portals(&mut server).await;
    let _file = mock_file(&mut server, "/blk/pvc-2", GIB).await;
    let _kept = mock_file(&mut server, "/blk/pvc-3", GIB).await;
    let _no_snapshots = server
        .mock("GET", format!("{}/file-snapshots/list", API).as_str())
        .match_query(Matcher::UrlEncoded(
            "filename-expression".into(),
            "/blk/pvc-2".into(),
        ))
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    let _snapshots = server
        .mock("GET", format!("{}/file-snapshots/list", API).as_str())
        .match_query(Matcher::UrlEncoded(
            "filename-expression".into(),
            "/blk/pvc-3".into(),
        ))
        .with_status(200)
        .with_body(r#"[{"name": "snap-f", "path": "/blk/pvc-3"}]"#)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/blk");
    fixture.host.add_file("/backing/blk/pvc-2", GIB as u64);
    fixture.host.add_file("/backing/blk/pvc-3", GIB as u64);
    let volumes = fixture.volumes();

    volumes.delete("/blk/pvc-2").await.unwrap();
    assert!(fixture.host.file("/backing/blk/pvc-2").is_none());
    assert_eq!(fixture.host.mount_calls().len(), 1);
    assert!(fixture.host.mount_source("/backing/blk").is_none());

    let err = volumes.delete("/blk/pvc-3").await.unwrap_err();
    assert!(matches!(err, DriverError::FailedPrecondition(_)));
    assert!(fixture.host.file("/backing/blk/pvc-3").is_some());
}

// ============================================================================
// Data-portal selection
// ============================================================================

#[tokio::test]
async fn test_mount_share_prefers_co_located_portal() {
    let mut server = Server::new_async().await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/pvc-1");
    fixture.host.export("10.0.0.2", "/pvc-1");

    let used = fixture
        .portals
        .mount_share("/pvc-1", "/mnt/target", None, &[])
        .await
        .unwrap();
    assert_eq!(used.address, "10.0.0.1");
    assert_eq!(used.kind, CandidateKind::Portal { co_located: true });

    let calls = fixture.host.mount_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].source, "10.0.0.1:/pvc-1");
    assert_eq!(calls[0].target, "/mnt/target");
    assert_eq!(calls[0].fs_type, "nfs");
    assert!(calls[0].options.contains(&"nfsvers=4.2".to_string()));
}

#[tokio::test]
async fn test_mount_share_falls_back_to_nfs3() {
    let mut server = Server::new_async().await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/pvc-1");
    fixture.host.export("10.0.0.2", "/pvc-1");
    fixture.host.fail_mounts_with("nfsvers=4.2");

    fixture
        .portals
        .mount_share("/pvc-1", "/mnt/target", None, &[])
        .await
        .unwrap();

    // Every portal gets NFS 4.2 before any gets NFS 3
    let calls = fixture.host.mount_calls();
    let attempts: Vec<(&str, bool)> = calls
        .iter()
        .map(|c| {
            (
                c.source.as_str(),
                c.options.contains(&"nfsvers=4.2".to_string()),
            )
        })
        .collect();
    assert_eq!(
        attempts,
        vec![
            ("10.0.0.1:/pvc-1", true),
            ("10.0.0.2:/pvc-1", true),
            ("10.0.0.1:/pvc-1", false),
        ]
    );
    assert!(calls[2].options.contains(&"nolock".to_string()));
    assert_eq!(
        fixture.host.mount_source("/mnt/target").as_deref(),
        Some("10.0.0.1:/pvc-1")
    );
}

#[tokio::test]
async fn test_mount_share_skips_portals_without_export() {
    let mut server = Server::new_async().await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.2", "/mnt/data-portal/pvc-1");

    let used = fixture
        .portals
        .mount_share("/pvc-1", "/mnt/target", None, &[])
        .await
        .unwrap();
    assert_eq!(used.address, "10.0.0.2");
    assert_eq!(
        fixture.host.mount_source("/mnt/target").as_deref(),
        Some("10.0.0.2:/mnt/data-portal/pvc-1")
    );
}

#[tokio::test]
async fn test_mount_share_fails_when_nothing_exports() {
    let mut server = Server::new_async().await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    let err = fixture
        .portals
        .mount_share("/pvc-1", "/mnt/target", None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Internal(_)));
    assert!(fixture.host.mount_calls().is_empty());
}

#[tokio::test]
async fn test_backing_share_stays_mounted_while_in_use() {
    let server = Server::new_async().await;
    let fixture = Fixture::new(&server);
    fixture.host.set_mounted("/backing/blk", "10.0.0.1:/blk");
    fixture.host.add_loop("/dev/loop0", "/backing/blk/pvc-1");
    // A similarly named share must not count as a user
    fixture.host.add_loop("/dev/loop1", "/backing/blk2/pvc-9");

    let backing = fixture.portals.lock_backing_share("blk").await.unwrap();
    assert_eq!(backing.mount_point(), "/backing/blk");
    assert_eq!(backing.file_path("pvc-1"), "/backing/blk/pvc-1");
    assert!(!fixture.portals.unmount_if_unused(&backing).await.unwrap());
    assert!(fixture.host.mount_source("/backing/blk").is_some());

    fixture.host.state.lock().loops.retain(|l| l.device != "/dev/loop0");
    assert!(fixture.portals.unmount_if_unused(&backing).await.unwrap());
    assert!(fixture.host.mount_source("/backing/blk").is_none());
    // Already unmounted
    assert!(!fixture.portals.unmount_if_unused(&backing).await.unwrap());
}

#[tokio::test]
async fn test_backing_share_lock_is_exclusive() {
    let server = Server::new_async().await;
    let fixture = Fixture::with_lock_timeout(&server, Duration::from_millis(50));

    let held = fixture.portals.lock_backing_share("blk").await.unwrap();
    let err = fixture.portals.lock_backing_share("blk").await.unwrap_err();
    assert!(matches!(err, DriverError::Lock(_)));
    // Other shares are unaffected
    let _other = fixture.portals.lock_backing_share("img").await.unwrap();

    drop(held);
    let _again = fixture.portals.lock_backing_share("blk").await.unwrap();
}

#[tokio::test]
async fn test_mount_share_falls_back_from_fqdn_to_portals() {
    let mut server = Server::new_async().await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("data.example.com", "/pvc-1");
    fixture.host.export("10.0.0.1", "/pvc-1");
    fixture.host.fail_mounts_from("data.example.com:/pvc-1");

    let used = fixture
        .portals
        .mount_share("/pvc-1", "/mnt/target", Some("data.example.com"), &[])
        .await
        .unwrap();
    assert_eq!(used.address, "10.0.0.1");
    assert_eq!(used.kind, CandidateKind::Portal { co_located: true });

    let calls = fixture.host.mount_calls();
    assert_eq!(calls[0].source, "data.example.com:/pvc-1");
    assert_eq!(calls[1].source, "10.0.0.1:/pvc-1");
    assert!(calls[1].options.contains(&"nfsvers=4.2".to_string()));
    assert_eq!(
        fixture.host.mount_source("/mnt/target").as_deref(),
        Some("10.0.0.1:/pvc-1")
    );
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_create_is_idempotent_per_name() {
    let mut server = Server::new_async().await;
    let _share = server
        .mock("GET", format!("{}/shares/pvc-1", API).as_str())
        .with_status(200)
        .with_body(share_json("pvc-1", GIB, GIB, None))
        .create_async()
        .await;
    let _existing = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/pvc-1", API).as_str(),
        )
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    let create = server
        .mock(
            "POST",
            format!("{}/share-snapshots/snapshot-create/pvc-1", API).as_str(),
        )
        .match_query(Matcher::UrlEncoded("snapshot-name".into(), "snap-1".into()))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let snapshots = fixture.snapshots();

    let first = snapshots.create("snap-1", "/pvc-1").await.unwrap();
    assert_eq!(first.id.to_string(), "snap-1|/pvc-1");
    assert_eq!(first.source_volume_id, "/pvc-1");
    assert_eq!(first.size_bytes, GIB);

    let again = snapshots.create("snap-1", "/pvc-1").await.unwrap();
    assert_eq!(again, first);
    create.assert_async().await;

    let err = snapshots.create("snap-1", "/pvc-2").await.unwrap_err();
    assert!(matches!(err, DriverError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_snapshot_delete() {
    let mut server = Server::new_async().await;
    let share_delete = server
        .mock(
            "DELETE",
            format!("{}/share-snapshots/snapshot-delete/pvc-1/snap-1", API).as_str(),
        )
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let _file_delete = server
        .mock("DELETE", format!("{}/file-snapshots/delete", API).as_str())
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let snapshots = fixture.snapshots();

    snapshots.delete("snap-1|/pvc-1").await.unwrap();
    share_delete.assert_async().await;

    let err = snapshots.delete("no-delimiter").await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_list_snapshots_for_source() {
    let mut server = Server::new_async().await;
    let _list = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/pvc-1", API).as_str(),
        )
        .with_status(200)
        .with_body(r#"["snap-b", "snap-a"]"#)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let snapshots = fixture.snapshots();

    let records = snapshots.list(None, Some("/pvc-1")).await.unwrap();
    let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
    assert_eq!(ids, vec!["snap-a|/pvc-1", "snap-b|/pvc-1"]);

    let by_id = snapshots.list(Some("snap-b|/pvc-1"), None).await.unwrap();
    assert_eq!(by_id.len(), 1);

    assert!(snapshots.list(Some("garbage"), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_all_snapshots_reads_file_snapshots_from_backend() {
    let mut server = Server::new_async().await;
    let _shares = server
        .mock("GET", format!("{}/shares", API).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!("[{}]", share_json("blk", 0, 10 * GIB, None)))
        .create_async()
        .await;
    let _share_snapshots = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/blk", API).as_str(),
        )
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    let file_snapshots = server
        .mock("GET", format!("{}/file-snapshots/list", API).as_str())
        .match_query(Matcher::UrlEncoded(
            "filename-expression".into(),
            "/blk/*".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([
                {"name": "snap-f", "path": "/blk/pvc-2", "created": 1700000000},
                {"name": "stray", "path": ""},
            ])
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    // Nothing was created through this manager
    let fixture = Fixture::new(&server);
    let records = fixture.snapshots().list(None, None).await.unwrap();

    let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
    assert_eq!(ids, vec!["snap-f|/blk/pvc-2"]);
    assert_eq!(records[0].source_volume_id, "/blk/pvc-2");
    assert!(records[0].created_at.is_some());
    file_snapshots.assert_async().await;
}

// ============================================================================
// CSI services
// ============================================================================

fn mount_capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

fn block_capability() -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
    }
}

#[tokio::test]
async fn test_controller_create_volume_validation() {
    use csi::volume_capability::access_mode::Mode;

    let server = Server::new_async().await;
    let fixture = Fixture::new(&server);
    let controller = ControllerService::new(
        Arc::new(fixture.volumes()),
        Arc::new(fixture.snapshots()),
    );

    let missing_name = csi::CreateVolumeRequest {
        volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
        ..Default::default()
    };
    let status = controller
        .create_volume(Request::new(missing_name))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mixed = csi::CreateVolumeRequest {
        name: "pvc-1".to_string(),
        volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter), block_capability()],
        ..Default::default()
    };
    let status = controller.create_volume(Request::new(mixed)).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Block needs a backing share in the class parameters
    let block = csi::CreateVolumeRequest {
        name: "pvc-1".to_string(),
        volume_capabilities: vec![block_capability()],
        ..Default::default()
    };
    let status = controller.create_volume(Request::new(block)).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_controller_list_snapshots_pagination() {
    let mut server = Server::new_async().await;
    let _list = server
        .mock(
            "GET",
            format!("{}/share-snapshots/snapshot-list/pvc-1", API).as_str(),
        )
        .with_status(200)
        .with_body(r#"["s1", "s2", "s3"]"#)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let controller = ControllerService::new(
        Arc::new(fixture.volumes()),
        Arc::new(fixture.snapshots()),
    );

    let page = controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            source_volume_id: "/pvc-1".to_string(),
            max_entries: 2,
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(page.entries.len(), 2);
    assert_eq!(page.next_token, "2");

    let rest = controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            source_volume_id: "/pvc-1".to_string(),
            max_entries: 2,
            starting_token: page.next_token,
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(rest.entries.len(), 1);
    assert!(rest.next_token.is_empty());
    let snapshot = rest.entries[0].snapshot.as_ref().unwrap();
    assert_eq!(snapshot.snapshot_id, "s3|/pvc-1");
    assert!(snapshot.ready_to_use);

    let status = controller
        .list_snapshots(Request::new(csi::ListSnapshotsRequest {
            source_volume_id: "/pvc-1".to_string(),
            starting_token: "bogus".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Aborted);
}

#[tokio::test]
async fn test_node_publish_share_volume() {
    use csi::volume_capability::access_mode::Mode;

    let mut server = Server::new_async().await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/pvc-1");
    let node = fixture.node();

    let target = "/var/lib/kubelet/pods/p1/volumes/pvc-1/mount";
    let context = VolumeContext {
        backing: Backing::Share,
        client_mount_options: vec!["hard".to_string()],
        ..VolumeContext::default()
    };
    let publish = csi::NodePublishVolumeRequest {
        volume_id: "/pvc-1".to_string(),
        target_path: target.to_string(),
        volume_capability: Some(mount_capability(Mode::MultiNodeMultiWriter)),
        readonly: true,
        volume_context: context.to_map(),
        ..Default::default()
    };

    node.node_publish_volume(Request::new(publish.clone()))
        .await
        .unwrap();
    assert_eq!(
        fixture.host.mount_source(target).as_deref(),
        Some("10.0.0.1:/pvc-1")
    );
    let options = &fixture.host.mount_calls()[0].options;
    assert!(options.contains(&"hard".to_string()));
    assert!(options.contains(&"ro".to_string()));

    // Already published
    node.node_publish_volume(Request::new(publish)).await.unwrap();
    assert_eq!(fixture.host.mount_calls().len(), 1);

    node.node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
        volume_id: "/pvc-1".to_string(),
        target_path: target.to_string(),
    }))
    .await
    .unwrap();
    assert!(fixture.host.mount_source(target).is_none());
}

#[tokio::test]
async fn test_node_publish_file_backed_block_volume() {
    let server = Server::new_async().await;
    let fixture = Fixture::new(&server);
    fixture.host.set_mounted("/backing/blk", "10.0.0.1:/blk");
    fixture.host.add_file("/backing/blk/pvc-2", GIB as u64);
    let node = fixture.node();

    let target = "/var/lib/kubelet/plugins/volumeDevices/publish/pvc-2/p1";
    let context = VolumeContext {
        mode: VolumeMode::Block,
        backing: Backing::File,
        backing_share: Some("blk".to_string()),
        ..VolumeContext::default()
    };

    node.node_publish_volume(Request::new(csi::NodePublishVolumeRequest {
        volume_id: "/blk/pvc-2".to_string(),
        target_path: target.to_string(),
        volume_capability: Some(block_capability()),
        volume_context: context.to_map(),
        ..Default::default()
    }))
    .await
    .unwrap();

    let loops = fixture.host.loops();
    assert_eq!(loops.len(), 1);
    assert_eq!(loops[0].backing_file, "/backing/blk/pvc-2");
    assert_eq!(
        fixture.host.mount_source(target).as_deref(),
        Some(loops[0].device.as_str())
    );

    node.node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
        volume_id: "/blk/pvc-2".to_string(),
        target_path: target.to_string(),
    }))
    .await
    .unwrap();
    assert!(fixture.host.loops().is_empty());
    assert!(fixture.host.mount_source(target).is_none());
    // Nothing uses the backing share any more
    assert!(fixture.host.mount_source("/backing/blk").is_none());

    node.node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
        volume_id: "/blk/pvc-2".to_string(),
        staging_target_path: "/var/lib/kubelet/plugins/staging/pvc-2".to_string(),
    }))
    .await
    .unwrap();
    assert!(fixture.host.mount_source("/backing/blk").is_none());
}

#[tokio::test]
async fn test_loop_device_shared_by_two_targets() {
    use csi::volume_capability::access_mode::Mode;

    let server = Server::new_async().await;
    let fixture = Fixture::new(&server);
    fixture.host.set_mounted("/backing/blk", "10.0.0.1:/blk");
    fixture.host.add_file("/backing/blk/pvc-2", GIB as u64);
    let node = fixture.node();

    let context = VolumeContext {
        mode: VolumeMode::Block,
        backing: Backing::File,
        backing_share: Some("blk".to_string()),
        ..VolumeContext::default()
    };
    let mut capability = block_capability();
    capability.access_mode = Some(csi::volume_capability::AccessMode {
        mode: Mode::SingleNodeMultiWriter as i32,
    });

    let targets = [
        "/var/lib/kubelet/plugins/volumeDevices/publish/pvc-2/p1",
        "/var/lib/kubelet/plugins/volumeDevices/publish/pvc-2/p2",
    ];
    for target in targets {
        node.node_publish_volume(Request::new(csi::NodePublishVolumeRequest {
            volume_id: "/blk/pvc-2".to_string(),
            target_path: target.to_string(),
            volume_capability: Some(capability.clone()),
            volume_context: context.to_map(),
            ..Default::default()
        }))
        .await
        .unwrap();
    }

    // Both targets share one loop device
    let loops = fixture.host.loops();
    assert_eq!(loops.len(), 1);
    let device = loops[0].device.clone();
    for target in targets {
        assert_eq!(fixture.host.mount_source(target).as_deref(), Some(device.as_str()));
    }

    let unpublish = |target: &str| csi::NodeUnpublishVolumeRequest {
        volume_id: "/blk/pvc-2".to_string(),
        target_path: target.to_string(),
    };

    node.node_unpublish_volume(Request::new(unpublish(targets[0])))
        .await
        .unwrap();
    assert!(fixture.host.mount_source(targets[0]).is_none());
    assert_eq!(fixture.host.loops().len(), 1);
    assert_eq!(
        fixture.host.mount_source(targets[1]).as_deref(),
        Some(device.as_str())
    );
    assert!(fixture.host.mount_source("/backing/blk").is_some());

    node.node_unpublish_volume(Request::new(unpublish(targets[1])))
        .await
        .unwrap();
    assert!(fixture.host.loops().is_empty());
    assert!(fixture.host.mount_source("/backing/blk").is_none());
}

#[tokio::test]
async fn test_node_stage_mounts_backing_share() {
    let mut server = Server::new_async().await;
    let _backing = mock_share(&mut server, "img", 0, 10 * GIB).await;
    let _portals = mock_portals(&mut server).await;

    let fixture = Fixture::new(&server);
    fixture.host.export("10.0.0.1", "/img");
    let node = fixture.node();

    let context = VolumeContext {
        mode: VolumeMode::Filesystem,
        backing: Backing::File,
        fs_type: "ext4".to_string(),
        backing_share: Some("img".to_string()),
        ..VolumeContext::default()
    };
    let staging = "/var/lib/kubelet/plugins/staging/pvc-3";
    let stage = csi::NodeStageVolumeRequest {
        volume_id: "/img/pvc-3".to_string(),
        staging_target_path: staging.to_string(),
        volume_capability: Some(mount_capability(
            csi::volume_capability::access_mode::Mode::SingleNodeWriter,
        )),
        volume_context: context.to_map(),
        ..Default::default()
    };

    node.node_stage_volume(Request::new(stage.clone())).await.unwrap();
    node.node_stage_volume(Request::new(stage)).await.unwrap();
    assert_eq!(fixture.host.mount_calls().len(), 1);
    assert_eq!(
        fixture.host.mount_source("/backing/img").as_deref(),
        Some("10.0.0.1:/img")
    );

    node.node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
        volume_id: "/img/pvc-3".to_string(),
        staging_target_path: staging.to_string(),
    }))
    .await
    .unwrap();
    assert!(fixture.host.mount_source("/backing/img").is_none());
}

#[tokio::test]
async fn test_node_get_info_reports_topology() {
    let server = Server::new_async().await;
    let fixture = Fixture::new(&server);

    let info = fixture
        .node()
        .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.node_id, "node-a");
    let topology = info.accessible_topology.unwrap();
    assert_eq!(
        topology.segments.get(csi_driver::node::TOPOLOGY_KEY).map(String::as_str),
        Some("node-a")
    );
}

#[tokio::test]
async fn test_identity_ready_after_login() {
    let mut server = Server::new_async().await;
    let _login = server
        .mock("POST", format!("{}/login", API).as_str())
        .with_status(200)
        .create_async()
        .await;

    let fixture = Fixture::new(&server);
    let identity = IdentityService::new(DRIVER_NAME, fixture.api.clone());

    let response = identity
        .probe(Request::new(csi::ProbeRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.ready, Some(true));
}
