//! Data-portal selection and NFS mounting
//!
//! Picks the cluster address to mount a share from and performs the mount.
//! Candidates are tried in a fixed order:
//!
//! 1. A configured FQDN, when it resolves and answers for NFS.
//! 2. Cluster floating IPs that answer for NFS, when enabled.
//! 3. Usable data portals, the ones on the requesting node first.
//!
//! Every candidate is tried with NFS 4.2 before any is tried with NFS 3.
//!
//! Backing shares of file-backed volumes are mounted once per node and
//! shared by every image in them. They are only mounted, unmounted or
//! inspected through a [`BackingShare`], which holds the share's lock.

use std::collections::HashSet;
use std::sync::Arc;

use storage_api::{ApiClient, DataPortal};
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};
use crate::locks::{KeyGuard, LockRegistry};
use crate::metrics::record_mount_attempt;
use crate::platform::HostOps;

/// NFS protocol passes, tried in order.
const NFS_PASSES: [(&str, &[&str]); 2] = [
    ("4.2", &["nfsvers=4.2"]),
    ("3", &["nfsvers=3", "nolock"]),
];

/// Node-side mount settings.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub node_id: String,
    /// Cluster-wide FQDN override; per-volume settings take precedence
    pub fqdn: Option<String>,
    pub use_floating_ips: bool,
    /// Fixed prefix prepended to share paths, skipping export discovery
    pub mount_prefix: Option<String>,
    /// Prefixes tried in order when matching live exports
    pub export_prefixes: Vec<String>,
    /// Where backing shares are mounted locally
    pub backing_mount_dir: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            fqdn: None,
            use_floating_ips: false,
            mount_prefix: None,
            export_prefixes: vec![
                "/".to_string(),
                "/mnt/data-portal".to_string(),
                "/mnt/data-portal/".to_string(),
            ],
            backing_mount_dir: "/var/lib/csi-nfs-portal/backing".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Fqdn,
    FloatingIp,
    Portal { co_located: bool },
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Fqdn => "fqdn",
            CandidateKind::FloatingIp => "floating_ip",
            CandidateKind::Portal { co_located: true } => "local_portal",
            CandidateKind::Portal { co_located: false } => "portal",
        }
    }
}

/// One address a share can be mounted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: String,
    pub kind: CandidateKind,
}

/// Usable portals in mount order: portals on `node_id` first, then the
/// rest, each group keeping the backend's order.
pub fn order_portals(portals: &[DataPortal], node_id: &str) -> Vec<Candidate> {
    let usable = portals
        .iter()
        .filter(|p| p.is_usable())
        .filter_map(|p| p.address().map(|addr| (p, addr)));

    let (local, remote): (Vec<_>, Vec<_>) = usable.partition(|(p, _)| p.node.name == node_id);

    local
        .into_iter()
        .map(|(_, addr)| (addr, true))
        .chain(remote.into_iter().map(|(_, addr)| (addr, false)))
        .map(|(addr, co_located)| Candidate {
            address: addr.to_string(),
            kind: CandidateKind::Portal { co_located },
        })
        .collect()
}

/// Join an export prefix and a share path into one normalized path.
fn join_export(prefix: &str, path: &str) -> String {
    let joined = format!("{}/{}", prefix, path);
    let parts: Vec<&str> = joined.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Wrap IPv6 literals in brackets in an NFS mount source.
fn host_for_source(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{}]", address)
    } else {
        address.to_string()
    }
}

/// A backing share locked on this node.
#[must_use = "the backing share is unlocked as soon as this is dropped"]
pub struct BackingShare {
    name: String,
    mount_point: String,
    _guard: KeyGuard,
}

impl std::fmt::Debug for BackingShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingShare")
            .field("name", &self.name)
            .field("mount_point", &self.mount_point)
            .finish_non_exhaustive()
    }
}

impl BackingShare {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Local path of `file` inside the mounted share.
    pub fn file_path(&self, file: &str) -> String {
        format!("{}/{}", self.mount_point, file)
    }
}

pub struct PortalSelector {
    api: Arc<ApiClient>,
    host: Arc<dyn HostOps>,
    config: MountConfig,
    backing_locks: LockRegistry,
}

impl PortalSelector {
    pub fn new(
        api: Arc<ApiClient>,
        host: Arc<dyn HostOps>,
        config: MountConfig,
        backing_locks: LockRegistry,
    ) -> Self {
        Self {
            api,
            host,
            config,
            backing_locks,
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Candidate addresses in the order they are tried.
    pub async fn candidates(&self, fqdn_override: Option<&str>) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        if let Some(fqdn) = fqdn_override.or(self.config.fqdn.as_deref()) {
            let resolved = match self.host.resolve_host(fqdn).await {
                Ok(addrs) => !addrs.is_empty(),
                Err(e) => {
                    warn!(fqdn = %fqdn, error = %e, "Failed to resolve FQDN");
                    false
                }
            };
            if resolved && self.host.nfs_service_alive(fqdn).await {
                debug!(fqdn = %fqdn, "Using FQDN for data access");
                candidates.push(Candidate {
                    address: fqdn.to_string(),
                    kind: CandidateKind::Fqdn,
                });
            } else {
                warn!(fqdn = %fqdn, "FQDN does not answer for NFS, skipping it");
            }
        }

        if self.config.use_floating_ips {
            match self.api.floating_ips().await {
                Ok(ips) => {
                    for ip in ips {
                        if self.host.nfs_service_alive(&ip).await {
                            candidates.push(Candidate {
                                address: ip,
                                kind: CandidateKind::FloatingIp,
                            });
                        } else {
                            debug!(address = %ip, "Floating IP does not answer for NFS");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list floating IPs"),
            }
        }

        match self.api.list_data_portals().await {
            Ok(portals) => candidates.extend(order_portals(&portals, &self.config.node_id)),
            // Earlier candidates can still serve the mount
            Err(e) if !candidates.is_empty() => warn!(error = %e, "Failed to list data portals"),
            Err(e) => return Err(e.into()),
        }

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.address.clone()));
        Ok(candidates)
    }

    /// Export path to request from `address`, or `None` when the address
    /// does not export the share under any known prefix.
    async fn export_path(&self, address: &str, share_path: &str) -> Option<String> {
        if let Some(prefix) = &self.config.mount_prefix {
            return Some(join_export(prefix, share_path));
        }

        let exports = match self.host.list_nfs_exports(address).await {
            Ok(exports) => exports,
            Err(e) => {
                debug!(address = %address, error = %e, "Listing exports failed, using share path");
                return Some(join_export("/", share_path));
            }
        };

        let found = self
            .config
            .export_prefixes
            .iter()
            .map(|prefix| join_export(prefix, share_path))
            .find(|wanted| exports.iter().any(|e| join_export("/", e) == *wanted));
        if found.is_none() {
            debug!(address = %address, share_path = %share_path, "Share is not exported here");
        }
        found
    }

    /// Mount `share_path` on `target` from the best reachable data portal.
    pub async fn mount_share(
        &self,
        share_path: &str,
        target: &str,
        fqdn_override: Option<&str>,
        extra_options: &[String],
    ) -> Result<Candidate> {
        let candidates = self.candidates(fqdn_override).await?;
        if candidates.is_empty() {
            return Err(DriverError::Internal(format!(
                "no usable data portal to mount {}",
                share_path
            )));
        }

        let mut plans = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(export) = self.export_path(&candidate.address, share_path).await {
                plans.push((candidate, export));
            }
        }

        let mut failures = Vec::new();
        for (version, version_options) in NFS_PASSES {
            for (candidate, export) in &plans {
                let source = format!("{}:{}", host_for_source(&candidate.address), export);
                let mut options: Vec<String> =
                    version_options.iter().map(|o| o.to_string()).collect();
                options.extend(extra_options.iter().cloned());

                match self.host.mount(&source, target, "nfs", &options).await {
                    Ok(()) => {
                        record_mount_attempt(candidate.kind.as_str(), version, true);
                        info!(
                            source = %source,
                            target = %target,
                            nfs_version = version,
                            kind = candidate.kind.as_str(),
                            "Mounted share"
                        );
                        return Ok(candidate.clone());
                    }
                    Err(e) => {
                        record_mount_attempt(candidate.kind.as_str(), version, false);
                        warn!(source = %source, nfs_version = version, error = %e, "Mount attempt failed");
                        failures.push(format!("{} (nfs {}): {}", source, version, e));
                    }
                }
            }
        }

        Err(DriverError::Internal(format!(
            "failed to mount {} from any data portal: {}",
            share_path,
            if failures.is_empty() {
                "no portal exports the share".to_string()
            } else {
                failures.join("; ")
            }
        )))
    }

    /// Local mount point of a backing share.
    pub fn backing_mount_path(&self, share_name: &str) -> String {
        format!(
            "{}/{}",
            self.config.backing_mount_dir.trim_end_matches('/'),
            share_name
        )
    }

    /// Lock a backing share on this node, waiting at most the lock timeout.
    pub async fn lock_backing_share(&self, share_name: &str) -> Result<BackingShare> {
        let guard = self.backing_locks.acquire(share_name).await?;
        Ok(BackingShare {
            name: share_name.to_string(),
            mount_point: self.backing_mount_path(share_name),
            _guard: guard,
        })
    }

    /// Mount a locked backing share if it is not mounted already.
    pub async fn ensure_backing_mount(
        &self,
        share: &BackingShare,
        fqdn_override: Option<&str>,
    ) -> Result<()> {
        if self.host.is_mounted(share.mount_point()).await? {
            debug!(share = %share.name(), mount_point = %share.mount_point(), "Backing share already mounted");
            return Ok(());
        }

        let backend_share = self
            .api
            .get_share(share.name())
            .await?
            .ok_or_else(|| {
                DriverError::NotFound(format!("backing share {} not found", share.name()))
            })?;
        let share_path = if backend_share.path.is_empty() {
            format!("/{}", share.name())
        } else {
            backend_share.path
        };

        self.mount_share(&share_path, share.mount_point(), fqdn_override, &[])
            .await?;
        Ok(())
    }

    /// Unmount a locked backing share unless a loop device still uses a
    /// file in it.
    ///
    /// Returns `true` only when this call unmounted the share.
    pub async fn unmount_if_unused(&self, share: &BackingShare) -> Result<bool> {
        let mount_point = share.mount_point();
        if !self.host.is_mounted(mount_point).await? {
            return Ok(false);
        }

        let prefix = format!("{}/", mount_point);
        let loops = self.host.list_loop_devices().await?;
        if let Some(user) = loops.iter().find(|l| l.backing_file.starts_with(&prefix)) {
            info!(
                mount_point = %mount_point,
                device = %user.device,
                file = %user.backing_file,
                "Backing share still in use, leaving it mounted"
            );
            return Ok(false);
        }

        self.host.unmount(mount_point).await?;
        if let Err(e) = self.host.cleanup_mount_point(mount_point).await {
            debug!(mount_point = %mount_point, error = %e, "Failed to remove mount point");
        }
        info!(mount_point = %mount_point, "Unmounted unused backing share");
        Ok(true)
    }

    /// Unmount the share if nothing uses it, then unlock it. Failures are
    /// logged and otherwise ignored.
    pub async fn release_backing_share(&self, share: BackingShare) {
        if let Err(e) = self.unmount_if_unused(&share).await {
            warn!(mount_point = %share.mount_point(), error = %e, "Failed to release backing share mount");
        }
    }
}
