//! Host operations for the CSI node and the file-backed volume paths
//!
//! Everything that touches the local machine (NFS mounts, loop devices,
//! filesystem tools, export listing) goes through the [`HostOps`] trait so
//! the reconcilers can be exercised against an in-memory host in tests.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use csi_driver::platform::{HostOps, LinuxHost};
//!
//! let host: Arc<dyn HostOps> = Arc::new(LinuxHost::new());
//! let device = host.attach_loop_device("/var/lib/backing/blk/pvc-1").await?;
//! host.format_device(&device, "ext4").await?;
//! ```

mod linux;

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

pub use linux::LinuxHost;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse output: {0}")]
    Parse(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// An attached loop device and the file behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    pub device: String,
    pub backing_file: String,
}

/// Capacity and inode usage of a mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
    pub free_inodes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Missing,
    Directory,
    Other,
}

/// Local host primitives used by the driver.
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Mount `source` on `target`, creating the target directory.
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> PlatformResult<()>;

    /// Bind-mount a directory or a device node. A file target is created
    /// when the source is not a directory.
    async fn bind_mount(&self, source: &str, target: &str, read_only: bool) -> PlatformResult<()>;

    /// Unmount `target`; not being mounted is success.
    async fn unmount(&self, target: &str) -> PlatformResult<()>;

    async fn is_mounted(&self, target: &str) -> PlatformResult<bool>;

    /// Mount targets that use `device`, as a mounted filesystem or as a
    /// bind-mounted device node.
    async fn device_mounts(&self, device: &str) -> PlatformResult<Vec<String>>;

    /// Attach `file` to a free loop device and return the device path.
    async fn attach_loop_device(&self, file: &str) -> PlatformResult<String>;

    async fn detach_loop_device(&self, device: &str) -> PlatformResult<()>;

    /// Re-read the size of the backing file.
    async fn refresh_loop_device(&self, device: &str) -> PlatformResult<()>;

    async fn list_loop_devices(&self) -> PlatformResult<Vec<LoopDevice>>;

    async fn format_device(&self, device: &str, fs_type: &str) -> PlatformResult<()>;

    /// Grow the filesystem on `device`, mounted at `mount_path`, to fill it.
    async fn grow_filesystem(&self, device: &str, mount_path: &str) -> PlatformResult<()>;

    /// Create `path` if needed and set its length to `size`.
    async fn allocate_file(&self, path: &str, size: u64) -> PlatformResult<()>;

    /// Remove a file; a missing file is success.
    async fn remove_file(&self, path: &str) -> PlatformResult<()>;

    async fn file_size(&self, path: &str) -> PlatformResult<Option<u64>>;

    /// Export paths the NFS server on `host` currently offers.
    async fn list_nfs_exports(&self, host: &str) -> PlatformResult<Vec<String>>;

    /// Whether `host` answers for the NFS RPC service.
    async fn nfs_service_alive(&self, host: &str) -> bool;

    async fn resolve_host(&self, host: &str) -> PlatformResult<Vec<IpAddr>>;

    async fn filesystem_stats(&self, path: &str) -> PlatformResult<FsStats>;

    async fn block_device_size(&self, device: &str) -> PlatformResult<u64>;

    async fn path_type(&self, path: &str) -> PlatformResult<PathType>;

    /// Remove an unmounted mount point (directory or file).
    async fn cleanup_mount_point(&self, path: &str) -> PlatformResult<()>;
}

/// Validate that a path is safe to hand to a command line.
pub fn validate_path(path: &str) -> PlatformResult<()> {
    if path.is_empty() {
        return Err(PlatformError::InvalidPath("path cannot be empty".into()));
    }

    if !path.starts_with('/') {
        return Err(PlatformError::InvalidPath(format!(
            "path must be absolute: {}",
            path
        )));
    }

    // Disallow characters that could enable shell injection
    let dangerous_chars = [
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
    ];
    for c in dangerous_chars {
        if path.contains(c) {
            return Err(PlatformError::InvalidPath(format!(
                "path contains dangerous character '{}': {}",
                c, path
            )));
        }
    }

    if path.split('/').any(|part| part == "..") {
        return Err(PlatformError::InvalidPath(format!(
            "path cannot contain '..': {}",
            path
        )));
    }

    Ok(())
}

/// Validate a host name or address before it reaches a command line.
pub fn validate_host(host: &str) -> PlatformResult<()> {
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if valid {
        Ok(())
    } else {
        Err(PlatformError::InvalidPath(format!("invalid host name: {}", host)))
    }
}
