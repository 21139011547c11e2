//! NFS Data-Portal CSI Driver Library
//!
//! Kubernetes CSI driver that provisions volumes on a storage cluster
//! through its REST management API and mounts them over NFS from the
//! cluster's data portals.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Volume and snapshot lifecycle reconcilers over `storage-api`
//! - Data-portal selection with NFS version fallback
//! - Host operations (mounts, loop devices, filesystems) behind a trait

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod controller;
pub mod error;
pub mod identity;
pub mod locks;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod portal;
pub mod snapshot;
pub mod types;
pub mod volume;

pub use controller::ControllerService;
pub use error::{DriverError, Result};
pub use identity::{DRIVER_NAME, DRIVER_VERSION, IdentityService};
pub use locks::{LockRegistry, Locks};
pub use node::NodeService;
pub use portal::{MountConfig, PortalSelector};
pub use snapshot::SnapshotManager;
pub use volume::{DriverConfig, VolumeReconciler};
