//! JSON models for the management API.
//!
//! Field names follow the API's camelCase convention. Optional fields are
//! tolerated as absent because the API omits them liberally depending on
//! object state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Share state reported once a share has been removed but not yet purged.
pub const SHARE_STATE_REMOVED: &str = "REMOVED";

/// Portal state required on both operational and administrative axes.
pub const PORTAL_STATE_UP: &str = "UP";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uoid {
    #[serde(default)]
    pub uuid: String,
}

/// Space accounting for a share.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareSpace {
    #[serde(default)]
    pub used: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub available: i64,
}

/// NFS export rule applied to a share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOption {
    /// Client subnet (`*` for any)
    pub subnet: String,
    /// `RO` or `RW`
    pub access_permissions: String,
    pub root_squash: bool,
}

/// A top-level export on the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub uoid: Option<Uoid>,
    #[serde(default)]
    pub share_state: Option<String>,
    /// Size limit in bytes; zero or absent means unlimited
    #[serde(default)]
    pub share_size_limit: Option<i64>,
    #[serde(default)]
    pub space: Option<ShareSpace>,
    #[serde(default)]
    pub export_options: Vec<ExportOption>,
    #[serde(default)]
    pub extended_info: HashMap<String, String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Share {
    /// Whether the share is in the terminal removed state.
    pub fn is_removed(&self) -> bool {
        self.share_state.as_deref() == Some(SHARE_STATE_REMOVED)
    }

    /// Configured size limit, zero when unlimited.
    pub fn size(&self) -> i64 {
        self.share_size_limit.unwrap_or(0)
    }

    /// Bytes still available on the share.
    pub fn available_bytes(&self) -> i64 {
        self.space.as_ref().map(|s| s.available).unwrap_or(0)
    }
}

/// Body for share create, restore and resize calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_size_limit: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub export_options: Vec<ExportOption>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub extended_info: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_enabled: Option<bool>,
}

/// A regular file as seen by the cluster metadata service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: i64,
}

/// A point-in-time snapshot of a single file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    /// Snapshot name (the API calls it the date-time expression)
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub created: i64,
}

/// A data-placement or retention policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Objective {
    pub name: String,
    #[serde(default)]
    pub uoid: Option<Uoid>,
}

/// Lifecycle status of an asynchronous task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Executing,
    Completed,
    Failed,
    Halted,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Terminal states end polling; only `Completed` is a success.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Halted | TaskStatus::Cancelled
        )
    }
}

/// An asynchronous backend operation handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub param_map: HashMap<String, String>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Waiting | TaskStatus::Executing)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCapacity {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub free: i64,
}

/// Entry of the cluster state listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    #[serde(default)]
    pub capacity: Option<ClusterCapacity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAddress {
    pub address: String,
}

/// Cluster-wide settings relevant to the data path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub floating_ips: Vec<IpAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalNode {
    pub name: String,
    #[serde(default)]
    pub mgmt_ip_address: Option<IpAddress>,
}

/// A cluster node able to serve NFS exports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPortal {
    #[serde(default)]
    pub uoid: Option<Uoid>,
    #[serde(default)]
    pub oper_state: String,
    #[serde(default)]
    pub admin_state: String,
    /// e.g. `NFS_V3`, `NFS_V4_2`
    #[serde(default)]
    pub data_portal_type: String,
    pub node: PortalNode,
}

impl DataPortal {
    /// Up on both state axes and exporting NFS.
    pub fn is_usable(&self) -> bool {
        self.oper_state == PORTAL_STATE_UP
            && self.admin_state == PORTAL_STATE_UP
            && self.data_portal_type.starts_with("NFS")
    }

    /// Address clients should mount from.
    pub fn address(&self) -> Option<&str> {
        self.node
            .mgmt_ip_address
            .as_ref()
            .map(|ip| ip.address.as_str())
            .filter(|a| !a.is_empty())
    }
}
