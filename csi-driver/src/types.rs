//! Type-safe wrappers for CSI parameters and identifiers.
//!
//! StorageClass parameters arrive as a flat string map and are parsed once
//! into [`VolumeParameters`]. Volume and snapshot identifiers are opaque to
//! the CO but carry structure for the driver; [`VolumePath`] and
//! [`SnapshotId`] own their parse/format pairs so no call site splits
//! strings by hand.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use storage_api::ExportOption;
use thiserror::Error;

/// Longest accepted volume or snapshot name, in bytes.
pub const MAX_NAME_LEN: usize = 255;
/// Longest accepted share comment, in characters.
pub const MAX_COMMENT_LEN: usize = 255;

/// Default size of file-backed volumes when the CO does not ask for one.
pub const DEFAULT_FILE_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// Filesystem type that selects a share-backed volume.
pub const FS_TYPE_NFS: &str = "nfs";

/// StorageClass parameter keys
pub mod params {
    pub const DELETE_DELAY: &str = "deleteDelay";
    pub const OBJECTIVES: &str = "objectives";
    pub const BLOCK_BACKING_SHARE_NAME: &str = "blockBackingShareName";
    pub const MOUNT_BACKING_SHARE_NAME: &str = "mountBackingShareName";
    pub const FS_TYPE: &str = "fsType";
    pub const EXPORT_OPTIONS: &str = "exportOptions";
    pub const VOLUME_NAME_FORMAT: &str = "volumeNameFormat";
    pub const ADDITIONAL_METADATA_TAGS: &str = "additionalMetadataTags";
    pub const COMMENT: &str = "comment";
    pub const CACHE_ENABLED: &str = "cacheEnabled";
    pub const FQDN: &str = "fqdn";
    pub const CLIENT_MOUNT_OPTIONS: &str = "clientMountOptions";
}

/// Volume context keys handed from controller to node
pub mod context {
    pub const MODE: &str = "mode";
    pub const BACKING: &str = "backing";
    pub const FS_TYPE: &str = "fsType";
    pub const BACKING_SHARE_NAME: &str = "backingShareName";
    pub const FQDN: &str = "fqdn";
    pub const CLIENT_MOUNT_OPTIONS: &str = "clientMountOptions";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("invalid {key} '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("export option '{0}' must be a 'subnet,access,rootSquash' triple")]
    ExportOptionArity(String),

    #[error("{0}")]
    Identifier(String),
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ParamError {
    ParamError::Invalid {
        key,
        value: value.to_string(),
        reason,
    }
}

// ============================================================================
// VolumeMode / Backing
// ============================================================================

/// How the workload consumes the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

impl Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeMode::Filesystem => write!(f, "filesystem"),
            VolumeMode::Block => write!(f, "block"),
        }
    }
}

impl FromStr for VolumeMode {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "filesystem" | "" => Ok(VolumeMode::Filesystem),
            "block" => Ok(VolumeMode::Block),
            _ => Err(invalid(context::MODE, s, "expected 'filesystem' or 'block'")),
        }
    }
}

/// Where the volume's bytes live on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backing {
    /// The volume is a share of its own
    #[default]
    Share,
    /// The volume is a file inside a backing share
    File,
}

impl Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Share => write!(f, "share"),
            Backing::File => write!(f, "file"),
        }
    }
}

impl FromStr for Backing {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "share" | "" => Ok(Backing::Share),
            "file" => Ok(Backing::File),
            _ => Err(invalid(context::BACKING, s, "expected 'share' or 'file'")),
        }
    }
}

// ============================================================================
// NameFormat
// ============================================================================

/// Template turning the CO's volume name into a backend name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFormat(String);

impl NameFormat {
    const PLACEHOLDER: &'static str = "%s";

    pub fn apply(&self, name: &str) -> String {
        self.0.replacen(Self::PLACEHOLDER, name, 1)
    }
}

impl Default for NameFormat {
    fn default() -> Self {
        NameFormat(Self::PLACEHOLDER.to_string())
    }
}

impl FromStr for NameFormat {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.matches(Self::PLACEHOLDER).count() != 1 {
            return Err(invalid(
                params::VOLUME_NAME_FORMAT,
                s,
                "must contain exactly one '%s'",
            ));
        }
        if s.contains('/') {
            return Err(invalid(
                params::VOLUME_NAME_FORMAT,
                s,
                "must not contain '/'",
            ));
        }
        Ok(NameFormat(s.to_string()))
    }
}

// ============================================================================
// Export options
// ============================================================================

/// Parse `;`-separated `subnet,access,rootSquash` triples.
pub fn parse_export_options(s: &str) -> Result<Vec<ExportOption>, ParamError> {
    let mut options = Vec::new();
    for triple in s.split(';') {
        let triple = triple.trim();
        if triple.is_empty() {
            continue;
        }

        let parts: Vec<&str> = triple.split(',').map(str::trim).collect();
        let [subnet, access, root_squash] = parts.as_slice() else {
            return Err(ParamError::ExportOptionArity(triple.to_string()));
        };

        let root_squash = root_squash
            .parse::<bool>()
            .map_err(|_| invalid(params::EXPORT_OPTIONS, triple, "rootSquash must be a bool"))?;

        options.push(ExportOption {
            subnet: subnet.to_string(),
            access_permissions: access.to_string(),
            root_squash,
        });
    }
    Ok(options)
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// VolumeParameters
// ============================================================================

/// Parsed StorageClass parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParameters {
    /// Seconds the backend keeps deleted data; -1 for the cluster default
    pub delete_delay: i64,
    pub objectives: Vec<String>,
    pub block_backing_share: Option<String>,
    pub mount_backing_share: Option<String>,
    pub fs_type: String,
    pub export_options: Vec<ExportOption>,
    pub name_format: NameFormat,
    pub metadata_tags: Vec<(String, String)>,
    pub comment: Option<String>,
    pub cache_enabled: Option<bool>,
    pub fqdn: Option<String>,
    pub client_mount_options: Vec<String>,
}

impl Default for VolumeParameters {
    fn default() -> Self {
        Self {
            delete_delay: -1,
            objectives: Vec::new(),
            block_backing_share: None,
            mount_backing_share: None,
            fs_type: FS_TYPE_NFS.to_string(),
            export_options: Vec::new(),
            name_format: NameFormat::default(),
            metadata_tags: Vec::new(),
            comment: None,
            cache_enabled: None,
            fqdn: None,
            client_mount_options: Vec::new(),
        }
    }
}

impl VolumeParameters {
    /// Parse a parameter map. Unknown keys are ignored.
    pub fn parse(map: &HashMap<String, String>) -> Result<Self, ParamError> {
        let mut p = VolumeParameters::default();
        let non_empty = |key: &str| {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = non_empty(params::DELETE_DELAY) {
            p.delete_delay = v
                .parse()
                .map_err(|_| invalid(params::DELETE_DELAY, v, "must be an integer"))?;
        }
        if let Some(v) = non_empty(params::OBJECTIVES) {
            p.objectives = split_list(v);
        }
        p.block_backing_share = non_empty(params::BLOCK_BACKING_SHARE_NAME).map(str::to_string);
        p.mount_backing_share = non_empty(params::MOUNT_BACKING_SHARE_NAME).map(str::to_string);
        for share in [&p.block_backing_share, &p.mount_backing_share]
            .into_iter()
            .flatten()
        {
            if share.contains('/') {
                return Err(invalid(
                    params::BLOCK_BACKING_SHARE_NAME,
                    share,
                    "backing share names must not contain '/'",
                ));
            }
        }
        if let Some(v) = non_empty(params::FS_TYPE) {
            p.fs_type = v.to_lowercase();
        }
        if let Some(v) = non_empty(params::EXPORT_OPTIONS) {
            p.export_options = parse_export_options(v)?;
        }
        if let Some(v) = non_empty(params::VOLUME_NAME_FORMAT) {
            p.name_format = v.parse()?;
        }
        if let Some(v) = non_empty(params::ADDITIONAL_METADATA_TAGS) {
            for pair in split_list(v) {
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(invalid(
                        params::ADDITIONAL_METADATA_TAGS,
                        &pair,
                        "tags must be key=value",
                    ));
                };
                p.metadata_tags
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        if let Some(v) = non_empty(params::COMMENT) {
            if v.chars().count() > MAX_COMMENT_LEN {
                return Err(invalid(params::COMMENT, v, "longer than 255 characters"));
            }
            p.comment = Some(v.to_string());
        }
        if let Some(v) = non_empty(params::CACHE_ENABLED) {
            p.cache_enabled = Some(
                v.to_lowercase()
                    .parse()
                    .map_err(|_| invalid(params::CACHE_ENABLED, v, "must be true or false"))?,
            );
        }
        p.fqdn = non_empty(params::FQDN).map(str::to_string);
        if let Some(v) = non_empty(params::CLIENT_MOUNT_OPTIONS) {
            p.client_mount_options = split_list(v);
        }

        Ok(p)
    }

    /// Decide the backing for a volume of `mode`.
    ///
    /// Block volumes and filesystems other than NFS live as files in a
    /// backing share, which must then be configured.
    pub fn backing_for(&self, mode: VolumeMode) -> Result<(Backing, Option<&str>), ParamError> {
        match mode {
            VolumeMode::Block => self
                .block_backing_share
                .as_deref()
                .map(|s| (Backing::File, Some(s)))
                .ok_or_else(|| {
                    invalid(
                        params::BLOCK_BACKING_SHARE_NAME,
                        "",
                        "required for block volumes",
                    )
                }),
            VolumeMode::Filesystem if self.fs_type == FS_TYPE_NFS => Ok((Backing::Share, None)),
            VolumeMode::Filesystem => self
                .mount_backing_share
                .as_deref()
                .map(|s| (Backing::File, Some(s)))
                .ok_or_else(|| {
                    invalid(
                        params::MOUNT_BACKING_SHARE_NAME,
                        "",
                        "required for non-NFS filesystem volumes",
                    )
                }),
        }
    }
}

// ============================================================================
// VolumePath
// ============================================================================

/// Canonical backend path of a volume, also its CSI volume id.
///
/// `/{name}` for share-backed volumes, `/{backingShare}/{name}` for
/// file-backed ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VolumePath {
    Share { name: String },
    File { share: String, name: String },
}

impl VolumePath {
    pub fn share(name: impl Into<String>) -> Self {
        VolumePath::Share { name: name.into() }
    }

    pub fn file(share: impl Into<String>, name: impl Into<String>) -> Self {
        VolumePath::File {
            share: share.into(),
            name: name.into(),
        }
    }

    pub fn backing(&self) -> Backing {
        match self {
            VolumePath::Share { .. } => Backing::Share,
            VolumePath::File { .. } => Backing::File,
        }
    }

    /// Share that holds the volume's data.
    pub fn share_name(&self) -> &str {
        match self {
            VolumePath::Share { name } => name,
            VolumePath::File { share, .. } => share,
        }
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        match self {
            VolumePath::Share { name } | VolumePath::File { name, .. } => name,
        }
    }
}

impl Display for VolumePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumePath::Share { name } => write!(f, "/{}", name),
            VolumePath::File { share, name } => write!(f, "/{}/{}", share, name),
        }
    }
}

impl FromStr for VolumePath {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParamError::Identifier(format!("malformed volume id '{}'", s));
        let rest = s.strip_prefix('/').ok_or_else(malformed)?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
            return Err(malformed());
        }
        match parts.as_slice() {
            [name] => Ok(VolumePath::share(*name)),
            [share, name] => Ok(VolumePath::file(*share, *name)),
            _ => Err(malformed()),
        }
    }
}

// ============================================================================
// SnapshotId
// ============================================================================

/// Composite snapshot identifier `{backendName}|{sourcePath}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    name: String,
    source_path: String,
}

impl SnapshotId {
    pub const DELIMITER: char = '|';

    pub fn new(name: impl Into<String>, source_path: impl Into<String>) -> Result<Self, ParamError> {
        let name = name.into();
        let source_path = source_path.into();
        if name.is_empty() || source_path.is_empty() {
            return Err(ParamError::Identifier(
                "snapshot name and source path must be non-empty".to_string(),
            ));
        }
        if name.contains(Self::DELIMITER) || source_path.contains(Self::DELIMITER) {
            return Err(ParamError::Identifier(format!(
                "snapshot name and source path must not contain '{}'",
                Self::DELIMITER
            )));
        }
        Ok(Self { name, source_path })
    }

    /// Backend snapshot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the snapshotted share or file.
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Last component of the source path.
    pub fn source_name(&self) -> &str {
        self.source_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.source_path)
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, Self::DELIMITER, self.source_path)
    }
}

impl FromStr for SnapshotId {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(Self::DELIMITER).collect();
        match parts.as_slice() {
            [name, path] => SnapshotId::new(*name, *path),
            _ => Err(ParamError::Identifier(format!(
                "malformed snapshot id '{}': expected 'name|path'",
                s
            ))),
        }
    }
}

// ============================================================================
// VolumeContext
// ============================================================================

/// Data-path hints published with a volume so the node needs no backend
/// round-trip to decide how to attach it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeContext {
    pub mode: VolumeMode,
    pub backing: Backing,
    pub fs_type: String,
    pub backing_share: Option<String>,
    pub fqdn: Option<String>,
    pub client_mount_options: Vec<String>,
}

impl VolumeContext {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(context::MODE.to_string(), self.mode.to_string());
        map.insert(context::BACKING.to_string(), self.backing.to_string());
        map.insert(context::FS_TYPE.to_string(), self.fs_type.clone());
        if let Some(share) = &self.backing_share {
            map.insert(context::BACKING_SHARE_NAME.to_string(), share.clone());
        }
        if let Some(fqdn) = &self.fqdn {
            map.insert(context::FQDN.to_string(), fqdn.clone());
        }
        if !self.client_mount_options.is_empty() {
            map.insert(
                context::CLIENT_MOUNT_OPTIONS.to_string(),
                self.client_mount_options.join(","),
            );
        }
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ParamError> {
        let get = |key: &str| map.get(key).map(String::as_str).unwrap_or("");
        let non_empty = |key: &str| Some(get(key)).filter(|v| !v.is_empty()).map(str::to_string);

        Ok(Self {
            mode: get(context::MODE).parse()?,
            backing: get(context::BACKING).parse()?,
            fs_type: non_empty(context::FS_TYPE).unwrap_or_else(|| FS_TYPE_NFS.to_string()),
            backing_share: non_empty(context::BACKING_SHARE_NAME),
            fqdn: non_empty(context::FQDN),
            client_mount_options: split_list(get(context::CLIENT_MOUNT_OPTIONS)),
        })
    }
}

/// Validate a volume or snapshot name supplied by the CO.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), ParamError> {
    if name.is_empty() {
        return Err(invalid(kind, name, "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid(kind, name, "longer than 255 bytes"));
    }
    if name.contains('/') || name.contains(SnapshotId::DELIMITER) {
        return Err(invalid(kind, name, "must not contain '/' or '|'"));
    }
    Ok(())
}
