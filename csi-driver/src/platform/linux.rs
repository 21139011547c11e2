//! Linux implementation of the host operations
//!
//! Uses Linux tools:
//! - mount/umount for NFS, image and bind mounts
//! - losetup for loop devices
//! - mkfs.ext4/mkfs.xfs, resize2fs/xfs_growfs for filesystems
//! - showmount/rpcinfo for NFS export listing and liveness checks
//! - df/blockdev for usage statistics

use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{
    FsStats, HostOps, LoopDevice, PathType, PlatformError, PlatformResult, validate_host,
    validate_path,
};

/// Host operations backed by the Linux userland.
#[derive(Debug, Default, Clone)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }
}

/// Run a command and return its output regardless of exit status.
async fn exec(program: &str, args: &[&str]) -> PlatformResult<Output> {
    debug!(program, ?args, "Executing");
    Command::new(program).args(args).output().await.map_err(|e| {
        error!(error = %e, program, "Failed to execute");
        PlatformError::Io(e)
    })
}

/// Run a command and fail on a non-zero exit status.
async fn run(program: &str, args: &[&str]) -> PlatformResult<String> {
    let output = exec(program, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!(stderr = %stderr, program, "Command failed");
        return Err(PlatformError::CommandFailed {
            command: program.to_string(),
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Deserialize)]
struct LosetupList {
    #[serde(default)]
    loopdevices: Vec<LosetupEntry>,
}

#[derive(Deserialize)]
struct LosetupEntry {
    name: String,
    #[serde(rename = "back-file")]
    back_file: Option<String>,
}

/// Parse `losetup --json --list` output.
fn parse_losetup_json(json: &str) -> PlatformResult<Vec<LoopDevice>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let list: LosetupList =
        serde_json::from_str(json).map_err(|e| PlatformError::Parse(e.to_string()))?;
    Ok(list
        .loopdevices
        .into_iter()
        .filter_map(|entry| {
            let back_file = entry.back_file?;
            // A backing file removed while attached is reported with a suffix
            let back_file = back_file
                .strip_suffix(" (deleted)")
                .unwrap_or(&back_file)
                .to_string();
            Some(LoopDevice {
                device: entry.name,
                backing_file: back_file,
            })
        })
        .collect())
}

/// Parse `showmount -e --no-headers` output into export paths.
fn parse_showmount(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|path| path.starts_with('/'))
        .map(str::to_string)
        .collect()
}

/// Parse `df --output=size,used,avail,itotal,iused,iavail -B1` output.
fn parse_df(output: &str) -> PlatformResult<FsStats> {
    let line = output
        .lines()
        .nth(1)
        .ok_or_else(|| PlatformError::Parse("df printed no data line".into()))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .map(|v| v.parse::<u64>().unwrap_or(0))
        .collect();
    let [total, used, avail, itotal, iused, ifree] = values.as_slice() else {
        return Err(PlatformError::Parse(format!("unexpected df line: {}", line)));
    };
    Ok(FsStats {
        total_bytes: *total,
        used_bytes: *used,
        available_bytes: *avail,
        total_inodes: *itotal,
        used_inodes: *iused,
        free_inodes: *ifree,
    })
}

fn mounted_in(mounts: &str, target: &str) -> bool {
    mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(target))
}

/// Targets in `/proc/self/mountinfo` content that use `device`.
///
/// A filesystem on the device lists it as the mount source. A bind mount of
/// the device node shows up as devtmpfs with the node as its root.
fn device_mounts_in(mountinfo: &str, device: &str) -> Vec<String> {
    let node = device.strip_prefix("/dev");
    mountinfo
        .lines()
        .filter_map(|line| {
            let (mount, fs) = line.split_once(" - ")?;
            let mount: Vec<&str> = mount.split_whitespace().collect();
            let (root, target) = (*mount.get(3)?, *mount.get(4)?);
            let mut fs = fs.split_whitespace();
            let fs_type = fs.next()?;
            let source = fs.next()?;

            let uses = source == device || (fs_type == "devtmpfs" && node == Some(root));
            uses.then(|| target.to_string())
        })
        .collect()
}

#[async_trait]
impl HostOps for LinuxHost {
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> PlatformResult<()> {
        validate_path(target)?;
        info!(source = %source, target = %target, fs_type = %fs_type, ?options, "Mounting");

        tokio::fs::create_dir_all(target).await.map_err(|e| {
            error!(error = %e, "Failed to create mount target directory");
            PlatformError::Io(e)
        })?;

        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, target]);
        run("mount", &args).await?;
        Ok(())
    }

    async fn bind_mount(&self, source: &str, target: &str, read_only: bool) -> PlatformResult<()> {
        validate_path(source)?;
        validate_path(target)?;
        info!(source = %source, target = %target, read_only, "Creating bind mount");

        if tokio::fs::metadata(source).await?.is_dir() {
            tokio::fs::create_dir_all(target).await?;
        } else {
            if let Some(parent) = Path::new(target).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if tokio::fs::metadata(target).await.is_err() {
                tokio::fs::File::create(target).await?;
            }
        }

        run("mount", &["--bind", source, target]).await?;
        if read_only {
            run("mount", &["-o", "remount,bind,ro", target]).await?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &str) -> PlatformResult<()> {
        validate_path(target)?;
        info!(target = %target, "Unmounting");

        if !self.is_mounted(target).await? {
            debug!(target = %target, "Path is not mounted, skipping unmount");
            return Ok(());
        }

        let output = exec("umount", &[target]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Treat "not mounted" as success
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target, "Path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(PlatformError::CommandFailed {
                command: "umount".into(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn is_mounted(&self, target: &str) -> PlatformResult<bool> {
        let target = target.trim_end_matches('/');
        if let Ok(mounts) = tokio::fs::read_to_string("/proc/mounts").await {
            return Ok(mounted_in(&mounts, target));
        }

        // Fallback to mount command
        let stdout = run("mount", &[]).await?;
        Ok(stdout
            .lines()
            .any(|line| line.split(" on ").nth(1).and_then(|r| r.split(' ').next()) == Some(target)))
    }

    async fn device_mounts(&self, device: &str) -> PlatformResult<Vec<String>> {
        let mountinfo = tokio::fs::read_to_string("/proc/self/mountinfo").await?;
        Ok(device_mounts_in(&mountinfo, device))
    }

    async fn attach_loop_device(&self, file: &str) -> PlatformResult<String> {
        validate_path(file)?;

        if let Some(existing) = self
            .list_loop_devices()
            .await?
            .into_iter()
            .find(|l| l.backing_file == file)
        {
            debug!(file = %file, device = %existing.device, "Loop device already attached");
            return Ok(existing.device);
        }

        let device = run("losetup", &["--find", "--show", file])
            .await?
            .trim()
            .to_string();
        if device.is_empty() {
            return Err(PlatformError::Parse("losetup returned no device".into()));
        }
        info!(file = %file, device = %device, "Attached loop device");
        Ok(device)
    }

    async fn detach_loop_device(&self, device: &str) -> PlatformResult<()> {
        validate_path(device)?;
        info!(device = %device, "Detaching loop device");
        run("losetup", &["-d", device]).await?;
        Ok(())
    }

    async fn refresh_loop_device(&self, device: &str) -> PlatformResult<()> {
        validate_path(device)?;
        run("losetup", &["-c", device]).await?;
        Ok(())
    }

    async fn list_loop_devices(&self) -> PlatformResult<Vec<LoopDevice>> {
        let stdout = run("losetup", &["--json", "--list"]).await?;
        parse_losetup_json(&stdout)
    }

    async fn format_device(&self, device: &str, fs_type: &str) -> PlatformResult<()> {
        validate_path(device)?;
        info!(device = %device, fs_type = %fs_type, "Formatting device");

        match fs_type.to_lowercase().as_str() {
            // -F/-f to force (don't prompt)
            "ext4" => run("mkfs.ext4", &["-F", device]).await?,
            "ext3" => run("mkfs.ext3", &["-F", device]).await?,
            "xfs" => run("mkfs.xfs", &["-f", device]).await?,
            other => {
                return Err(PlatformError::CommandFailed {
                    command: "mkfs".into(),
                    stderr: format!("unsupported filesystem type: {}", other),
                });
            }
        };
        Ok(())
    }

    async fn grow_filesystem(&self, device: &str, mount_path: &str) -> PlatformResult<()> {
        validate_path(device)?;
        validate_path(mount_path)?;

        let fs_type = run("blkid", &["-o", "value", "-s", "TYPE", device])
            .await?
            .trim()
            .to_string();
        info!(device = %device, fs_type = %fs_type, "Growing filesystem");

        match fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => run("resize2fs", &[device]).await?,
            "xfs" => run("xfs_growfs", &[mount_path]).await?,
            other => {
                return Err(PlatformError::CommandFailed {
                    command: "grow".into(),
                    stderr: format!("cannot grow filesystem type '{}'", other),
                });
            }
        };
        Ok(())
    }

    async fn allocate_file(&self, path: &str, size: u64) -> PlatformResult<()> {
        validate_path(path)?;
        info!(path = %path, size, "Allocating file");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> PlatformResult<()> {
        validate_path(path)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path, "Removed file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_size(&self, path: &str) -> PlatformResult<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_nfs_exports(&self, host: &str) -> PlatformResult<Vec<String>> {
        validate_host(host)?;
        let stdout = run("showmount", &["-e", "--no-headers", host]).await?;
        Ok(parse_showmount(&stdout))
    }

    async fn nfs_service_alive(&self, host: &str) -> bool {
        if validate_host(host).is_err() {
            return false;
        }
        match exec("rpcinfo", &["-t", host, "nfs"]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(host = %host, error = %e, "rpcinfo unavailable");
                false
            }
        }
    }

    async fn resolve_host(&self, host: &str) -> PlatformResult<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }

    async fn filesystem_stats(&self, path: &str) -> PlatformResult<FsStats> {
        validate_path(path)?;
        let stdout = run(
            "df",
            &["--output=size,used,avail,itotal,iused,iavail", "-B1", path],
        )
        .await?;
        parse_df(&stdout)
    }

    async fn block_device_size(&self, device: &str) -> PlatformResult<u64> {
        validate_path(device)?;
        let stdout = run("blockdev", &["--getsize64", device]).await?;
        stdout
            .trim()
            .parse()
            .map_err(|_| PlatformError::Parse(format!("blockdev size '{}'", stdout.trim())))
    }

    async fn path_type(&self, path: &str) -> PlatformResult<PathType> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(PathType::Directory),
            Ok(_) => Ok(PathType::Other),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(PathType::Missing),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_mount_point(&self, path: &str) -> PlatformResult<()> {
        validate_path(path)?;
        let result = match self.path_type(path).await? {
            PathType::Missing => return Ok(()),
            PathType::Directory => tokio::fs::remove_dir(path).await,
            PathType::Other => tokio::fs::remove_file(path).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
