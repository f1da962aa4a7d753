//! Host-side disk primitives.
//!
//! The [`DiskPlugger`] trait is the seam between the CSI node pipeline
//! and the kernel: resolving attached devices, probing and creating
//! filesystems, mounting and unmounting. [`RealDiskPlugger`] shells out
//! to the usual host utilities; [`FakeDiskPlugger`] records calls so
//! the whole mount pipeline is testable without root.

use crate::BYTES_PER_GIGABYTE;

use async_trait::async_trait;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Directory of stable device symlinks maintained by udev.
const DEFAULT_DEVICE_DIR: &str = "/dev/disk/by-id";

/// blkid exit status meaning "no filesystem found".
const BLKID_NO_FILESYSTEM: i32 = 2;

/// Capacity usage of a mounted filesystem, from statfs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeStatistics {
    pub available_bytes: i64,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_inodes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
}

#[derive(Debug, Error)]
pub enum PluggerError {
    #[error("path to check is empty")]
    EmptyPath,

    #[error("`{command}` not found in $PATH")]
    MissingExecutable { command: String },

    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    /// The mount point exists in the mount table but the filesystem
    /// behind it is gone (stale NFS handle, dead device).
    #[error("mount point {path} is corrupted")]
    CorruptedMount { path: String },

    #[error("device {path} must be formatted before its filesystem can be expanded")]
    NotFormatted { path: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PluggerError {
    /// True when the underlying path does not exist.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, PluggerError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// True for a detected corrupted-mount condition, which callers
    /// treat as "mounted" for unmount purposes.
    pub fn is_corrupted_mount(&self) -> bool {
        matches!(self, PluggerError::CorruptedMount { .. })
    }
}

/// Host operations needed to turn an attached block device into a
/// usable mount, expressed as a capability set so the node pipeline can
/// be driven against a fake in tests.
#[async_trait]
pub trait DiskPlugger: Send + Sync {
    /// Resolves a volume id to its device path, or an empty string when
    /// no device for that id is currently attached. A non-empty path is
    /// the signal that the provider-side attach has reached the kernel.
    async fn path_for_volume(&self, volume_id: &str) -> String;

    /// Probes the device for an existing filesystem.
    async fn is_formatted(&self, path: &str) -> Result<bool, PluggerError>;

    /// Creates `filesystem` on the device and verifies it took.
    async fn format(&self, path: &str, filesystem: &str) -> Result<(), PluggerError>;

    /// Grows the existing filesystem to fill the device.
    async fn expand_filesystem(&self, path: &str) -> Result<(), PluggerError>;

    /// Checks whether `path` is a mount point.
    async fn is_mounted(&self, path: &str) -> Result<bool, PluggerError>;

    /// Mounts `path` on `mountpoint`. An empty `filesystem` performs a
    /// bind mount onto a file; otherwise a typed mount onto a
    /// directory. Verifies the mount afterwards.
    async fn mount(
        &self,
        path: &str,
        mountpoint: &str,
        filesystem: &str,
        flags: &[&str],
    ) -> Result<(), PluggerError>;

    /// Unmounts `mountpoint`; a no-op when it is not mounted.
    async fn unmount(&self, mountpoint: &str) -> Result<(), PluggerError>;

    /// Returns capacity statistics for a mounted path.
    async fn get_statistics(&self, volume_path: &str)
        -> Result<VolumeStatistics, PluggerError>;
}

/// Runs a host command, mapping a missing binary to its own error kind.
async fn run_command(command: &str, args: &[&str]) -> Result<std::process::Output, PluggerError> {
    Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PluggerError::MissingExecutable {
                command: command.to_string(),
            },
            _ => PluggerError::Io(e),
        })
}

fn command_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{}{}", stdout, stderr).trim().to_string()
}

/// [`DiskPlugger`] backed by the host's blkid, mkfs, mount, umount,
/// resize2fs, findmnt and statfs.
#[derive(Debug, Clone)]
pub struct RealDiskPlugger {
    device_dir: PathBuf,
}

impl Default for RealDiskPlugger {
    fn default() -> Self {
        RealDiskPlugger {
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
        }
    }
}

impl RealDiskPlugger {
    pub fn new() -> Self {
        RealDiskPlugger::default()
    }

    /// Uses `device_dir` instead of `/dev/disk/by-id` for device
    /// resolution.
    pub fn with_device_dir(device_dir: impl AsRef<Path>) -> Self {
        RealDiskPlugger {
            device_dir: device_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DiskPlugger for RealDiskPlugger {
    async fn path_for_volume(&self, volume_id: &str) -> String {
        let Ok(mut entries) = tokio::fs::read_dir(&self.device_dir).await else {
            return String::new();
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().ends_with(volume_id) {
                return entry.path().to_string_lossy().into_owned();
            }
        }
        String::new()
    }

    async fn is_formatted(&self, path: &str) -> Result<bool, PluggerError> {
        debug!(path, "Checking if path is formatted");
        if path.is_empty() {
            return Err(PluggerError::EmptyPath);
        }

        let output = run_command("blkid", &[path]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(BLKID_NO_FILESYSTEM) => {
                debug!(path, "Path is not formatted");
                Ok(false)
            }
            _ => Err(PluggerError::CommandFailed {
                command: format!("blkid {}", path),
                detail: command_output(&output),
            }),
        }
    }

    async fn format(&self, path: &str, filesystem: &str) -> Result<(), PluggerError> {
        debug!(path, filesystem, "Formatting");
        let command = format!("mkfs.{}", filesystem);
        let output = run_command(&command, &[path]).await?;
        if !output.status.success() {
            return Err(PluggerError::CommandFailed {
                command: format!("{} {}", command, path),
                detail: command_output(&output),
            });
        }

        if !self.is_formatted(path).await? {
            return Err(PluggerError::CommandFailed {
                command: format!("{} {}", command, path),
                detail: "device still reports no filesystem after formatting".to_string(),
            });
        }
        Ok(())
    }

    async fn expand_filesystem(&self, path: &str) -> Result<(), PluggerError> {
        debug!(path, "Resizing filesystem");
        if !self.is_formatted(path).await? {
            return Err(PluggerError::NotFormatted {
                path: path.to_string(),
            });
        }

        let output = run_command("resize2fs", &[path]).await?;
        debug!(output = %command_output(&output), "resize2fs command output");
        if !output.status.success() {
            return Err(PluggerError::CommandFailed {
                command: format!("resize2fs {}", path),
                detail: command_output(&output),
            });
        }
        Ok(())
    }

    async fn is_mounted(&self, path: &str) -> Result<bool, PluggerError> {
        debug!(path, "Checking if path is mounted");
        if path.is_empty() {
            return Err(PluggerError::EmptyPath);
        }

        // A mount whose backing filesystem has gone away still shows up
        // in the mount table but errors on access.
        match tokio::fs::metadata(path).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) if is_corrupted_mount_errno(&e) => {
                return Err(PluggerError::CorruptedMount {
                    path: path.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        let output = run_command("findmnt", &["-M", path]).await?;
        if output.status.success() {
            return Ok(true);
        }
        if command_output(&output).is_empty() {
            debug!(path, "Path is not mounted");
            return Ok(false);
        }
        Err(PluggerError::CommandFailed {
            command: format!("findmnt -M {}", path),
            detail: command_output(&output),
        })
    }

    async fn mount(
        &self,
        path: &str,
        mountpoint: &str,
        filesystem: &str,
        flags: &[&str],
    ) -> Result<(), PluggerError> {
        debug!(path, mountpoint, filesystem, "Mounting");
        let mut args: Vec<String> = Vec::new();

        if filesystem.is_empty() {
            // Bind-mounting needs a file to bind to.
            if let Some(parent) = Path::new(mountpoint).parent() {
                create_dir_with_mode(parent, 0o750).await?;
            }
            let file = tokio::fs::File::create(mountpoint).await?;
            file.sync_all().await.ok();
            tokio::fs::set_permissions(mountpoint, std::fs::Permissions::from_mode(0o660))
                .await?;
        } else {
            // Typed mounts need a directory to mount onto.
            create_dir_with_mode(Path::new(mountpoint), 0o750).await?;
            args.push("-t".to_string());
            args.push(filesystem.to_string());
        }

        if !flags.is_empty() {
            args.push("-o".to_string());
            args.push(flags.join(","));
        }
        args.push(path.to_string());
        args.push(mountpoint.to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_command("mount", &arg_refs).await?;
        if !output.status.success() {
            return Err(PluggerError::CommandFailed {
                command: format!("mount {}", args.join(" ")),
                detail: command_output(&output),
            });
        }

        if !self.is_mounted(mountpoint).await? {
            return Err(PluggerError::CommandFailed {
                command: format!("mount {}", args.join(" ")),
                detail: "mount point missing from the mount table after mounting".to_string(),
            });
        }
        debug!(path, mountpoint, "Mounting succeeded");
        Ok(())
    }

    async fn unmount(&self, mountpoint: &str) -> Result<(), PluggerError> {
        debug!(mountpoint, "Unmounting mountpoint");
        if !self.is_mounted(mountpoint).await? {
            return Ok(());
        }

        let output = run_command("umount", &[mountpoint]).await?;
        if !output.status.success() {
            return Err(PluggerError::CommandFailed {
                command: format!("umount {}", mountpoint),
                detail: command_output(&output),
            });
        }
        Ok(())
    }

    async fn get_statistics(
        &self,
        volume_path: &str,
    ) -> Result<VolumeStatistics, PluggerError> {
        let path = PathBuf::from(volume_path);
        let statfs = tokio::task::spawn_blocking(move || nix::sys::statfs::statfs(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .map_err(|e| PluggerError::Io(io::Error::from_raw_os_error(e as i32)))?;

        let block_size = statfs.block_size() as i64;
        Ok(VolumeStatistics {
            available_bytes: statfs.blocks_available() as i64 * block_size,
            total_bytes: statfs.blocks() as i64 * block_size,
            used_bytes: (statfs.blocks() as i64 - statfs.blocks_free() as i64) * block_size,
            available_inodes: statfs.files_free() as i64,
            total_inodes: statfs.files() as i64,
            used_inodes: statfs.files() as i64 - statfs.files_free() as i64,
        })
    }
}

fn is_corrupted_mount_errno(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc_errno)
            if libc_errno == nix::errno::Errno::ENOTCONN as i32
                || libc_errno == nix::errno::Errno::ESTALE as i32
                || libc_errno == nix::errno::Errno::EIO as i32
    )
}

async fn create_dir_with_mode(dir: &Path, mode: u32) -> Result<(), io::Error> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode)).await
}

/// In-memory [`DiskPlugger`] that records which operations ran.
#[derive(Debug, Default)]
pub struct FakeDiskPlugger {
    state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
struct FakeState {
    disk_attachment_missing: bool,
    formatted: bool,
    format_calls: usize,
    expand_called: bool,
    device: String,
    mountpoint: String,
    mounted: bool,
    mount_calls: usize,
    last_mount_flags: Vec<String>,
}

impl FakeDiskPlugger {
    pub fn new() -> Self {
        FakeDiskPlugger::default()
    }

    /// Simulates a volume whose provider-side attach has not reached
    /// the kernel yet.
    pub fn set_disk_attachment_missing(&self, missing: bool) {
        self.state.lock().unwrap().disk_attachment_missing = missing;
    }

    pub fn set_formatted(&self, formatted: bool) {
        self.state.lock().unwrap().formatted = formatted;
    }

    /// Marks `mountpoint` as currently mounted.
    pub fn set_mounted(&self, mountpoint: &str) {
        let mut state = self.state.lock().unwrap();
        state.mountpoint = mountpoint.to_string();
        state.mounted = true;
    }

    pub fn formatted(&self) -> bool {
        self.state.lock().unwrap().formatted
    }

    pub fn format_calls(&self) -> usize {
        self.state.lock().unwrap().format_calls
    }

    pub fn expand_called(&self) -> bool {
        self.state.lock().unwrap().expand_called
    }

    pub fn mounted(&self) -> bool {
        self.state.lock().unwrap().mounted
    }

    pub fn mountpoint(&self) -> String {
        self.state.lock().unwrap().mountpoint.clone()
    }

    pub fn mount_calls(&self) -> usize {
        self.state.lock().unwrap().mount_calls
    }

    pub fn last_mount_flags(&self) -> Vec<String> {
        self.state.lock().unwrap().last_mount_flags.clone()
    }
}

#[async_trait]
impl DiskPlugger for FakeDiskPlugger {
    async fn path_for_volume(&self, volume_id: &str) -> String {
        if self.state.lock().unwrap().disk_attachment_missing {
            return String::new();
        }
        format!("/fake-dev/disk/by-id/{}", volume_id)
    }

    async fn is_formatted(&self, _path: &str) -> Result<bool, PluggerError> {
        Ok(self.state.lock().unwrap().formatted)
    }

    async fn format(&self, path: &str, _filesystem: &str) -> Result<(), PluggerError> {
        let mut state = self.state.lock().unwrap();
        state.device = path.to_string();
        state.formatted = true;
        state.format_calls += 1;
        Ok(())
    }

    async fn expand_filesystem(&self, path: &str) -> Result<(), PluggerError> {
        let mut state = self.state.lock().unwrap();
        if !state.formatted {
            return Err(PluggerError::NotFormatted {
                path: path.to_string(),
            });
        }
        state.device = path.to_string();
        state.expand_called = true;
        Ok(())
    }

    async fn is_mounted(&self, path: &str) -> Result<bool, PluggerError> {
        let state = self.state.lock().unwrap();
        Ok(state.mounted && state.mountpoint == path)
    }

    async fn mount(
        &self,
        path: &str,
        mountpoint: &str,
        _filesystem: &str,
        flags: &[&str],
    ) -> Result<(), PluggerError> {
        let mut state = self.state.lock().unwrap();
        state.device = path.to_string();
        state.mountpoint = mountpoint.to_string();
        state.mounted = true;
        state.mount_calls += 1;
        state.last_mount_flags = flags.iter().map(|f| f.to_string()).collect();
        Ok(())
    }

    async fn unmount(&self, _mountpoint: &str) -> Result<(), PluggerError> {
        let mut state = self.state.lock().unwrap();
        state.mountpoint = String::new();
        state.mounted = false;
        Ok(())
    }

    async fn get_statistics(
        &self,
        _volume_path: &str,
    ) -> Result<VolumeStatistics, PluggerError> {
        Ok(VolumeStatistics {
            available_bytes: 3 * BYTES_PER_GIGABYTE,
            total_bytes: 10 * BYTES_PER_GIGABYTE,
            used_bytes: 7 * BYTES_PER_GIGABYTE,
            available_inodes: 3_000,
            total_inodes: 10_000,
            used_inodes: 7_000,
        })
    }
}
