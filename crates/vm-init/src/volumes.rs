//! Volume provisioning.
//!
//! Volumes are provisioned strictly in declaration order so later mounts
//! can nest inside earlier ones. Block devices are formatted on first use
//! and mounted; remote sources are materialised as files.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use nix::mount::{MsFlags, mount};
use tracing::{info, warn};
use vm_spec::{EbsVolume, Mount, VolumeDecl, VolumeSource};

use crate::command;
use crate::config::paths;
use crate::error::{InitError, Result};
use crate::fs::Fs;
use crate::reaper::{ExitStatus, Reaper};
use crate::remote::{RemoteEntry, RemoteError, Remotes};

/// Block-device operations behind EBS provisioning.
#[async_trait]
pub trait DiskTools: Send + Sync {
    /// Whether `device` already carries a filesystem signature.
    async fn has_filesystem(&self, device: &Path) -> Result<bool>;

    async fn make_filesystem(&self, mkfs: &Path, device: &Path) -> Result<()>;

    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> Result<()>;
}

/// [`DiskTools`] backed by the helper binaries shipped in the image.
#[derive(Debug, Clone)]
pub struct SystemDiskTools {
    reaper: Reaper,
}

impl SystemDiskTools {
    pub fn new(reaper: Reaper) -> Self {
        Self { reaper }
    }
}

#[async_trait]
impl DiskTools for SystemDiskTools {
    async fn has_filesystem(&self, device: &Path) -> Result<bool> {
        // blkid exits 2 when it finds no signature.
        let (status, stderr) = command::status(&self.reaper, paths::BLKID, &[device]).await?;
        match status {
            ExitStatus::Exited(0) => Ok(true),
            ExitStatus::Exited(2) => Ok(false),
            other => Err(command::CommandError {
                command: format!("{} {}", paths::BLKID, device.display()),
                detail: format!("{other}: {stderr}"),
            }
            .into()),
        }
    }

    async fn make_filesystem(&self, mkfs: &Path, device: &Path) -> Result<()> {
        command::exec(&self.reaper, &mkfs.to_string_lossy(), &[device]).await?;
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> Result<()> {
        mount(
            Some(device),
            target,
            Some(fs_type),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(InitError::sys("mount", target.display()))
    }
}

pub struct Provisioner<'a> {
    fs: &'a dyn Fs,
    remotes: &'a Remotes,
    tools: &'a dyn DiskTools,
}

impl<'a> Provisioner<'a> {
    pub fn new(fs: &'a dyn Fs, remotes: &'a Remotes, tools: &'a dyn DiskTools) -> Self {
        Self { fs, remotes, tools }
    }

    /// Provision every volume in order. Block-device mount points are
    /// pushed onto `mounted` as they are made, so the caller can unmount
    /// them at shutdown even when a later volume fails.
    pub async fn provision(&self, volumes: &[VolumeDecl], mounted: &mut Vec<PathBuf>) -> Result<()> {
        for (index, decl) in volumes.iter().enumerate() {
            let source = decl
                .source()
                .map_err(|e| e.at(format!("volumes[{index}]")))?;
            let destination = &source.mount().destination;
            info!(kind = source.kind(), destination, "provisioning volume");
            match source {
                VolumeSource::Ebs(ebs) => mounted.push(self.ebs(ebs).await?),
                VolumeSource::Ssm(ssm) => {
                    let tree = self.remotes.parameters.fetch_tree(&ssm.path).await;
                    self.materialise_tree(tree, ssm.optional, &ssm.mount)?;
                }
                VolumeSource::S3(s3) => {
                    let root = format!("{}/{}", s3.bucket, s3.key_prefix);
                    let tree = self.remotes.objects.fetch_tree(&root).await;
                    self.materialise_tree(tree, s3.optional, &s3.mount)?;
                }
                VolumeSource::SecretsManager(secret) => {
                    match self.remotes.secrets.fetch_bytes(&secret.secret_id).await {
                        Ok(data) => self.write_secret(&data, &secret.mount)?,
                        Err(e) if secret.optional => {
                            warn!(error = %e, "skipping optional secret volume");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }

    async fn ebs(&self, ebs: &EbsVolume) -> Result<PathBuf> {
        if ebs.device.is_empty() {
            return Err(InitError::MissingField { field: "ebs.device" });
        }
        if ebs.fs_type.is_empty() {
            return Err(InitError::MissingField { field: "ebs.fs-type" });
        }
        if ebs.mount.destination.is_empty() {
            return Err(InitError::MissingField {
                field: "ebs.mount.destination",
            });
        }
        let device = Path::new(&ebs.device);
        let target = PathBuf::from(&ebs.mount.destination);

        self.make_dir(&target, &ebs.mount)?;

        if !self.tools.has_filesystem(device).await? {
            let mkfs = Path::new(paths::SBIN_DIR).join(format!("mkfs.{}", ebs.fs_type));
            if !self.fs.exists(&mkfs) {
                return Err(InitError::UnsupportedFilesystem(ebs.fs_type.clone()));
            }
            info!(device = %device.display(), fs_type = ebs.fs_type, "creating filesystem");
            self.tools.make_filesystem(&mkfs, device).await?;
        }
        self.tools.mount(device, &target, &ebs.fs_type)?;
        Ok(target)
    }

    fn materialise_tree(
        &self,
        tree: Result<Vec<RemoteEntry>, RemoteError>,
        optional: bool,
        mount: &Mount,
    ) -> Result<()> {
        let entries = match tree {
            Ok(entries) => entries,
            Err(e) if optional => {
                warn!(error = %e, "skipping optional volume");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let root = PathBuf::from(&mount.destination);
        let file_mode = mount.mode()? & 0o666;
        self.make_dir(&root, mount)?;
        for entry in entries {
            let Some(relative) = relative_path(&entry.path) else {
                warn!(path = entry.path, "skipping entry with unsafe path");
                continue;
            };
            let path = root.join(relative);
            let mut dir = root.clone();
            if let Some(parent) = relative.parent() {
                for part in parent.components() {
                    dir.push(part);
                    self.make_dir(&dir, mount)?;
                }
            }
            self.write_owned(&path, &entry.data, file_mode, mount)?;
        }
        Ok(())
    }

    fn write_secret(&self, data: &[u8], mount: &Mount) -> Result<()> {
        let path = Path::new(&mount.destination);
        if let Some(parent) = path.parent() {
            self.fs
                .create_dir_all(parent, vm_spec::DEFAULT_MOUNT_MODE)
                .map_err(InitError::io(parent))?;
        }
        let mode = if mount.mode.is_some() {
            mount.mode()?
        } else {
            0o600
        };
        self.write_owned(path, data, mode, mount)
    }

    fn make_dir(&self, dir: &Path, mount: &Mount) -> Result<()> {
        self.fs
            .create_dir_all(dir, mount.mode()?)
            .map_err(InitError::io(dir))?;
        self.fs
            .chown(dir, mount.uid(), mount.gid())
            .map_err(InitError::io(dir))
    }

    fn write_owned(&self, path: &Path, data: &[u8], mode: u32, mount: &Mount) -> Result<()> {
        self.fs
            .write_file(path, data, mode)
            .map_err(InitError::io(path))?;
        self.fs
            .chown(path, mount.uid(), mount.gid())
            .map_err(InitError::io(path))
    }
}

/// A remote entry path as a relative path that stays below its root.
fn relative_path(raw: &str) -> Option<&Path> {
    let path = Path::new(raw.trim_start_matches('/'));
    let safe = path.components().all(|c| matches!(c, Component::Normal(_)));
    (safe && path.file_name().is_some()).then_some(path)
}
