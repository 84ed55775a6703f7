//! Kernel pseudo-filesystems.

use std::path::Path;

use nix::mount::{MsFlags, mount};
use tracing::{debug, warn};

use crate::config::paths;
use crate::error::{InitError, Result};
use crate::fs::Fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoMount {
    pub source: &'static str,
    pub target: String,
    pub fstype: &'static str,
    pub flags: MsFlags,
    pub data: Option<String>,
    /// Mode of the mount point when it has to be created.
    pub mode: u32,
}

impl PseudoMount {
    fn new(
        source: &'static str,
        target: &str,
        fstype: &'static str,
        flags: MsFlags,
        data: Option<&str>,
        mode: u32,
    ) -> Self {
        Self {
            source,
            target: target.to_string(),
            fstype,
            flags,
            data: data.map(str::to_string),
            mode,
        }
    }
}

fn nosuid_nodev() -> MsFlags {
    MsFlags::MS_NOSUID | MsFlags::MS_NODEV
}

fn nosuid_nodev_noexec() -> MsFlags {
    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC
}

/// Everything mounted before `/proc/cgroups` can be read.
pub fn base_catalog() -> Vec<PseudoMount> {
    vec![
        PseudoMount::new("proc", "/proc", "proc", nosuid_nodev_noexec(), None, 0o555),
        PseudoMount::new("sysfs", "/sys", "sysfs", nosuid_nodev_noexec(), None, 0o555),
        PseudoMount::new(
            "devpts",
            "/dev/pts",
            "devpts",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("gid=5,mode=0620,ptmxmode=0666"),
            0o755,
        ),
        PseudoMount::new("mqueue", "/dev/mqueue", "mqueue", nosuid_nodev_noexec(), None, 0o755),
        PseudoMount::new("shm", "/dev/shm", "tmpfs", nosuid_nodev(), Some("mode=1777"), 0o1777),
        PseudoMount::new("hugetlbfs", "/dev/hugepages", "hugetlbfs", nosuid_nodev(), None, 0o755),
        PseudoMount::new("tmpfs", "/run", "tmpfs", nosuid_nodev(), Some("mode=0755"), 0o755),
        PseudoMount::new(
            "cgroup_root",
            "/sys/fs/cgroup",
            "tmpfs",
            nosuid_nodev_noexec(),
            Some("mode=0755"),
            0o755,
        ),
    ]
}

/// One cgroup v1 hierarchy per enabled controller, then debugfs.
pub fn late_catalog(controllers: &[String]) -> Vec<PseudoMount> {
    controllers
        .iter()
        .map(|name| {
            PseudoMount::new(
                "cgroup",
                &format!("/sys/fs/cgroup/{name}"),
                "cgroup",
                nosuid_nodev_noexec(),
                Some(name),
                0o555,
            )
        })
        .chain(std::iter::once(PseudoMount::new(
            "debugfs",
            "/sys/kernel/debug",
            "debugfs",
            nosuid_nodev_noexec(),
            None,
            0o700,
        )))
        .collect()
}

/// Enabled controller names from `/proc/cgroups`.
pub fn parse_cgroups(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match (fields.first(), fields.get(3)) {
                (Some(name), Some(&"1")) => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

fn mount_one(fs: &dyn Fs, m: &PseudoMount) -> Result<()> {
    let target = Path::new(&m.target);
    fs.create_dir_all(target, m.mode)
        .map_err(InitError::io(target))?;
    debug!(target = m.target, fstype = m.fstype, "mount");
    mount(
        Some(m.source),
        target,
        Some(m.fstype),
        m.flags,
        m.data.as_deref(),
    )
    .map_err(InitError::sys("mount", &m.target))
}

/// Mount the pseudo-filesystems and create `/run/lock`.
pub fn mount_pseudo_filesystems(fs: &dyn Fs) -> Result<()> {
    for m in base_catalog() {
        mount_one(fs, &m)?;
    }
    fs.create_dir_all(Path::new("/run/lock"), 0o1777)
        .map_err(InitError::io("/run/lock"))?;

    let controllers = match fs.read_to_string(Path::new(paths::PROC_CGROUPS)) {
        Ok(contents) => parse_cgroups(&contents),
        Err(e) => {
            warn!(error = %e, "cannot list cgroup controllers");
            Vec::new()
        }
    };
    for m in late_catalog(&controllers) {
        mount_one(fs, &m)?;
    }
    Ok(())
}
