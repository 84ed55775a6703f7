//! Leaving the filesystems clean before power-off.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, info, warn};

use crate::config::{UNMOUNT_POLL_ATTEMPTS, UNMOUNT_POLL_INTERVAL, paths};
use crate::error::{InitError, JoinedError, Result};
use crate::fs::Fs;

/// Mount points ordered so nested mounts come before their parents.
pub fn unmount_order(mounts: &[PathBuf]) -> Vec<PathBuf> {
    let mut ordered = mounts.to_vec();
    ordered.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    ordered
}

/// Mount points listed in `/proc/mounts` contents.
pub fn parse_mount_points(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// The kernel escapes space, tab, newline and backslash as `\NNN`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while let Some(&b) = bytes.get(i) {
        if b == b'\\'
            && let Some(code) = bytes
                .get(i + 1..i + 4)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(b);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn remount_root_readonly() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(InitError::sys("remount read-only", "/"))
}

/// Remount the root read-only, lazily unmount `mounts` deepest first, flush,
/// and wait (bounded) for the mounts to leave the mount table.
///
/// Every step is attempted; the result lists whatever failed.
pub async fn finalize(fs: &dyn Fs, mounts: &[PathBuf]) -> Result<(), JoinedError> {
    let mut errors = Vec::new();
    if let Err(e) = remount_root_readonly() {
        errors.push(e);
    }
    for point in unmount_order(mounts) {
        debug!(mount = %point.display(), "unmount");
        if let Err(e) = umount2(&point, MntFlags::MNT_DETACH) {
            errors.push(InitError::sys("umount", point.display())(e));
        }
    }
    nix::unistd::sync();

    if !wait_unmounted(fs, mounts).await {
        warn!("mounts still present, powering off anyway");
    }
    JoinedError::check(errors)
}

async fn wait_unmounted(fs: &dyn Fs, mounts: &[PathBuf]) -> bool {
    if mounts.is_empty() {
        return true;
    }
    for _ in 0..UNMOUNT_POLL_ATTEMPTS {
        let table = match fs.read_to_string(Path::new(paths::PROC_MOUNTS)) {
            Ok(table) => parse_mount_points(&table),
            Err(e) => {
                warn!(error = %e, "cannot read mount table");
                return false;
            }
        };
        if !mounts.iter().any(|m| table.contains(m)) {
            info!("volumes unmounted");
            return true;
        }
        tokio::time::sleep(UNMOUNT_POLL_INTERVAL).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;

    fn points(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn deepest_mounts_first() {
        assert_eq!(
            unmount_order(&points(&["/a", "/a/b/c", "/data", "/a/b"])),
            points(&["/a/b/c", "/a/b", "/data", "/a"])
        );
    }

    #[test]
    fn mount_table_unescapes_paths() {
        let table = "\
/dev/root / ext4 ro,relatime 0 0
/dev/nvme1n1 /mnt/my\\040data ext4 rw 0 0
proc /proc proc rw,nosuid 0 0
";
        assert_eq!(
            parse_mount_points(table),
            points(&["/", "/mnt/my data", "/proc"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_when_mounts_are_gone() {
        let fs = MemFs::new();
        fs.add_file(paths::PROC_MOUNTS, "/dev/root / ext4 ro 0 0\n").unwrap();
        assert!(wait_unmounted(&fs, &points(&["/data"])).await);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_eventually() {
        let fs = MemFs::new();
        fs.add_file(paths::PROC_MOUNTS, "/dev/sdf /data ext4 rw 0 0\n").unwrap();
        assert!(!wait_unmounted(&fs, &points(&["/data"])).await);
    }
}
