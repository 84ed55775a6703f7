//! Device and descriptor symlinks under `/dev`.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::paths;
use crate::error::{InitError, Result};
use crate::fs::Fs;

const FD_LINKS: [(&str, &str); 4] = [
    ("/proc/self/fd", "/dev/fd"),
    ("/proc/self/fd/0", "/dev/stdin"),
    ("/proc/self/fd/1", "/dev/stdout"),
    ("/proc/self/fd/2", "/dev/stderr"),
];

/// Create `/dev/fd` and the stdio links. Existing links are kept.
pub fn link_standard_fds(fs: &dyn Fs) -> Result<()> {
    for (target, link) in FD_LINKS {
        symlink_once(fs, Path::new(target), Path::new(link))?;
    }
    Ok(())
}

fn symlink_once(fs: &dyn Fs, target: &Path, link: &Path) -> Result<bool> {
    match fs.symlink(target, link) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(InitError::io(link)(e)),
    }
}

/// `nvme1n1` -> true, `nvme1n1p2` and `nvme1` -> false.
fn is_namespace(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    match rest.split_once('n') {
        Some((ctrl, ns)) => {
            !ctrl.is_empty()
                && !ns.is_empty()
                && ctrl.bytes().all(|b| b.is_ascii_digit())
                && ns.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Partition suffixes of `namespace` present in `names`: `nvme1n1p2` -> `2`.
fn partitions<'a>(namespace: &str, names: &'a [String]) -> Vec<&'a str> {
    let prefix = format!("{namespace}p");
    names
        .iter()
        .filter_map(|name| name.strip_prefix(prefix.as_str()))
        .filter(|num| !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()))
        .collect()
}

/// Link each cloud block-storage NVMe namespace (and its partitions) to
/// the device name requested at attach time, e.g. `/dev/sdf -> nvme1n1`.
///
/// `identify` returns the requested name for a namespace, or `None` for
/// devices that are not cloud block storage. Only an unreadable `/dev` is
/// tolerated; identification and link failures are errors.
pub fn link_ebs_devices<F>(fs: &dyn Fs, identify: F) -> Result<()>
where
    F: Fn(&Path) -> Result<Option<String>>,
{
    let dev = Path::new(paths::DEV);
    let names = match fs.read_dir(dev) {
        Ok(names) => names,
        Err(e) => {
            debug!(error = %e, "cannot scan /dev");
            return Ok(());
        }
    };

    for namespace in names.iter().filter(|n| is_namespace(n)) {
        let device: PathBuf = dev.join(namespace);
        let Some(requested) = identify(&device)? else {
            continue;
        };
        let requested = requested.trim_start_matches("/dev/");
        if requested.is_empty() || requested.contains('/') {
            continue;
        }

        if symlink_once(fs, Path::new(namespace), &dev.join(requested))? {
            info!(device = namespace, link = requested, "linked block device");
        }
        for num in partitions(namespace, &names) {
            let target = format!("{namespace}p{num}");
            symlink_once(fs, Path::new(&target), &dev.join(format!("{requested}{num}")))?;
        }
    }
    Ok(())
}
