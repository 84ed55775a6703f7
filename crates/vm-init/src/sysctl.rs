use std::path::{Path, PathBuf};

use tracing::debug;
use vm_spec::NameValue;

use crate::config::paths;
use crate::error::{InitError, Result};
use crate::fs::SharedFs;
use crate::join::TaskGroup;

/// `net.ipv4.ip_forward` -> `/proc/sys/net/ipv4/ip_forward`
pub fn sysctl_path(name: &str) -> PathBuf {
    Path::new(paths::PROC_SYS).join(name.replace('.', "/"))
}

/// Write every sysctl concurrently. All writes are attempted; the result
/// carries every failure.
pub async fn apply(fs: SharedFs, sysctls: &[NameValue]) -> Result<()> {
    let mut group = TaskGroup::new();
    for NameValue { name, value } in sysctls.iter().cloned() {
        let fs = fs.clone();
        group.spawn_blocking(move || {
            let path = sysctl_path(&name);
            debug!(name, value, "sysctl");
            fs.write_file(&path, value.as_bytes(), 0o644)
                .map_err(InitError::io(&path))
        });
    }
    group.join().await?;
    Ok(())
}
