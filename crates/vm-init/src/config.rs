//! Process settings and the build-time image layout.
//!
//! PID 1 has no arguments. Kernel command-line parameters the kernel does
//! not consume arrive as environment variables, so settings are read from
//! the environment once via `LazyLock`.

use std::sync::LazyLock;
use std::time::Duration;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

static LOG_FILTER: LazyLock<String> = LazyLock::new(|| env_or("VMINIT_LOG", "info"));
static IMDS_ENDPOINT: LazyLock<String> =
    LazyLock::new(|| env_or("VMINIT_IMDS_ENDPOINT", "http://169.254.169.254"));

/// `tracing_subscriber::EnvFilter` directives.
pub fn log_filter() -> &'static str {
    &LOG_FILTER
}
pub fn imds_endpoint() -> &'static str {
    &IMDS_ENDPOINT
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Delay before a crashed service is started again.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// How often, and how many times, the mount table is checked after the
/// shutdown unmounts before powering off anyway.
pub const UNMOUNT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const UNMOUNT_POLL_ATTEMPTS: u32 = 50;

/// IMDSv2 session token lifetime.
pub const IMDS_TOKEN_TTL_SECS: u32 = 21600;

/// `PATH` given to the workload when neither the image nor user data sets one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Guest paths (must match the image builder's layout).
pub mod paths {
    pub const INIT_DIR: &str = "/.vminit";
    pub const METADATA: &str = "/.vminit/metadata.json";
    /// Each child directory name enables the auxiliary service of that name.
    pub const SERVICES_DIR: &str = "/.vminit/services";
    /// Filesystem tools, including one `mkfs.<type>` per supported type.
    pub const SBIN_DIR: &str = "/.vminit/sbin";
    pub const BLKID: &str = "/.vminit/sbin/blkid";
    pub const RESIZE2FS: &str = "/.vminit/sbin/resize2fs";

    pub const CHRONYD: &str = "/.vminit/sbin/chronyd";
    pub const CHRONY_CONF: &str = "/.vminit/etc/chrony.conf";
    pub const CHRONY_RUN_DIR: &str = "/run/chrony";
    pub const CHRONY_STATE_DIR: &str = "/var/lib/chrony";

    pub const SSHD: &str = "/.vminit/sbin/sshd";
    pub const SSHD_CONFIG: &str = "/.vminit/etc/ssh/sshd_config";
    pub const SSH_KEYGEN: &str = "/.vminit/bin/ssh-keygen";
    /// Login user baked into the image for SSH access.
    pub const SSH_LOGIN_USER: &str = "vminit";

    pub const PASSWD: &str = "/etc/passwd";
    pub const GROUP: &str = "/etc/group";

    pub const DEV: &str = "/dev";
    pub const PROC_CGROUPS: &str = "/proc/cgroups";
    pub const PROC_MOUNTS: &str = "/proc/mounts";
    pub const PROC_SYS: &str = "/proc/sys";
    pub const SYS_BLOCK: &str = "/sys/block";
    pub const SYS_DEV_BLOCK: &str = "/sys/dev/block";
}
