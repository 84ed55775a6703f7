//! Auxiliary services shipped in the image.
//!
//! The image builder creates one directory per enabled service under
//! `/.vminit/services`. Unknown names are ignored so newer images keep
//! booting with older inits.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vm_spec::Security;

use super::service::{LaunchSpec, Service, ServiceKind};
use crate::command;
use crate::config::paths;
use crate::error::{InitError, Result};
use crate::fs::{Fs, SharedFs};
use crate::image::{User, find_user};
use crate::imds::Imds;
use crate::reaper::Reaper;

/// Which auxiliary services to run, given the service directory entries.
pub fn enabled_kinds(names: &[String], security: &Security) -> Vec<ServiceKind> {
    let mut kinds = Vec::new();
    for name in names {
        match name.as_str() {
            "chrony" => kinds.push(ServiceKind::Chrony),
            "ssh" if security.sshd_enabled() => kinds.push(ServiceKind::Sshd),
            "ssh" => debug!("sshd present but not enabled"),
            other => debug!(service = other, "ignoring unknown service"),
        }
    }
    kinds
}

/// Everything an auxiliary service may need during its init callback.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub fs: SharedFs,
    pub reaper: Reaper,
    pub imds: Arc<Imds>,
}

/// Build the auxiliary services enabled in the image.
pub fn discover(ctx: &ServiceContext, security: &Security) -> Vec<Service> {
    let names = match ctx.fs.read_dir(Path::new(paths::SERVICES_DIR)) {
        Ok(names) => names,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(error = %e, "cannot list services");
            Vec::new()
        }
    };
    enabled_kinds(&names, security)
        .into_iter()
        .filter_map(|kind| match kind {
            ServiceKind::Chrony => Some(chrony(ctx.fs.clone())),
            ServiceKind::Sshd => Some(sshd(ctx.clone())),
            ServiceKind::Main => None,
        })
        .collect()
}

fn chrony(fs: SharedFs) -> Service {
    Service::new(
        ServiceKind::Chrony,
        LaunchSpec::system(&[paths::CHRONYD, "-d", "-f", paths::CHRONY_CONF]),
    )
    .optional(true)
    .with_init(move || async move {
        fs.create_dir_all(Path::new(paths::CHRONY_RUN_DIR), 0o750)
            .map_err(InitError::io(paths::CHRONY_RUN_DIR))?;
        fs.create_dir_all(Path::new(paths::CHRONY_STATE_DIR), 0o755)
            .map_err(InitError::io(paths::CHRONY_STATE_DIR))
    })
}

fn sshd(ctx: ServiceContext) -> Service {
    Service::new(
        ServiceKind::Sshd,
        LaunchSpec::system(&[paths::SSHD, "-D", "-e", "-f", paths::SSHD_CONFIG]),
    )
    .with_init(move || async move {
        // Host keys land under /.vminit/etc/ssh.
        command::exec(&ctx.reaper, paths::SSH_KEYGEN, &["-A", "-f", paths::INIT_DIR]).await?;
        match ctx.imds.public_key().await? {
            Some(key) => {
                let user = find_user(&*ctx.fs, paths::SSH_LOGIN_USER)?.ok_or_else(|| {
                    InitError::User(format!("ssh user {:?} not found", paths::SSH_LOGIN_USER))
                })?;
                install_authorized_key(&*ctx.fs, &user, &key)?;
                info!(user = user.name, "installed ssh public key");
            }
            None => warn!("no ssh public key in instance metadata"),
        }
        Ok(())
    })
}

/// Write `key` as the user's only authorized key.
pub fn install_authorized_key(fs: &dyn Fs, user: &User, key: &str) -> Result<()> {
    let ssh_dir = Path::new(&user.home).join(".ssh");
    fs.create_dir_all(&ssh_dir, 0o700)
        .map_err(InitError::io(&ssh_dir))?;
    fs.chown(&ssh_dir, user.uid, user.gid)
        .map_err(InitError::io(&ssh_dir))?;

    let keys = ssh_dir.join("authorized_keys");
    let mut contents = key.trim().to_string();
    contents.push('\n');
    fs.write_file(&keys, contents.as_bytes(), 0o600)
        .map_err(InitError::io(&keys))?;
    fs.chown(&keys, user.uid, user.gid)
        .map_err(InitError::io(&keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_spec::Sshd;

    use crate::fs::{MemFs, Node};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sshd_enabled(enable: bool) -> Security {
        Security {
            sshd: Sshd {
                enable: Some(enable),
            },
            ..Default::default()
        }
    }

    #[test]
    fn ssh_requires_opt_in() {
        let dirs = names(&["chrony", "ssh", "telemetry"]);
        assert_eq!(
            enabled_kinds(&dirs, &sshd_enabled(true)),
            vec![ServiceKind::Chrony, ServiceKind::Sshd]
        );
        assert_eq!(
            enabled_kinds(&dirs, &sshd_enabled(false)),
            vec![ServiceKind::Chrony]
        );
        assert!(enabled_kinds(&names(&["ssh"]), &Security::default()).is_empty());
    }

    #[tokio::test]
    async fn discovery_reads_service_directory() {
        let fs = Arc::new(MemFs::new());
        fs.create_dir_all(Path::new("/.vminit/services/chrony"), 0o755)
            .unwrap();
        fs.create_dir_all(Path::new("/.vminit/services/ssh"), 0o755)
            .unwrap();
        let ctx = ServiceContext {
            fs: fs.clone(),
            reaper: Reaper::start().unwrap(),
            imds: Arc::new(Imds::new("http://127.0.0.1:9")),
        };

        let services = discover(&ctx, &sshd_enabled(true));
        let kinds: Vec<_> = services.iter().map(Service::kind).collect();
        assert_eq!(kinds, vec![ServiceKind::Chrony, ServiceKind::Sshd]);
        assert!(services[0].is_optional());
        assert!(!services[1].is_optional());
        assert_eq!(services[1].launch().program(), paths::SSHD);
    }

    #[tokio::test]
    async fn no_service_directory_means_no_services() {
        let ctx = ServiceContext {
            fs: Arc::new(MemFs::new()),
            reaper: Reaper::start().unwrap(),
            imds: Arc::new(Imds::new("http://127.0.0.1:9")),
        };
        assert!(discover(&ctx, &sshd_enabled(true)).is_empty());
    }

    #[test]
    fn authorized_key_is_private_to_the_user() {
        let fs = MemFs::new();
        let user = User {
            name: "vminit".into(),
            uid: 1000,
            gid: 1000,
            home: "/home/vminit".into(),
        };
        install_authorized_key(&fs, &user, "ssh-ed25519 AAAA me\n").unwrap();

        assert_eq!(
            fs.node("/home/vminit/.ssh"),
            Some(Node::Dir {
                mode: 0o700,
                uid: 1000,
                gid: 1000
            })
        );
        assert_eq!(
            fs.node("/home/vminit/.ssh/authorized_keys"),
            Some(Node::File {
                data: b"ssh-ed25519 AAAA me\n".to_vec(),
                mode: 0o600,
                uid: 1000,
                gid: 1000
            })
        );
    }
}
