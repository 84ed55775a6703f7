//! The boot sequence, from an empty VM to a supervised workload.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use vm_spec::{NameValue, VmSpec};

use crate::bootstrap::{self, nvme};
use crate::env;
use crate::error::{InitError, Result};
use crate::fs::SharedFs;
use crate::image;
use crate::imds::Imds;
use crate::pid1;
use crate::reaper::Reaper;
use crate::remote::Connector;
use crate::shutdown;
use crate::supervisor::{
    LaunchSpec, Service, ServiceContext, ServiceKind, ShutdownReport, Supervisor, discover,
};
use crate::sysctl;
use crate::volumes::{Provisioner, SystemDiskTools};

pub struct Init {
    fs: SharedFs,
    reaper: Reaper,
    imds: Arc<Imds>,
    connector: Box<dyn Connector>,
}

impl Init {
    pub fn new(fs: SharedFs, reaper: Reaper, imds: Arc<Imds>, connector: Box<dyn Connector>) -> Self {
        Self {
            fs,
            reaper,
            imds,
            connector,
        }
    }

    /// Boot the VM and run the workload until shutdown.
    ///
    /// Returns once every service has stopped and the filesystems are
    /// quiesced; the caller powers off. With `replace-init` set this only
    /// returns on error.
    pub async fn run(self) -> Result<ShutdownReport> {
        let mut mounts = Vec::new();
        let result = self.boot(&mut mounts).await;
        // Volumes mounted before a failure are unmounted too.
        if let Err(e) = shutdown::finalize(&*self.fs, &mounts).await {
            warn!(error = %e, "unclean unmount");
        }
        result
    }

    async fn boot(&self, mounts: &mut Vec<PathBuf>) -> Result<ShutdownReport> {
        bootstrap::mount_pseudo_filesystems(&*self.fs)?;
        bootstrap::link_standard_fds(&*self.fs)?;

        // Must finish before volumes are provisioned.
        let fs = self.fs.clone();
        let linking = tokio::task::spawn_blocking(move || {
            bootstrap::link_ebs_devices(&*fs, nvme::identify_ebs)
        });

        let spec = self.configure().await?;
        sysctl::apply(self.fs.clone(), &spec.sysctls).await?;

        let region = self.imds.region().await?;
        let remotes = self.connector.connect(&region)?;
        debug!(region, "connected remote stores");

        linking.await??;
        bootstrap::grow_root(&*self.fs, &self.reaper).await?;

        let tools = SystemDiskTools::new(self.reaper.clone());
        Provisioner::new(&*self.fs, &remotes, &tools)
            .provision(spec.volumes(), mounts)
            .await?;

        // A workload exec'd in place of the init runs alone.
        let services = if spec.replace_init() {
            Vec::new()
        } else {
            let ctx = ServiceContext {
                fs: self.fs.clone(),
                reaper: self.reaper.clone(),
                imds: self.imds.clone(),
            };
            discover(&ctx, &spec.security)
        };
        let mut supervisor = Supervisor::new(self.reaper.clone(), services);
        prepare_services(
            &mut supervisor,
            spec.security.readonly_root_fs(),
            shutdown::remount_root_readonly,
        )
        .await?;

        let env = env::with_default_path(
            env::resolve(&spec.env, spec.env_from(), &remotes).await?,
        );
        let launch = launch_spec(&spec, env)?;

        if spec.replace_init() {
            info!(program = launch.program(), "replacing init with workload");
            let source = launch.exec_command()?.exec();
            return Err(InitError::Spawn {
                program: launch.program().to_string(),
                source,
            });
        }

        // Listen before anything starts so an early power-off is not lost.
        let poweroff = pid1::poweroff_signal().map_err(InitError::Signal)?;
        let running = supervisor
            .start(Service::new(ServiceKind::Main, launch))
            .await?;

        let report = running.wait(poweroff, spec.grace_period()).await;
        info!(
            status = %report.main_status,
            graceful = report.graceful,
            "all services stopped"
        );
        Ok(report)
    }

    /// The image's base spec merged with the launch-time user data.
    pub async fn configure(&self) -> Result<VmSpec> {
        let base = image::base_spec(&*self.fs)?;
        let user_data = match self.imds.user_data().await? {
            Some(data) => data,
            None => {
                info!("no user data, running the image as built");
                String::new()
            }
        };
        let over = VmSpec::from_user_data(&user_data)?;
        let spec = vm_spec::merge(&base, &over);
        vm_spec::validate(&spec)?;
        debug!(?spec, "merged spec");
        Ok(spec)
    }
}

/// Run the auxiliary services' init callbacks, then `remount` the root
/// read-only if `readonly_root` is set. The callbacks write host keys,
/// authorized keys and runtime directories to the root filesystem.
pub async fn prepare_services<F>(
    supervisor: &mut Supervisor,
    readonly_root: bool,
    remount: F,
) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    supervisor.prepare().await?;
    if readonly_root {
        remount()?;
        info!("root filesystem is read-only");
    }
    Ok(())
}

/// How to start the workload described by `spec` with the resolved `env`.
pub fn launch_spec(spec: &VmSpec, env: Vec<NameValue>) -> Result<LaunchSpec> {
    let argv = spec.argv();
    if argv.is_empty() {
        error!("neither the image nor user data sets a command");
        return Err(InitError::NoCommand);
    }
    Ok(LaunchSpec {
        argv,
        working_dir: PathBuf::from(spec.working_dir()),
        env: env.into_iter().map(|nv| (nv.name, nv.value)).collect(),
        uid: Some(spec.security.uid()),
        gid: Some(spec.security.gid()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vm_spec::Security;

    #[test]
    fn launch_runs_as_configured_identity() {
        let spec = VmSpec {
            command: Some(vec!["/app".into()]),
            args: Some(vec!["serve".into()]),
            working_dir: Some("/srv".into()),
            security: Security {
                run_as_user_id: Some(1000),
                run_as_group_id: Some(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let launch = launch_spec(&spec, vec![NameValue::new("FOO", "1")]).unwrap();
        assert_eq!(launch.argv, vec!["/app", "serve"]);
        assert_eq!(launch.working_dir, PathBuf::from("/srv"));
        assert_eq!(launch.env, vec![("FOO".to_string(), "1".to_string())]);
        assert_eq!((launch.uid, launch.gid), (Some(1000), Some(100)));
    }

    #[test]
    fn launch_defaults_to_root_in_slash() {
        let spec = VmSpec {
            args: Some(vec!["/bin/true".into()]),
            ..Default::default()
        };
        let launch = launch_spec(&spec, Vec::new()).unwrap();
        assert_eq!(launch.working_dir, PathBuf::from("/"));
        assert_eq!((launch.uid, launch.gid), (Some(0), Some(0)));
    }

    fn recording_service(log: &Arc<Mutex<Vec<&'static str>>>) -> Service {
        let log = log.clone();
        Service::new(ServiceKind::Sshd, LaunchSpec::system(&["/bin/true"])).with_init(
            move || async move {
                log.lock().unwrap().push("init");
                Ok(())
            },
        )
    }

    #[tokio::test]
    async fn service_init_runs_before_root_goes_read_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut supervisor = Supervisor::new(Reaper::start().unwrap(), vec![recording_service(&log)]);
        let remount_log = log.clone();
        prepare_services(&mut supervisor, true, move || {
            remount_log.lock().unwrap().push("remount");
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["init", "remount"]);
    }

    #[tokio::test]
    async fn writable_root_is_not_remounted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut supervisor = Supervisor::new(Reaper::start().unwrap(), vec![recording_service(&log)]);
        prepare_services(&mut supervisor, false, || {
            panic!("remount on a writable root");
        })
        .await
        .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["init"]);
    }

    #[tokio::test]
    async fn failed_service_init_leaves_root_writable() {
        let mut supervisor = Supervisor::new(
            Reaper::start().unwrap(),
            vec![
                Service::new(ServiceKind::Sshd, LaunchSpec::system(&["/bin/true"]))
                    .with_init(|| async { Err(InitError::NoCommand) }),
            ],
        );
        let remounted = AtomicBool::new(false);
        let err = prepare_services(&mut supervisor, true, || {
            remounted.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, InitError::NoCommand));
        assert!(!remounted.load(Ordering::SeqCst));
    }

    #[test]
    fn launch_needs_a_command() {
        assert!(matches!(
            launch_spec(&VmSpec::default(), Vec::new()),
            Err(InitError::NoCommand)
        ));
    }
}
