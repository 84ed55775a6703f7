//! Starting the workload and auxiliary services, and stopping them all in
//! two phases when the VM shuts down.
//!
//! Shutdown is triggered by the workload exiting or by a power-off signal,
//! whichever comes first. From that moment the grace period runs: every
//! service is told to stop and sent SIGTERM, and whatever is still alive
//! when the grace period ends is sent SIGKILL.

pub mod catalog;
pub mod service;

use std::future::Future;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{info, warn};

pub use catalog::{ServiceContext, discover, enabled_kinds};
pub use service::{LaunchSpec, Service, ServiceHandle, ServiceKind, ServiceState};

use crate::error::Result;
use crate::reaper::{ExitStatus, Reaper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    MainExited(ExitStatus),
    PowerOff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub trigger: Trigger,
    /// Everything exited within the grace period.
    pub graceful: bool,
    pub main_status: ExitStatus,
    /// Final status of each auxiliary service, in start order.
    pub services: Vec<(ServiceKind, ExitStatus)>,
}

pub struct Supervisor {
    reaper: Reaper,
    services: Vec<Service>,
}

impl Supervisor {
    /// A supervisor for the given auxiliary services.
    pub fn new(reaper: Reaper, services: Vec<Service>) -> Self {
        Self { reaper, services }
    }

    /// Run every auxiliary service's init callback ahead of [`start`].
    /// An optional service whose init fails is dropped; any other failure
    /// is returned.
    ///
    /// [`start`]: Supervisor::start
    pub async fn prepare(&mut self) -> Result<()> {
        let mut ready = Vec::with_capacity(self.services.len());
        for mut service in std::mem::take(&mut self.services) {
            match service.prepare().await {
                Ok(()) => ready.push(service),
                Err(e) if service.is_optional() => {
                    warn!(service = %service.kind(), error = %e, "optional service init failed");
                }
                Err(e) => return Err(e),
            }
        }
        self.services = ready;
        Ok(())
    }

    /// Start the auxiliary services, then the workload.
    ///
    /// An optional service that fails to start is skipped; any other
    /// failure stops what was already started and is returned.
    pub async fn start(self, main: Service) -> Result<Running> {
        let mut services = Vec::with_capacity(self.services.len());
        for service in self.services {
            let kind = service.kind();
            let optional = service.is_optional();
            match service.start(&self.reaper).await {
                Ok(handle) => services.push(handle),
                Err(e) if optional => warn!(service = %kind, error = %e, "optional service failed to start"),
                Err(e) => {
                    abort(&mut services).await;
                    return Err(e);
                }
            }
        }
        let main = match main.start(&self.reaper).await {
            Ok(main) => main,
            Err(e) => {
                abort(&mut services).await;
                return Err(e);
            }
        };
        Ok(Running { main, services })
    }
}

async fn abort(services: &mut [ServiceHandle]) {
    for service in services.iter() {
        service.stop();
        service.signal(Signal::SIGKILL);
    }
    for service in services.iter_mut() {
        service.wait().await;
    }
}

/// Every service is up.
#[derive(Debug)]
pub struct Running {
    main: ServiceHandle,
    services: Vec<ServiceHandle>,
}

impl Running {
    pub fn main(&self) -> &ServiceHandle {
        &self.main
    }

    pub fn services(&self) -> &[ServiceHandle] {
        &self.services
    }

    /// Wait for the workload to exit or `poweroff` to resolve, then stop
    /// everything within `grace`.
    pub async fn wait(mut self, poweroff: impl Future<Output = ()>, grace: Duration) -> ShutdownReport {
        let trigger = tokio::select! {
            status = self.main.wait() => Trigger::MainExited(status),
            () = poweroff => Trigger::PowerOff,
        };
        match trigger {
            Trigger::MainExited(status) => info!(%status, "workload exited, shutting down"),
            Trigger::PowerOff => info!("shutting down"),
        }

        for service in self.services.iter().chain(std::iter::once(&self.main)) {
            service.stop();
            service.signal(Signal::SIGTERM);
        }

        let graceful = tokio::time::timeout(grace, self.wait_all()).await.is_ok();
        if !graceful {
            warn!(grace_secs = grace.as_secs_f64(), "grace period over, killing remaining processes");
            for service in self.services.iter().chain(std::iter::once(&self.main)) {
                service.signal(Signal::SIGKILL);
            }
            self.wait_all().await;
        }

        let mut services = Vec::with_capacity(self.services.len());
        for service in &mut self.services {
            services.push((service.kind(), service.wait().await));
        }
        ShutdownReport {
            trigger,
            graceful,
            main_status: self.main.wait().await,
            services,
        }
    }

    async fn wait_all(&mut self) {
        for service in &mut self.services {
            service.wait().await;
        }
        self.main.wait().await;
    }
}
