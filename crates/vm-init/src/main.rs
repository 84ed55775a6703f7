//! PID 1 for VMs built from container images.
//!
//! Boots the OS, provisions what the workload needs, runs it, and powers
//! the VM off when it is done. Every path ends in a power-off: returning
//! from PID 1 would panic the kernel.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use vm_init::fs::OsFs;
use vm_init::imds::Imds;
use vm_init::reaper::Reaper;
use vm_init::remote::OfflineConnector;
use vm_init::run::Init;
use vm_init::{config, pid1};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(EnvFilter::new(config::log_filter()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "vm-init starting");
    pid1::setup_signals();

    let result = match Reaper::start() {
        Ok(reaper) => {
            Init::new(
                Arc::new(OsFs::new("/")),
                reaper,
                Arc::new(Imds::from_env()),
                Box::new(OfflineConnector),
            )
            .run()
            .await
        }
        Err(e) => Err(vm_init::InitError::Signal(e)),
    };

    match result {
        Ok(report) => info!(
            status = %report.main_status,
            graceful = report.graceful,
            "powering off"
        ),
        Err(e) => error!("fatal: {e}"),
    }
    pid1::power_off()
}
