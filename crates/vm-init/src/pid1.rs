//! PID 1 responsibilities: signal dispositions, power-off triggers and the
//! final power-off.
//!
//! When running as PID 1 (init process), we must:
//! 1. Never exit: the kernel panics if init dies, so every path ends in
//!    [`power_off`]
//! 2. Treat SIGPWR/SIGTERM/SIGINT as a request to shut the VM down
//! 3. Keep Ctrl-Alt-Del from rebooting the VM behind our back

use std::future::Future;
use std::io;
use std::time::Duration;

use nix::sys::reboot::{RebootMode, reboot, set_cad_enabled};
use nix::sys::signal::{SigHandler, Signal, signal};
use tokio::signal::unix::{SignalKind, signal as listen};
use tracing::{error, info, warn};

/// Set process-wide signal dispositions and disable Ctrl-Alt-Del.
///
/// SIGTTIN/SIGTTOU are ignored so a background write to the console never
/// stops the init. SIG_IGN survives `exec()`, so children reset them.
pub fn setup_signals() {
    for sig in [Signal::SIGTTIN, Signal::SIGTTOU] {
        // SAFETY: SIG_IGN installs no handler code.
        if let Err(e) = unsafe { signal(sig, SigHandler::SigIgn) } {
            warn!(%sig, error = %e, "cannot ignore signal");
        }
    }
    if std::process::id() == 1
        && let Err(e) = set_cad_enabled(false)
    {
        warn!(error = %e, "cannot disable Ctrl-Alt-Del");
    }
}

/// Resolves on the first SIGPWR, SIGTERM or SIGINT.
///
/// The listeners are installed immediately, so a signal that arrives before
/// the future is first polled is not lost.
pub fn poweroff_signal() -> io::Result<impl Future<Output = ()>> {
    let mut pwr = listen(SignalKind::from_raw(libc::SIGPWR))?;
    let mut term = listen(SignalKind::terminate())?;
    let mut int = listen(SignalKind::interrupt())?;
    Ok(async move {
        let sig = tokio::select! {
            _ = pwr.recv() => "SIGPWR",
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        info!(signal = sig, "power-off requested");
    })
}

/// Flush and power the VM off. Never returns.
pub fn power_off() -> ! {
    nix::unistd::sync();
    match reboot(RebootMode::RB_POWER_OFF) {
        Ok(never) => match never {},
        Err(e) => error!(error = %e, "power off failed"),
    }
    // Exiting would panic the kernel; wait for the hypervisor instead.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
