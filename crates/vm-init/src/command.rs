use std::ffi::OsStr;
use std::process::Command;

use tracing::trace;

use crate::reaper::{ExitStatus, Reaper};

/// Error from a failed helper command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

fn render<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a helper binary and return its exit status without judging it.
pub async fn status<S: AsRef<OsStr>>(
    reaper: &Reaper,
    program: &str,
    args: &[S],
) -> Result<(ExitStatus, String), CommandError> {
    trace!(program, "exec");
    let output = reaper
        .output(Command::new(program).args(args))
        .await
        .map_err(|e| CommandError {
            command: render(program, args),
            detail: e.to_string(),
        })?;
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Ok((output.status, stderr))
}

/// Run a helper binary.
///
/// Returns trimmed stdout on success.
pub async fn exec<S: AsRef<OsStr>>(
    reaper: &Reaper,
    program: &str,
    args: &[S],
) -> Result<String, CommandError> {
    trace!(program, "exec");
    let command = render(program, args);
    let output = reaper
        .output(Command::new(program).args(args))
        .await
        .map_err(|e| CommandError {
            command: command.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command,
            detail: format!("{}: {stderr}", output.status),
        })
    }
}
