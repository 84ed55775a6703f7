use std::fmt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

use crate::command::CommandError;
use crate::imds::ImdsError;
use crate::remote::RemoteError;

pub type Result<T, E = InitError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Spec(#[from] vm_spec::SpecError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{syscall} {target}: {source}")]
    Sys {
        syscall: &'static str,
        target: String,
        #[source]
        source: Errno,
    },

    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Imds(#[from] ImdsError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Gpt(#[from] crate::bootstrap::gpt::GptError),

    #[error(transparent)]
    Joined(#[from] JoinedError),

    #[error("{0}")]
    User(String),

    #[error("{field} must be set")]
    MissingField { field: &'static str },

    #[error("unsupported filesystem type {0:?}")]
    UnsupportedFilesystem(String),

    #[error("no command to run")]
    NoCommand,

    #[error("install signal listeners: {0}")]
    Signal(#[source] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl InitError {
    /// `map_err` adapter attaching the path an I/O error happened on.
    pub fn io(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| Self::Io { path, source }
    }

    /// `map_err` adapter for failed system calls.
    pub fn sys(syscall: &'static str, target: impl fmt::Display) -> impl FnOnce(Errno) -> Self {
        let target = target.to_string();
        move |source| Self::Sys {
            syscall,
            target,
            source,
        }
    }
}

/// Every error from a group of operations that all ran to completion.
#[derive(Debug)]
pub struct JoinedError(Vec<InitError>);

impl JoinedError {
    /// `Ok` when `errors` is empty.
    pub fn check(errors: Vec<InitError>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors))
        }
    }

    pub fn errors(&self) -> &[InitError] {
        &self.0
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for JoinedError {}
