//! vm-init: the PID 1 of a VM image built from a container image.
//!
//! Boot sequence (see [`run::Init::run`]):
//! 1. Mount pseudo-filesystems and create the standard fd links
//! 2. Link cloud block-storage NVMe devices to their requested names (in the background)
//! 3. Merge the image's embedded config with launch-time user data
//! 4. Apply sysctls, connect remote stores, grow the root partition
//! 5. Provision volumes in declaration order
//! 6. Resolve the workload environment, then exec or supervise the workload
//!
//! Any error before the workload starts is fatal: it is logged and the VM
//! powers off.

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod fs;
pub mod image;
pub mod imds;
pub mod join;
pub mod pid1;
pub mod reaper;
pub mod remote;
pub mod run;
pub mod shutdown;
pub mod supervisor;
pub mod sysctl;
pub mod volumes;

pub use error::{InitError, Result};
