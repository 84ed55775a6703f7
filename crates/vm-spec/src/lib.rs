//! Runtime configuration for vm-init.
//!
//! A boot produces two [`VmSpec`] values: the base, derived from the
//! container image's embedded metadata, and the override, decoded from the
//! user data handed to the instance at launch. [`merge`] combines them
//! without touching either input and [`validate`] rejects declarations the
//! init cannot act on.
//!
//! Nothing in this crate performs I/O.

mod decode;
mod error;
mod merge;
mod model;
mod source;

pub use decode::{ImageConfig, ImageMetadata};
pub use error::SpecError;
pub use merge::merge;
pub use model::{
    DEFAULT_GRACE_PERIOD_SECS, DEFAULT_MOUNT_MODE, DEFAULT_WORKING_DIR, EbsVolume, EnvFromDecl,
    Mount, NameValue, S3Env, S3Volume, SecretsManagerEnv, SecretsManagerVolume, Security, SsmEnv,
    SsmVolume, Sshd, VmSpec, VolumeDecl,
};
pub use source::{EnvFromSource, VolumeSource, validate};
