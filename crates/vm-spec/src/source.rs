//! Exactly-one-source declarations and their validation.
//!
//! Decoded declarations carry one optional field per source kind so that
//! user data stays forward compatible. Everything downstream works on the
//! tagged [`VolumeSource`] / [`EnvFromSource`] views, and the
//! exactly-one invariant is checked in one place: the `source()` methods.

use crate::error::SpecError;
use crate::model::{
    EbsVolume, EnvFromDecl, Mount, S3Env, S3Volume, SecretsManagerEnv, SecretsManagerVolume,
    SsmEnv, SsmVolume, VmSpec, VolumeDecl,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSource<'a> {
    Ebs(&'a EbsVolume),
    Ssm(&'a SsmVolume),
    S3(&'a S3Volume),
    SecretsManager(&'a SecretsManagerVolume),
}

impl<'a> VolumeSource<'a> {
    pub fn mount(self) -> &'a Mount {
        match self {
            Self::Ebs(v) => &v.mount,
            Self::Ssm(v) => &v.mount,
            Self::S3(v) => &v.mount,
            Self::SecretsManager(v) => &v.mount,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::Ebs(_) => "ebs",
            Self::Ssm(_) => "ssm",
            Self::S3(_) => "s3",
            Self::SecretsManager(_) => "secrets-manager",
        }
    }
}

impl VolumeDecl {
    pub fn source(&self) -> Result<VolumeSource<'_>, SpecError> {
        exactly_one(
            "volume",
            [
                self.ebs.as_ref().map(VolumeSource::Ebs),
                self.ssm.as_ref().map(VolumeSource::Ssm),
                self.s3.as_ref().map(VolumeSource::S3),
                self.secrets_manager
                    .as_ref()
                    .map(VolumeSource::SecretsManager),
            ],
        )
    }

    /// Mounts of every set source. Used for owner defaulting, which runs
    /// before validation.
    pub(crate) fn mounts_mut(&mut self) -> impl Iterator<Item = &mut Mount> {
        self.ebs
            .as_mut()
            .map(|v| &mut v.mount)
            .into_iter()
            .chain(self.ssm.as_mut().map(|v| &mut v.mount))
            .chain(self.s3.as_mut().map(|v| &mut v.mount))
            .chain(self.secrets_manager.as_mut().map(|v| &mut v.mount))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvFromSource<'a> {
    Ssm(&'a SsmEnv),
    S3(&'a S3Env),
    SecretsManager(&'a SecretsManagerEnv),
}

impl EnvFromSource<'_> {
    pub fn optional(self) -> bool {
        match self {
            Self::Ssm(s) => s.optional,
            Self::S3(s) => s.optional,
            Self::SecretsManager(s) => s.optional,
        }
    }
}

impl<'a> EnvFromSource<'a> {
    /// Prepended to every name this source resolves.
    pub fn name_prefix(self) -> &'a str {
        let prefix = match self {
            Self::Ssm(s) => &s.prefix,
            Self::S3(s) => &s.prefix,
            Self::SecretsManager(s) => &s.prefix,
        };
        prefix.as_deref().unwrap_or_default()
    }
}

impl EnvFromDecl {
    pub fn source(&self) -> Result<EnvFromSource<'_>, SpecError> {
        exactly_one(
            "env-from",
            [
                self.ssm.as_ref().map(EnvFromSource::Ssm),
                self.s3.as_ref().map(EnvFromSource::S3),
                self.secrets_manager
                    .as_ref()
                    .map(EnvFromSource::SecretsManager),
            ],
        )
    }
}

fn exactly_one<T, const N: usize>(field: &str, candidates: [Option<T>; N]) -> Result<T, SpecError> {
    let mut set = candidates.into_iter().flatten();
    match (set.next(), set.next()) {
        (Some(only), None) => Ok(only),
        (first, second) => Err(SpecError::SourceCount {
            field: field.to_string(),
            count: usize::from(first.is_some()) + usize::from(second.is_some()) + set.count(),
        }),
    }
}

/// Reject specs the init cannot act on: any `volumes`/`env-from` entry
/// without exactly one source, or a mount mode that is not octal.
pub fn validate(spec: &VmSpec) -> Result<(), SpecError> {
    for (i, decl) in spec.env_from().iter().enumerate() {
        decl.source().map_err(|e| e.at(format!("env-from[{i}]")))?;
    }
    for (i, decl) in spec.volumes().iter().enumerate() {
        let source = decl.source().map_err(|e| e.at(format!("volumes[{i}]")))?;
        source
            .mount()
            .mode()
            .map_err(|e| e.at(format!("volumes[{i}].mount.mode")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ebs() -> Option<EbsVolume> {
        Some(EbsVolume {
            device: "/dev/sdf".into(),
            fs_type: "ext4".into(),
            mount: Mount {
                destination: "/data".into(),
                ..Default::default()
            },
        })
    }

    fn ssm() -> Option<SsmVolume> {
        Some(SsmVolume {
            path: "/cfg".into(),
            ..Default::default()
        })
    }

    #[test]
    fn exactly_one_volume_source_passes() {
        let decl = VolumeDecl {
            ebs: ebs(),
            ..Default::default()
        };
        assert!(matches!(decl.source(), Ok(VolumeSource::Ebs(_))));
        let spec = VmSpec {
            volumes: Some(vec![decl]),
            ..Default::default()
        };
        validate(&spec).unwrap();
    }

    #[test]
    fn two_volume_sources_fail_validation() {
        let spec = VmSpec {
            volumes: Some(vec![
                VolumeDecl {
                    ssm: ssm(),
                    ..Default::default()
                },
                VolumeDecl {
                    ebs: ebs(),
                    ssm: ssm(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let err = validate(&spec).unwrap_err();
        assert_eq!(
            err.to_string(),
            "volumes[1]: expected exactly one source, found 2"
        );
    }

    #[test]
    fn empty_volume_fails_validation() {
        let spec = VmSpec {
            volumes: Some(vec![VolumeDecl::default()]),
            ..Default::default()
        };
        assert!(matches!(
            validate(&spec),
            Err(SpecError::SourceCount { count: 0, .. })
        ));
    }

    #[test]
    fn env_from_with_every_source_fails_validation() {
        let spec = VmSpec {
            env_from: Some(vec![EnvFromDecl {
                ssm: Some(SsmEnv::default()),
                s3: Some(S3Env::default()),
                secrets_manager: Some(SecretsManagerEnv::default()),
            }]),
            ..Default::default()
        };
        let err = validate(&spec).unwrap_err();
        assert_eq!(
            err.to_string(),
            "env-from[0]: expected exactly one source, found 3"
        );
    }

    #[test]
    fn invalid_mount_mode_fails_validation() {
        let mut volume = ebs().unwrap();
        volume.mount.mode = Some("999".into());
        let spec = VmSpec {
            volumes: Some(vec![VolumeDecl {
                ebs: Some(volume),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(matches!(
            validate(&spec),
            Err(SpecError::InvalidMode { .. })
        ));
    }

    #[test]
    fn env_prefix_defaults_to_empty() {
        let decl = EnvFromDecl {
            s3: Some(S3Env {
                bucket: "b".into(),
                key: "k".into(),
                optional: true,
                prefix: Some("APP_".into()),
            }),
            ..Default::default()
        };
        let source = decl.source().unwrap();
        assert!(source.optional());
        assert_eq!(source.name_prefix(), "APP_");

        let plain = EnvFromDecl {
            ssm: Some(SsmEnv::default()),
            ..Default::default()
        };
        assert_eq!(plain.source().unwrap().name_prefix(), "");
    }
}
