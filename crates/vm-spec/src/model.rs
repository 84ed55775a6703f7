//! The desired runtime state of the VM.
//!
//! Every mergeable scalar is an `Option`: `None` means "not set here" and
//! never overrides, while an explicit value (including `false` and `0`)
//! always does. Unknown keys are ignored so older inits accept newer user
//! data.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::error::SpecError;

pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
pub const DEFAULT_MOUNT_MODE: u32 = 0o755;
pub const DEFAULT_WORKING_DIR: &str = "/";

/// Treat `""` the same as an absent key.
fn non_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.filter(|s| !s.is_empty()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VmSpec {
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub env: Vec<NameValue>,
    pub env_from: Option<Vec<EnvFromDecl>>,
    pub security: Security,
    pub volumes: Option<Vec<VolumeDecl>>,
    pub sysctls: Vec<NameValue>,
    #[serde(deserialize_with = "non_empty")]
    pub working_dir: Option<String>,
    pub replace_init: Option<bool>,
    pub shutdown_grace_period: Option<u64>,
}

impl VmSpec {
    /// Decode user data. Blank user data is an empty override.
    pub fn from_user_data(data: &str) -> Result<Self, SpecError> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(data)?)
    }

    /// The full argv: command followed by args.
    pub fn argv(&self) -> Vec<String> {
        self.command
            .iter()
            .chain(self.args.iter())
            .flatten()
            .cloned()
            .collect()
    }

    pub fn working_dir(&self) -> &str {
        self.working_dir.as_deref().unwrap_or(DEFAULT_WORKING_DIR)
    }

    pub fn replace_init(&self) -> bool {
        self.replace_init.unwrap_or(false)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECS),
        )
    }

    pub fn volumes(&self) -> &[VolumeDecl] {
        self.volumes.as_deref().unwrap_or_default()
    }

    pub fn env_from(&self) -> &[EnvFromDecl] {
        self.env_from.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Security {
    pub run_as_user_id: Option<u32>,
    pub run_as_group_id: Option<u32>,
    pub readonly_root_fs: Option<bool>,
    #[serde(alias = "ssh-d")]
    pub sshd: Sshd,
}

impl Security {
    pub fn uid(&self) -> u32 {
        self.run_as_user_id.unwrap_or(0)
    }

    pub fn gid(&self) -> u32 {
        self.run_as_group_id.unwrap_or(0)
    }

    pub fn readonly_root_fs(&self) -> bool {
        self.readonly_root_fs.unwrap_or(false)
    }

    pub fn sshd_enabled(&self) -> bool {
        self.sshd.enable.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Sshd {
    pub enable: Option<bool>,
}

/// Where and how a volume appears in the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Mount {
    pub destination: String,
    /// Octal permission string such as `"0750"`.
    #[serde(deserialize_with = "non_empty")]
    pub mode: Option<String>,
    pub user_id: Option<u32>,
    pub group_id: Option<u32>,
}

impl Mount {
    pub fn mode(&self) -> Result<u32, SpecError> {
        match &self.mode {
            None => Ok(DEFAULT_MOUNT_MODE),
            Some(mode) => u32::from_str_radix(mode, 8).map_err(|_| SpecError::InvalidMode {
                field: "mount.mode".into(),
                mode: mode.clone(),
            }),
        }
    }

    pub fn uid(&self) -> u32 {
        self.user_id.unwrap_or(0)
    }

    pub fn gid(&self) -> u32 {
        self.group_id.unwrap_or(0)
    }
}

/// A volume declaration. Exactly one of the source fields must be set;
/// see [`VolumeDecl::source`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VolumeDecl {
    pub ebs: Option<EbsVolume>,
    pub ssm: Option<SsmVolume>,
    pub s3: Option<S3Volume>,
    pub secrets_manager: Option<SecretsManagerVolume>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EbsVolume {
    pub device: String,
    pub fs_type: String,
    pub mount: Mount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SsmVolume {
    pub path: String,
    pub optional: bool,
    pub mount: Mount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct S3Volume {
    pub bucket: String,
    pub key_prefix: String,
    pub optional: bool,
    pub mount: Mount,
}

/// A single secret written to the file at `mount.destination`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecretsManagerVolume {
    pub secret_id: String,
    pub optional: bool,
    pub mount: Mount,
}

/// A remote environment source. Exactly one field must be set;
/// see [`EnvFromDecl::source`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EnvFromDecl {
    pub ssm: Option<SsmEnv>,
    pub s3: Option<S3Env>,
    pub secrets_manager: Option<SecretsManagerEnv>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SsmEnv {
    pub path: String,
    pub optional: bool,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct S3Env {
    pub bucket: String,
    pub key: String,
    pub optional: bool,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecretsManagerEnv {
    pub secret_id: String,
    pub optional: bool,
    pub prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_user_data_is_empty_spec() {
        assert_eq!(VmSpec::from_user_data("").unwrap(), VmSpec::default());
        assert_eq!(VmSpec::from_user_data("  \n").unwrap(), VmSpec::default());
    }

    #[test]
    fn user_data_decodes_kebab_case_and_ignores_unknown_keys() {
        let spec = VmSpec::from_user_data(
            r#"
command: ["/app"]
args: []
env:
  - name: FOO
    value: "2"
security:
  run-as-user-id: 1000
  readonly-root-fs: false
  sshd:
    enable: true
working-dir: ""
shutdown-grace-period: 30
not-a-field: whatever
volumes:
  - ebs:
      device: /dev/sdf
      fs-type: ext4
      mount:
        destination: /data
        mode: "0750"
"#,
        )
        .unwrap();

        assert_eq!(spec.command, Some(vec!["/app".to_string()]));
        assert_eq!(spec.args, Some(vec![]));
        assert_eq!(spec.env, vec![NameValue::new("FOO", "2")]);
        assert_eq!(spec.security.run_as_user_id, Some(1000));
        assert_eq!(spec.security.readonly_root_fs, Some(false));
        assert!(spec.security.sshd_enabled());
        assert_eq!(spec.working_dir, None);
        assert_eq!(spec.grace_period(), Duration::from_secs(30));

        let ebs = spec.volumes()[0].ebs.as_ref().unwrap();
        assert_eq!(ebs.fs_type, "ext4");
        assert_eq!(ebs.mount.mode().unwrap(), 0o750);
    }

    #[test]
    fn malformed_user_data_is_an_error() {
        let err = VmSpec::from_user_data("command: {not: [a list").unwrap_err();
        assert!(matches!(err, SpecError::UserData(_)));
    }

    #[test]
    fn argv_joins_command_and_args() {
        let spec = VmSpec {
            command: Some(vec!["/bin/app".into()]),
            args: Some(vec!["-v".into()]),
            ..Default::default()
        };
        assert_eq!(spec.argv(), vec!["/bin/app", "-v"]);

        let args_only = VmSpec {
            args: Some(vec!["/bin/sh".into(), "-c".into(), "true".into()]),
            ..Default::default()
        };
        assert_eq!(args_only.argv(), vec!["/bin/sh", "-c", "true"]);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let spec = VmSpec::default();
        assert_eq!(spec.working_dir(), "/");
        assert!(!spec.replace_init());
        assert_eq!(spec.grace_period(), Duration::from_secs(10));
        assert_eq!(spec.security.uid(), 0);
        assert_eq!(Mount::default().mode().unwrap(), 0o755);
    }

    #[test]
    fn bad_mode_is_rejected() {
        let mount = Mount {
            mode: Some("rwx".into()),
            ..Default::default()
        };
        assert!(matches!(
            mount.mode(),
            Err(SpecError::InvalidMode { .. })
        ));
    }
}
