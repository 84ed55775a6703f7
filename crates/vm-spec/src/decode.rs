//! Image metadata baked in at build time.
//!
//! The image builder stores the container image's OCI configuration as
//! JSON. Only the fields that shape the workload are read; identity
//! (`User`) is returned as the raw `user[:group]` string because resolving
//! it needs the image's passwd and group files.

use serde::Deserialize;

use crate::error::SpecError;
use crate::model::{NameValue, Security, VmSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub config: ImageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageConfig {
    pub user: Option<String>,
    pub env: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
}

impl ImageMetadata {
    pub fn from_json(data: &[u8]) -> Result<Self, SpecError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The `user[:group]` string, empty when the image sets none.
    pub fn user(&self) -> &str {
        self.config.user.as_deref().unwrap_or_default()
    }

    /// Build the base spec, running as the already resolved `uid`/`gid`.
    pub fn to_spec(&self, uid: u32, gid: u32) -> VmSpec {
        let config = &self.config;
        VmSpec {
            command: config.entrypoint.clone().filter(|c| !c.is_empty()),
            args: config.cmd.clone(),
            env: config
                .env
                .iter()
                .flatten()
                .map(|entry| match entry.split_once('=') {
                    Some((name, value)) => NameValue::new(name, value),
                    None => NameValue::new(entry.as_str(), ""),
                })
                .collect(),
            working_dir: config.working_dir.clone().filter(|w| !w.is_empty()),
            security: Security {
                run_as_user_id: Some(uid),
                run_as_group_id: Some(gid),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
