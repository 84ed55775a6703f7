//! Workload environment resolution.
//!
//! The final environment is the literal `env` list followed by every
//! `env-from` source's variables, in declaration order. Sources are fetched
//! concurrently and all of them are attempted; a failing optional source
//! contributes nothing, a failing required source fails the whole
//! resolution.

use tracing::{info, warn};
use vm_spec::{EnvFromDecl, EnvFromSource, NameValue};

use crate::config::DEFAULT_PATH;
use crate::error::{InitError, Result};
use crate::join::TaskGroup;
use crate::remote::{RemoteError, Remotes};

pub async fn resolve(
    env: &[NameValue],
    env_from: &[EnvFromDecl],
    remotes: &Remotes,
) -> Result<Vec<NameValue>> {
    let mut group = TaskGroup::new();
    for (index, decl) in env_from.iter().enumerate() {
        let decl = decl.clone();
        let remotes = remotes.clone();
        group.spawn(async move {
            let source = decl
                .source()
                .map_err(|e| e.at(format!("env-from[{index}]")))?;
            let values = match fetch(source, &remotes).await {
                Ok(values) => values,
                Err(e) if source.optional() => {
                    warn!(error = %e, "skipping optional environment source");
                    Vec::new()
                }
                Err(e) => return Err(InitError::Remote(e)),
            };
            Ok((index, values))
        });
    }

    let mut resolved = group.join().await?;
    resolved.sort_by_key(|(index, _)| *index);

    let mut out = env.to_vec();
    out.extend(resolved.into_iter().flat_map(|(_, values)| values));
    info!(count = out.len(), "resolved environment");
    Ok(out)
}

async fn fetch(source: EnvFromSource<'_>, remotes: &Remotes) -> Result<Vec<NameValue>, RemoteError> {
    let map = match source {
        EnvFromSource::Ssm(s) => remotes.parameters.fetch_flat_map(&s.path).await?,
        EnvFromSource::S3(s) => {
            remotes
                .objects
                .fetch_flat_map(&format!("{}/{}", s.bucket, s.key))
                .await?
        }
        EnvFromSource::SecretsManager(s) => remotes.secrets.fetch_flat_map(&s.secret_id).await?,
    };
    let prefix = source.name_prefix();
    Ok(map
        .into_iter()
        .map(|(name, value)| NameValue::new(format!("{prefix}{name}"), value))
        .collect())
}

/// Append the default `PATH` when the environment has none.
pub fn with_default_path(mut env: Vec<NameValue>) -> Vec<NameValue> {
    if !env.iter().any(|nv| nv.name == "PATH") {
        env.push(NameValue::new("PATH", DEFAULT_PATH));
    }
    env
}
