//! Remote configuration stores: the parameter store, the object store and
//! the secrets store.
//!
//! The init only needs three read shapes from them, captured by
//! [`RemoteStore`]. Region-bound clients are produced by a [`Connector`]
//! once the instance region is known.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{store} {path}: not found")]
    NotFound { store: &'static str, path: String },

    #[error("{store} {path}: {detail}")]
    Fetch {
        store: &'static str,
        path: String,
        detail: String,
    },

    #[error("{store}: no client available in region {region}")]
    Unavailable { store: &'static str, region: String },
}

/// One leaf of a fetched tree. `path` is relative to the requested root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub data: Bytes,
}

#[async_trait]
pub trait RemoteStore: Send + Sync + fmt::Debug {
    /// Every leaf below `path`.
    async fn fetch_tree(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// `path` as a flat name to value map.
    async fn fetch_flat_map(&self, path: &str) -> Result<BTreeMap<String, String>, RemoteError>;

    /// A single value.
    async fn fetch_bytes(&self, id: &str) -> Result<Bytes, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct Remotes {
    pub parameters: Arc<dyn RemoteStore>,
    pub objects: Arc<dyn RemoteStore>,
    pub secrets: Arc<dyn RemoteStore>,
}

pub trait Connector: Send + Sync {
    fn connect(&self, region: &str) -> Result<Remotes, RemoteError>;
}

// ---------------------------------------------------------------------------
// Offline connector
// ---------------------------------------------------------------------------

/// Connector for images built without remote store clients. Connecting
/// succeeds so specs without remote sources boot normally; any actual
/// fetch reports the store as unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineConnector;

impl Connector for OfflineConnector {
    fn connect(&self, region: &str) -> Result<Remotes, RemoteError> {
        let store = |name| -> Arc<dyn RemoteStore> {
            Arc::new(OfflineStore {
                name,
                region: region.to_string(),
            })
        };
        Ok(Remotes {
            parameters: store("ssm"),
            objects: store("s3"),
            secrets: store("secrets-manager"),
        })
    }
}

#[derive(Debug)]
struct OfflineStore {
    name: &'static str,
    region: String,
}

impl OfflineStore {
    fn unavailable(&self) -> RemoteError {
        RemoteError::Unavailable {
            store: self.name,
            region: self.region.clone(),
        }
    }
}

#[async_trait]
impl RemoteStore for OfflineStore {
    async fn fetch_tree(&self, _path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        Err(self.unavailable())
    }

    async fn fetch_flat_map(&self, _path: &str) -> Result<BTreeMap<String, String>, RemoteError> {
        Err(self.unavailable())
    }

    async fn fetch_bytes(&self, _id: &str) -> Result<Bytes, RemoteError> {
        Err(self.unavailable())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// A store backed by a fixed key/value map, keyed by full path.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    name: &'static str,
    entries: BTreeMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: BTreeMap::new(),
        }
    }

    pub fn with(mut self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.entries.insert(path.into(), data.into());
        self
    }

    /// Entries strictly below `path`, with the prefix stripped.
    fn below<'a>(&'a self, path: &str) -> impl Iterator<Item = (&'a str, &'a Bytes)> + 'a {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.entries.iter().filter_map(move |(key, data)| {
            key.strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest, data))
        })
    }

    fn not_found(&self, path: &str) -> RemoteError {
        RemoteError::NotFound {
            store: self.name,
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch_tree(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let entries: Vec<_> = self
            .below(path)
            .map(|(rest, data)| RemoteEntry {
                path: rest.to_string(),
                data: data.clone(),
            })
            .collect();
        if entries.is_empty() {
            return Err(self.not_found(path));
        }
        Ok(entries)
    }

    async fn fetch_flat_map(&self, path: &str) -> Result<BTreeMap<String, String>, RemoteError> {
        let map: BTreeMap<_, _> = self
            .below(path)
            .filter(|(rest, _)| !rest.contains('/'))
            .map(|(rest, data)| {
                std::str::from_utf8(data)
                    .map(|value| (rest.to_string(), value.to_string()))
                    .map_err(|e| RemoteError::Fetch {
                        store: self.name,
                        path: format!("{}/{rest}", path.trim_end_matches('/')),
                        detail: e.to_string(),
                    })
            })
            .collect::<Result<_, _>>()?;
        if map.is_empty() {
            return Err(self.not_found(path));
        }
        Ok(map)
    }

    async fn fetch_bytes(&self, id: &str) -> Result<Bytes, RemoteError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| self.not_found(id))
    }
}
