//! Error types for decoding and validating a [`VmSpec`](crate::VmSpec).

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("user data: {0}")]
    UserData(#[from] serde_yaml_ng::Error),

    #[error("image metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("{field}: expected exactly one source, found {count}")]
    SourceCount { field: String, count: usize },

    #[error("{field}: invalid mode {mode:?}, expected an octal string")]
    InvalidMode { field: String, mode: String },
}

impl SpecError {
    /// Re-anchor a positional error at `field`, e.g. `volumes[2]`.
    pub fn at(self, at: String) -> Self {
        match self {
            Self::SourceCount { count, .. } => Self::SourceCount { field: at, count },
            Self::InvalidMode { mode, .. } => Self::InvalidMode { field: at, mode },
            other => other,
        }
    }
}
