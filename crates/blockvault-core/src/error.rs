use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type BlockvaultResult<T> = Result<T, BlockvaultError>;

#[derive(Error, Debug)]
pub enum BlockvaultError {
    #[error("[BV1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[BV1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[BV1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[BV1003] json document error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[BV1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[BV1101] device `{name}` is invalid: {reason}")]
    InvalidDevice { name: String, reason: String },

    #[error("[BV1200] failed to provision backing file {path}: {reason}")]
    Provision { path: PathBuf, reason: String },

    #[error("[BV1300] key generation failed: {0}")]
    KeyGeneration(String),

    #[error("[BV1301] unusable key file {path}: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: String },

    #[error("[BV1400] secret store error: {0}")]
    SecretStore(String),

    #[error("[BV1500] failed to edit table {path}: {reason}")]
    TableEdit { path: PathBuf, reason: String },

    #[error("[BV2000] cipher engine error: {0}")]
    CipherEngine(String),

    #[error("[BV2100] host integration error: {0}")]
    Host(String),
}

impl BlockvaultError {
    pub fn code(&self) -> &'static str {
        match self {
            BlockvaultError::Io(_) => "BV1000",
            BlockvaultError::Toml(_) => "BV1001",
            BlockvaultError::Yaml(_) => "BV1002",
            BlockvaultError::Json(_) => "BV1003",
            BlockvaultError::InvalidConfig(_) => "BV1100",
            BlockvaultError::InvalidDevice { .. } => "BV1101",
            BlockvaultError::Provision { .. } => "BV1200",
            BlockvaultError::KeyGeneration(_) => "BV1300",
            BlockvaultError::InvalidKeyFile { .. } => "BV1301",
            BlockvaultError::SecretStore(_) => "BV1400",
            BlockvaultError::TableEdit { .. } => "BV1500",
            BlockvaultError::CipherEngine(_) => "BV2000",
            BlockvaultError::Host(_) => "BV2100",
        }
    }

    /// Wrap an I/O failure against a table file into a `TableEdit` error.
    pub(crate) fn table(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BlockvaultError::TableEdit {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Wrap an I/O failure against a backing file into a `Provision` error.
    pub(crate) fn provision(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BlockvaultError::Provision {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
