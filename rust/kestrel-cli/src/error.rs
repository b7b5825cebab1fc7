use crate::config::ConfigError;
use kestrel_runtime::{DeserializerError, SerializerError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid json in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode: {0}")]
    Encode(String),
    #[error(transparent)]
    Serialize(#[from] SerializerError),
    #[error(transparent)]
    Deserialize(#[from] DeserializerError),
    #[error(transparent)]
    Toml(#[from] toml::ser::Error),
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
}

impl CliError {
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> CliError {
        let path = path.into();
        move |source| CliError::Io { path, source }
    }
}
