use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BundleError>;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Manifest not found: {0}")]
    MissingManifest(PathBuf),

    #[error("Invalid asset name: {0}")]
    InvalidAssetName(String),

    #[error("Invalid media id: {0}")]
    InvalidMediaId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),
}
