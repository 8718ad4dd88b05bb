//! Bundle packagers
//!
//! A bundle is a manifest plus named assets. The local packager reads a
//! directory laid out as
//!
//! ```text
//! <dir>/manifest.yaml
//! <dir>/_assets/<name>
//! ```

use crate::error::{BundleError, Result};
use crate::manifest::PluginManifest;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const ASSETS_DIR: &str = "_assets";

pub trait BundlePackager: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    fn manifest_mut(&mut self) -> &mut PluginManifest;

    /// Asset name (forward-slash relative path) to content
    fn assets(&self) -> &BTreeMap<String, Vec<u8>>;

    fn set_asset(&mut self, name: &str, content: Vec<u8>) -> Result<()>;

    fn remove_asset(&mut self, name: &str) -> Option<Vec<u8>>;

    /// Persist manifest and assets back to the source.
    fn save(&self) -> Result<()>;
}

/// Directory-backed bundle
#[derive(Debug, Clone)]
pub struct LocalBundlePackager {
    path: PathBuf,
    manifest: PluginManifest,
    assets: BTreeMap<String, Vec<u8>>,
}

impl LocalBundlePackager {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let manifest_path = path.join(MANIFEST_FILE);
        let yaml = match std::fs::read_to_string(&manifest_path) {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::MissingManifest(manifest_path));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = PluginManifest::from_yaml(&yaml)?;

        let mut assets = BTreeMap::new();
        let assets_root = path.join(ASSETS_DIR);
        if assets_root.is_dir() {
            for entry in WalkDir::new(&assets_root) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = asset_name(&assets_root, entry.path())?;
                assets.insert(name, std::fs::read(entry.path())?);
            }
        }

        debug!(
            "Opened bundle {}/{} at {} ({} assets)",
            manifest.author,
            manifest.name,
            path.display(),
            assets.len()
        );

        Ok(Self {
            path,
            manifest,
            assets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BundlePackager for LocalBundlePackager {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn manifest_mut(&mut self) -> &mut PluginManifest {
        &mut self.manifest
    }

    fn assets(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.assets
    }

    fn set_asset(&mut self, name: &str, content: Vec<u8>) -> Result<()> {
        validate_asset_name(name)?;
        self.assets.insert(name.to_string(), content);
        Ok(())
    }

    fn remove_asset(&mut self, name: &str) -> Option<Vec<u8>> {
        self.assets.remove(name)
    }

    fn save(&self) -> Result<()> {
        let assets_root = self.path.join(ASSETS_DIR);
        for (name, content) in &self.assets {
            let target = assets_root.join(name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }

        std::fs::write(self.path.join(MANIFEST_FILE), self.manifest.to_yaml()?)?;
        Ok(())
    }
}

fn asset_name(root: &Path, file: &Path) -> Result<String> {
    let relative = file
        .strip_prefix(root)
        .map_err(|_| BundleError::InvalidAssetName(file.display().to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Asset names stay inside `_assets/`.
fn validate_asset_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(BundleError::InvalidAssetName(name.to_string()))
    }
}
