//! plugind bundle - plugin bundles and their assets
//!
//! - `PluginManifest`: the `manifest.yaml` of a plugin
//! - `BundlePackager` / `LocalBundlePackager`: manifest + assets from a directory
//! - `MediaBucket`: content-addressed asset storage

mod error;
mod manifest;
mod media;
mod packager;

pub use error::*;
pub use manifest::*;
pub use media::*;
pub use packager::*;
