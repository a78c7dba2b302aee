//! Resource manifests loaded from TOML.
//!
//! Each `.toml` file in a manifest directory holds one or more
//! `[[resource]]` tables:
//!
//! ```toml
//! [[resource]]
//! namespace = "default"   # optional
//! name = "r1"
//!
//! [resource.spec]
//! foo = "x"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{DEFAULT_NAMESPACE, ResourceKey, ResourceSpec};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    resource: Vec<RawManifest>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    namespace: Option<String>,
    name: String,
    #[serde(default)]
    spec: ResourceSpec,
}

/// A resource to create at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceManifest {
    pub key: ResourceKey,
    pub spec: ResourceSpec,
}

/// Parse the manifests in one TOML document.
pub fn parse_str(content: &str) -> Result<Vec<ResourceManifest>> {
    let file: ManifestFile =
        toml::from_str(content).map_err(|e| Error::Manifest(format!("bad manifest: {e}")))?;

    file.resource
        .into_iter()
        .map(|raw| {
            let namespace = raw.namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
            Ok(ResourceManifest {
                key: ResourceKey::new(namespace, raw.name)?,
                spec: raw.spec,
            })
        })
        .collect()
}

/// Load all `.toml` files from a directory, in file-name order.
pub fn load_from_dir(dir: &Path) -> Result<Vec<ResourceManifest>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Manifest(format!("cannot read manifest dir {}: {e}", dir.display()))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut manifests = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        let parsed = parse_str(&content)
            .map_err(|e| Error::Manifest(format!("{}: {e}", path.display())))?;
        manifests.extend(parsed);
    }
    Ok(manifests)
}
