use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tokio::fs;

/// One service entry in the generated compose file. Everything is optional
/// so extension-produced services and user overrides merge cleanly; keys we
/// do not model ourselves ride along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<IndexMap<String, NetworkAttachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl ComposeService {
    /// Attach an alias to the default network. Services running with
    /// `network_mode` cannot carry networks and are left untouched.
    pub fn add_default_alias(&mut self, alias: &str) {
        if self.network_mode.is_some() {
            return;
        }
        let networks = self.networks.get_or_insert_with(IndexMap::new);
        let attachment = networks.entry("default".to_string()).or_default();
        if !attachment.aliases.iter().any(|a| a == alias) {
            attachment.aliases.push(alias.to_string());
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAttachment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// An entry in the top-level `volumes:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

impl ComposeVolume {
    pub fn local() -> Self {
        Self {
            driver: Some("local".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeNetwork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
}

/// The final compose document. Services are plain values at this point:
/// typed construction happens earlier, overrides and extension merges work
/// on the serialized shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComposeFile {
    pub services: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, ComposeVolume>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub networks: IndexMap<String, ComposeNetwork>,
}

impl ComposeFile {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize compose file")
    }

    pub async fn save(&self, output_dir: &Path, file_name: &str) -> Result<()> {
        let path = output_dir.join(file_name);
        fs::write(&path, self.to_yaml()?)
            .await
            .with_context(|| format!("Failed to write compose file {}", path.display()))?;
        Ok(())
    }
}

/// A ConfigMap or Secret key materialised as a file, written at emit time.
#[derive(Debug, Clone)]
pub struct MaterializedFile {
    /// Path relative to the output directory, e.g. `configmaps/app/app.conf`.
    pub rel_path: String,
    pub content: String,
}

/// Deep-merge `overlay` into `base`. Mappings merge recursively, a null
/// overlay value deletes the key, everything else replaces.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    let Value::Mapping(overlay_map) = overlay else {
        *base = overlay.clone();
        return;
    };
    if !base.is_mapping() {
        *base = Value::Mapping(Mapping::new());
    }
    let Some(base_map) = base.as_mapping_mut() else {
        return;
    };
    for (key, value) in overlay_map {
        if value.is_null() {
            base_map.remove(key);
            continue;
        }
        match base_map.get_mut(key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Serialize a typed service into its final value form.
pub fn service_to_value(service: &ComposeService) -> Result<Value> {
    serde_yaml::to_value(service).context("Failed to serialize compose service")
}
