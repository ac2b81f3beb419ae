use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Current on-disk schema version.
pub const CONFIG_VERSION: u32 = 1;

/// File name of the persisted project configuration inside the output
/// directory.
pub const CONFIG_FILE: &str = "composify.yaml";

/// Persistent, user-editable project configuration. Written on first run,
/// loaded and re-saved on every run afterwards; keys we do not know about
/// round-trip verbatim through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default = "default_volume_root")]
    pub volume_root: String,
    #[serde(default, skip_serializing_if = "ExtensionSettings::is_default")]
    pub extensions: ExtensionSettings,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, VolumeSettings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<Replacement>,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub overrides: Mapping,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub services: Mapping,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub ingress_types: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_ingress: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fix_permissions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSettings {
    #[serde(default, skip_serializing_if = "CaddySettings::is_default")]
    pub caddy: CaddySettings,
}

impl ExtensionSettings {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaddySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tls_internal: bool,
}

impl CaddySettings {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A named volume entry. `host_path` turns the volume into a bind mount;
/// bare names resolve under `volume_root`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

/// A literal string replacement applied during post-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replacement {
    pub old: String,
    pub new: String,
}

impl ProjectConfig {
    pub fn new(name: &str) -> Self {
        Self {
            version: CONFIG_VERSION,
            name: name.to_string(),
            volume_root: "./data".to_string(),
            extensions: ExtensionSettings::default(),
            volumes: IndexMap::new(),
            exclude: Vec::new(),
            replacements: Vec::new(),
            overrides: Mapping::new(),
            services: Mapping::new(),
            ingress_types: IndexMap::new(),
            disable_ingress: false,
            fix_permissions: false,
            network: None,
            extra: Mapping::new(),
        }
    }

    /// Load the configuration from an output directory, or create a fresh
    /// one when none exists yet. A corrupt file is fatal; a legacy file is
    /// migrated with a notice on stderr.
    pub async fn load_or_init(output_dir: &Path, default_name: &str) -> Result<Self> {
        let path = output_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::new(default_name));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read project config {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Malformed project config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut raw: Value =
            serde_yaml::from_str(content).context("Failed to parse project config YAML")?;
        migrate(&mut raw);
        let config: Self =
            serde_yaml::from_value(raw).context("Project config has an invalid shape")?;
        Ok(config)
    }

    /// Serialize in the stable on-disk form. Re-emitting a file written by
    /// us is byte-identical.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize project config")
    }

    /// Write the config, only touching the file when the content changed so
    /// timestamps stay meaningful for the user.
    pub async fn save(&self, output_dir: &Path) -> Result<()> {
        let path = output_dir.join(CONFIG_FILE);
        let content = self.to_yaml()?;
        if let Ok(existing) = tokio::fs::read_to_string(&path).await {
            if existing == content {
                return Ok(());
            }
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write project config {}", path.display()))?;
        Ok(())
    }
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_volume_root() -> String {
    "./data".to_string()
}

/// Rename legacy keys in place. Old names disappear on the next save.
fn migrate(raw: &mut Value) {
    let Some(mapping) = raw.as_mapping_mut() else {
        return;
    };
    if let Some(root) = mapping.remove("root") {
        if !mapping.contains_key("volume_root") {
            eprintln!("composify: migrating legacy config key root -> volume_root");
            mapping.insert("volume_root".into(), root);
        }
    }
    if let Some(caddy) = mapping.remove("caddy") {
        if !mapping.contains_key("extensions") {
            eprintln!("composify: migrating legacy config key caddy -> extensions.caddy");
            let mut extensions = Mapping::new();
            extensions.insert("caddy".into(), caddy);
            mapping.insert("extensions".into(), Value::Mapping(extensions));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProjectConfig::new("meet");
        assert_eq!(config.volume_root, "./data");
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(!config.disable_ingress);
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let mut config = ProjectConfig::new("meet");
        config.exclude.push("meet-celery-*".to_string());
        config
            .ingress_types
            .insert("nginx".to_string(), "nginx".to_string());
        let first = config.to_yaml().unwrap();
        let reloaded = ProjectConfig::parse(&first).unwrap();
        let second = reloaded.to_yaml().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_keys_survive() {
        let yaml = "version: 1\nname: app\nvolume_root: ./data\ncustom_note: keep me\n";
        let config = ProjectConfig::parse(yaml).unwrap();
        let out = config.to_yaml().unwrap();
        assert!(out.contains("custom_note: keep me"));
    }

    #[test]
    fn test_legacy_keys_migrate() {
        let yaml = "version: 1\nname: app\nroot: ./state\ncaddy:\n  email: ops@example.com\n";
        let config = ProjectConfig::parse(yaml).unwrap();
        assert_eq!(config.volume_root, "./state");
        assert_eq!(
            config.extensions.caddy.email.as_deref(),
            Some("ops@example.com")
        );
        let out = config.to_yaml().unwrap();
        assert!(!out.contains("\nroot:"));
        assert!(!out.contains("\ncaddy:"));
    }
}
