use crate::index::{lookup_seq, lookup_str, ManifestIndex};
use crate::rewrite::{escape_shell_vars, expand_vars};
use base64::{engine::general_purpose, Engine as _};
use indexmap::IndexMap;
use serde_yaml::Value;

/// Read one ConfigMap data value. Scalars that the chart rendered as
/// numbers or booleans are stringified.
pub fn configmap_value(index: &ManifestIndex, name: &str, key: &str) -> Option<String> {
    let manifest = index.get("ConfigMap", name)?;
    manifest
        .field(&["data", key])
        .and_then(scalar_to_string)
}

/// Read one Secret value, decoding `data` and falling back to `stringData`.
pub fn secret_value(index: &ManifestIndex, name: &str, key: &str) -> Option<String> {
    let manifest = index.get("Secret", name)?;
    if let Some(encoded) = manifest.str_field(&["data", key]) {
        let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
        return String::from_utf8(decoded).ok();
    }
    manifest
        .field(&["stringData", key])
        .and_then(scalar_to_string)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resolve a container's environment into an ordered mapping.
///
/// `envFrom` sources expand first, then `env` entries in order: literals go
/// through kubelet `$(VAR)` expansion against previously resolved entries,
/// references into ConfigMaps and Secrets are chased through the index, and
/// `fieldRef` supports `status.podIP` only (it resolves to the compose
/// service name, which is what peers can actually reach). A final pass
/// escapes stray `$` so Compose does not interpolate them.
pub fn resolve_container_env(
    container: &Value,
    index: &ManifestIndex,
    service_name: &str,
    warnings: &mut Vec<String>,
) -> IndexMap<String, String> {
    let mut resolved: IndexMap<String, String> = IndexMap::new();

    for source in lookup_seq(container, &["envFrom"]) {
        let prefix = lookup_str(source, &["prefix"]).unwrap_or("");
        if let Some(name) = lookup_str(source, &["configMapRef", "name"]) {
            match index.get("ConfigMap", name) {
                Some(manifest) => {
                    for (key, value) in manifest.map_field(&["data"]).into_iter().flatten() {
                        if let (Some(key), Some(value)) =
                            (key.as_str(), scalar_to_string(value))
                        {
                            resolved.insert(format!("{}{}", prefix, key), value);
                        }
                    }
                }
                None => warnings.push(format!(
                    "{}: envFrom references missing ConfigMap {}",
                    service_name, name
                )),
            }
        }
        if let Some(name) = lookup_str(source, &["secretRef", "name"]) {
            match index.get("Secret", name) {
                Some(manifest) => {
                    let keys: Vec<String> = manifest
                        .map_field(&["data"])
                        .into_iter()
                        .flatten()
                        .chain(manifest.map_field(&["stringData"]).into_iter().flatten())
                        .filter_map(|(key, _)| key.as_str().map(str::to_string))
                        .collect();
                    for key in keys {
                        if let Some(value) = secret_value(index, name, &key) {
                            resolved.insert(format!("{}{}", prefix, key), value);
                        }
                    }
                }
                None => warnings.push(format!(
                    "{}: envFrom references missing Secret {}",
                    service_name, name
                )),
            }
        }
    }

    for entry in lookup_seq(container, &["env"]) {
        let Some(name) = lookup_str(entry, &["name"]) else {
            continue;
        };
        if let Some(value) = crate::index::lookup(entry, &["value"]).and_then(scalar_to_string) {
            let expanded = expand_vars(&value, &resolved);
            resolved.insert(name.to_string(), expanded);
            continue;
        }
        if let Some(reference) = crate::index::lookup(entry, &["valueFrom"]) {
            if let Some(resolved_value) =
                resolve_value_from(reference, index, service_name, name, warnings)
            {
                resolved.insert(name.to_string(), resolved_value);
            }
            continue;
        }
        // bare `name:` with neither value nor valueFrom renders as empty
        resolved.insert(name.to_string(), String::new());
    }

    for value in resolved.values_mut() {
        *value = escape_shell_vars(value);
    }
    resolved
}

fn resolve_value_from(
    reference: &Value,
    index: &ManifestIndex,
    service_name: &str,
    env_name: &str,
    warnings: &mut Vec<String>,
) -> Option<String> {
    if let Some(name) = lookup_str(reference, &["configMapKeyRef", "name"]) {
        let key = lookup_str(reference, &["configMapKeyRef", "key"]).unwrap_or("");
        return match configmap_value(index, name, key) {
            Some(value) => Some(value),
            None => {
                warnings.push(format!(
                    "{}: env {} references missing ConfigMap key {}/{}",
                    service_name, env_name, name, key
                ));
                None
            }
        };
    }
    if let Some(name) = lookup_str(reference, &["secretKeyRef", "name"]) {
        let key = lookup_str(reference, &["secretKeyRef", "key"]).unwrap_or("");
        return match secret_value(index, name, key) {
            Some(value) => Some(value),
            None => {
                warnings.push(format!(
                    "{}: env {} references missing Secret key {}/{}",
                    service_name, env_name, name, key
                ));
                None
            }
        };
    }
    if let Some(field_path) = lookup_str(reference, &["fieldRef", "fieldPath"]) {
        if field_path == "status.podIP" {
            return Some(service_name.to_string());
        }
        warnings.push(format!(
            "{}: env {} uses unsupported fieldRef {}",
            service_name, env_name, field_path
        ));
        return None;
    }
    warnings.push(format!(
        "{}: env {} has an unsupported valueFrom source",
        service_name, env_name
    ));
    None
}
