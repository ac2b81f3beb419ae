use crate::compose::{ComposeVolume, MaterializedFile};
use crate::config::ProjectConfig;
use crate::env::secret_value;
use crate::index::{lookup, lookup_seq, lookup_str, ManifestIndex};
use indexmap::IndexMap;
use serde_yaml::Value;

/// Everything one container contributes to the volume side of the compose
/// file: mount strings, named-volume declarations and files to materialise
/// at emit time.
#[derive(Debug, Default)]
pub struct ResolvedVolumes {
    pub mounts: Vec<String>,
    pub named: IndexMap<String, ComposeVolume>,
    pub files: Vec<MaterializedFile>,
}

/// Resolve a host path from the project config: explicit when it starts
/// with `./`, `/` or `~`, otherwise a bare name under `volume_root`.
pub fn resolve_host_path(path: &str, volume_root: &str) -> String {
    if path.starts_with("./") || path.starts_with('/') || path.starts_with('~') {
        path.to_string()
    } else {
        format!("{}/{}", volume_root.trim_end_matches('/'), path)
    }
}

/// Map one container's `volumeMounts` against the pod `volumes` list.
pub fn resolve_container_volumes(
    pod_spec: &Value,
    container: &Value,
    index: &ManifestIndex,
    config: &ProjectConfig,
    service_name: &str,
    warnings: &mut Vec<String>,
) -> ResolvedVolumes {
    let mut resolved = ResolvedVolumes::default();

    for mount in lookup_seq(container, &["volumeMounts"]) {
        let Some(volume_name) = lookup_str(mount, &["name"]) else {
            continue;
        };
        let Some(mount_path) = lookup_str(mount, &["mountPath"]) else {
            continue;
        };
        let read_only = lookup(mount, &["readOnly"])
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let sub_path = lookup_str(mount, &["subPath"]);

        let Some(volume) = lookup_seq(pod_spec, &["volumes"])
            .find(|v| lookup_str(v, &["name"]) == Some(volume_name))
        else {
            warnings.push(format!(
                "{}: volumeMount {} has no matching pod volume",
                service_name, volume_name
            ));
            continue;
        };

        if let Some(claim) = lookup_str(volume, &["persistentVolumeClaim", "claimName"]) {
            resolve_claim(claim, mount_path, read_only, config, &mut resolved);
        } else if let Some(name) = lookup_str(volume, &["configMap", "name"]) {
            resolve_data_volume(
                DataVolume {
                    kind: "ConfigMap",
                    dir: "configmaps",
                    name,
                    mount_path,
                    sub_path,
                    read_only,
                    items: volume.get("configMap").and_then(|v| lookup(v, &["items"])),
                },
                index,
                service_name,
                &mut resolved,
                warnings,
            );
        } else if let Some(name) = lookup_str(volume, &["secret", "secretName"]) {
            resolve_data_volume(
                DataVolume {
                    kind: "Secret",
                    dir: "secrets",
                    name,
                    mount_path,
                    sub_path,
                    read_only,
                    items: volume.get("secret").and_then(|v| lookup(v, &["items"])),
                },
                index,
                service_name,
                &mut resolved,
                warnings,
            );
        } else if volume.get("emptyDir").is_some() {
            // anonymous volume, not shared across services even if the pod
            // shared it between containers
            resolved.mounts.push(mount_path.to_string());
        } else if let Some(path) = lookup_str(volume, &["hostPath", "path"]) {
            resolved
                .mounts
                .push(mount_string(path, mount_path, read_only));
        } else {
            warnings.push(format!(
                "{}: volume {} has an unsupported source and was skipped",
                service_name, volume_name
            ));
        }
    }

    resolved
}

fn resolve_claim(
    claim: &str,
    mount_path: &str,
    read_only: bool,
    config: &ProjectConfig,
    resolved: &mut ResolvedVolumes,
) {
    let settings = config.volumes.get(claim);
    if let Some(host_path) = settings.and_then(|s| s.host_path.as_deref()) {
        let source = resolve_host_path(host_path, &config.volume_root);
        resolved
            .mounts
            .push(mount_string(&source, mount_path, read_only));
        return;
    }
    let driver = settings
        .and_then(|s| s.driver.clone())
        .unwrap_or_else(|| "local".to_string());
    resolved.named.insert(
        claim.to_string(),
        ComposeVolume {
            driver: Some(driver),
        },
    );
    resolved
        .mounts
        .push(mount_string(claim, mount_path, read_only));
}

struct DataVolume<'a> {
    kind: &'a str,
    dir: &'a str,
    name: &'a str,
    mount_path: &'a str,
    sub_path: Option<&'a str>,
    read_only: bool,
    items: Option<&'a Value>,
}

/// Materialise a ConfigMap or Secret volume as files under the output
/// directory and emit the matching bind mounts.
fn resolve_data_volume(
    volume: DataVolume<'_>,
    index: &ManifestIndex,
    service_name: &str,
    resolved: &mut ResolvedVolumes,
    warnings: &mut Vec<String>,
) {
    let Some(manifest) = index.get(volume.kind, volume.name) else {
        warnings.push(format!(
            "{}: volume references missing {} {}",
            service_name, volume.kind, volume.name
        ));
        return;
    };

    // key -> file name under the materialised directory
    let mut selected: Vec<(String, String)> = Vec::new();
    match volume.items.and_then(|v| v.as_sequence()) {
        Some(items) => {
            for item in items {
                if let Some(key) = lookup_str(item, &["key"]) {
                    let path = lookup_str(item, &["path"]).unwrap_or(key);
                    selected.push((key.to_string(), path.to_string()));
                }
            }
        }
        None => {
            let keys: Vec<String> = manifest
                .map_field(&["data"])
                .into_iter()
                .flatten()
                .chain(manifest.map_field(&["stringData"]).into_iter().flatten())
                .filter_map(|(key, _)| key.as_str().map(str::to_string))
                .collect();
            for key in keys {
                selected.push((key.clone(), key));
            }
        }
    }

    for (key, file_name) in &selected {
        let content = if volume.kind == "Secret" {
            secret_value(index, volume.name, key)
        } else {
            manifest
                .field(&["data", key.as_str()])
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let Some(content) = content else {
            warnings.push(format!(
                "{}: {} {} has no usable key {}",
                service_name, volume.kind, volume.name, key
            ));
            continue;
        };
        resolved.files.push(MaterializedFile {
            rel_path: format!("{}/{}/{}", volume.dir, volume.name, file_name),
            content,
        });
    }

    match volume.sub_path {
        Some(sub_path) => {
            resolved.mounts.push(mount_string(
                &format!("./{}/{}/{}", volume.dir, volume.name, sub_path),
                volume.mount_path,
                volume.read_only,
            ));
        }
        None if volume.items.is_some() => {
            for (_, file_name) in &selected {
                resolved.mounts.push(mount_string(
                    &format!("./{}/{}/{}", volume.dir, volume.name, file_name),
                    &format!("{}/{}", volume.mount_path.trim_end_matches('/'), file_name),
                    volume.read_only,
                ));
            }
        }
        None => {
            resolved.mounts.push(mount_string(
                &format!("./{}/{}", volume.dir, volume.name),
                volume.mount_path,
                volume.read_only,
            ));
        }
    }
}

fn mount_string(source: &str, target: &str, read_only: bool) -> String {
    if read_only {
        format!("{}:{}:ro", source, target)
    } else {
        format!("{}:{}", source, target)
    }
}
