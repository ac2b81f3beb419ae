use crate::compose::{ComposeService, ComposeVolume, MaterializedFile};
use crate::config::ProjectConfig;
use crate::env::resolve_container_env;
use crate::index::{lookup_seq, lookup_str, Manifest, ManifestIndex};
use crate::rewrite::expand_vars;
use crate::volumes::resolve_container_volumes;
use indexmap::IndexMap;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Compose artifacts produced from one workload manifest: the main service,
/// one service per init container and one per sidecar, plus the volume
/// declarations and materialised files they need. `parents` ties every
/// derived service back to the workload so exclusions can take the whole
/// family down.
#[derive(Debug, Default)]
pub struct WorkloadServices {
    pub services: IndexMap<String, ComposeService>,
    pub named_volumes: IndexMap<String, ComposeVolume>,
    pub files: Vec<MaterializedFile>,
    pub parents: IndexMap<String, String>,
}

/// Truncate a service name to a valid hostname: at most 63 characters,
/// trimmed back until it ends in an alphanumeric.
pub fn truncate_hostname(name: &str) -> String {
    let mut hostname: String = name.chars().take(63).collect();
    while hostname
        .chars()
        .last()
        .is_some_and(|c| !c.is_ascii_alphanumeric())
    {
        hostname.pop();
    }
    hostname
}

/// Build all compose services for one workload manifest.
///
/// `published` carries the host ports phase 3 derived from NodePort and
/// LoadBalancer Services; ClusterIP-only ports never publish.
pub fn build_workload(
    manifest: &Manifest,
    index: &ManifestIndex,
    config: &ProjectConfig,
    published: &BTreeMap<String, Vec<(u16, u16)>>,
    warnings: &mut Vec<String>,
) -> Option<WorkloadServices> {
    let workload = manifest.name.clone();
    let Some(pod_spec) = manifest.pod_spec().cloned() else {
        warnings.push(format!(
            "{} {} has no pod template and was skipped",
            manifest.kind, workload
        ));
        return None;
    };
    let containers: Vec<Value> = lookup_seq(&pod_spec, &["containers"]).cloned().collect();
    if containers.is_empty() {
        warnings.push(format!(
            "{} {} has no containers and was skipped",
            manifest.kind, workload
        ));
        return None;
    }

    let restart = if manifest.kind == "Job" {
        "on-failure"
    } else {
        "unless-stopped"
    };
    let mut result = WorkloadServices::default();

    // init containers run once and exit; nothing depends on them
    for init in lookup_seq(&pod_spec, &["initContainers"]) {
        let Some(container_name) = lookup_str(init, &["name"]) else {
            continue;
        };
        let service_name = format!("{}-init-{}", workload, container_name);
        let mut service = build_container(
            init,
            &pod_spec,
            &service_name,
            index,
            config,
            warnings,
            &mut result,
        );
        service.restart = Some("on-failure".to_string());
        apply_hostname_rule(&service_name, &mut service);
        result.parents.insert(service_name.clone(), workload.clone());
        result.services.insert(service_name, service);
    }

    let main = &containers[0];
    let mut service = build_container(
        main,
        &pod_spec,
        &workload,
        index,
        config,
        warnings,
        &mut result,
    );
    service.restart = Some(restart.to_string());
    if let Some(ports) = published.get(&workload) {
        let mut seen = Vec::new();
        for (host, container) in ports {
            let entry = format!("{}:{}", host, container);
            if !seen.contains(&entry) {
                seen.push(entry);
            }
        }
        service.ports = seen;
    }
    apply_hostname_rule(&workload, &mut service);
    result.parents.insert(workload.clone(), workload.clone());
    result.services.insert(workload.clone(), service);

    // sidecars share the main service's network namespace, so they can
    // carry neither ports nor networks of their own
    for sidecar in &containers[1..] {
        let Some(container_name) = lookup_str(sidecar, &["name"]) else {
            continue;
        };
        let service_name = format!("{}-{}", workload, container_name);
        let mut service = build_container(
            sidecar,
            &pod_spec,
            &service_name,
            index,
            config,
            warnings,
            &mut result,
        );
        service.restart = Some(restart.to_string());
        service.network_mode = Some(format!("container:{}", workload));
        service.ports.clear();
        service.networks = None;
        result.parents.insert(service_name.clone(), workload.clone());
        result.services.insert(service_name, service);
    }

    Some(result)
}

fn build_container(
    container: &Value,
    pod_spec: &Value,
    service_name: &str,
    index: &ManifestIndex,
    config: &ProjectConfig,
    warnings: &mut Vec<String>,
    result: &mut WorkloadServices,
) -> ComposeService {
    let image = lookup_str(container, &["image"]).map(str::to_string);
    if image.is_none() {
        warnings.push(format!("{}: container has no image", service_name));
    }

    let environment = resolve_container_env(container, index, service_name, warnings);

    // Kubernetes command/args map to compose entrypoint/command, both with
    // kubelet $(VAR) expansion against the resolved environment
    let entrypoint = string_list(container, "command")
        .map(|list| list.iter().map(|s| expand_vars(s, &environment)).collect());
    let command = string_list(container, "args")
        .map(|list| list.iter().map(|s| expand_vars(s, &environment)).collect());

    let volumes = resolve_container_volumes(
        pod_spec,
        container,
        index,
        config,
        service_name,
        warnings,
    );
    for (name, declaration) in volumes.named {
        result.named_volumes.entry(name).or_insert(declaration);
    }
    for file in volumes.files {
        if !result.files.iter().any(|f| f.rel_path == file.rel_path) {
            result.files.push(file);
        }
    }

    ComposeService {
        image,
        entrypoint,
        command,
        environment,
        volumes: volumes.mounts,
        ..ComposeService::default()
    }
}

fn apply_hostname_rule(service_name: &str, service: &mut ComposeService) {
    // names longer than 63 characters make sethostname fail on some
    // runtimes; sidecars join another namespace and must not set one
    if service_name.len() > 63 && service.network_mode.is_none() {
        service.hostname = Some(truncate_hostname(service_name));
    }
}

fn string_list(container: &Value, key: &str) -> Option<Vec<String>> {
    let values: Vec<String> = lookup_seq(container, &[key])
        .filter_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
        .collect();
    if crate::index::lookup(container, &[key]).is_none() {
        None
    } else {
        Some(values)
    }
}
