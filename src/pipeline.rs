use crate::compose::{
    deep_merge, service_to_value, ComposeFile, ComposeNetwork, ComposeService, ComposeVolume,
    MaterializedFile,
};
use crate::config::ProjectConfig;
use crate::env::secret_value;
use crate::extensions::{ContextSnapshot, ExtensionRegistry};
use crate::index::{lookup, lookup_str, Manifest, ManifestIndex};
use crate::ingress::{
    caddy_service, resolve_class, BackendResolver, CaddyfileRenderer, IngressEntry,
};
use crate::rewrite::{apply_replacements, resolve_placeholders, PortRemapper};
use crate::service::build_workload;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Converter fan-out is re-evaluated for synthetic manifests at most this
/// many times before the pipeline gives up and proceeds.
const MAX_CONVERTER_CYCLES: usize = 3;

/// Where a Kubernetes Service name points: the compose service of the
/// workload its selector matched, plus the namespace the DNS-style alias
/// variants are derived from.
#[derive(Debug, Clone)]
pub struct ServiceAlias {
    pub namespace: String,
    pub workload: String,
}

/// Everything one pipeline run produced. Emission is separate so no file
/// is touched before the pipeline has fully completed.
pub struct ConversionOutput {
    pub compose: ComposeFile,
    pub caddyfile: Option<String>,
    pub caddyfile_name: String,
    pub files: Vec<MaterializedFile>,
    pub warnings: Vec<String>,
    pub config: ProjectConfig,
}

impl ConversionOutput {
    /// Write `compose.yml`, the Caddyfile, materialised ConfigMap and
    /// Secret files, and the persisted project config.
    pub async fn write(&self, output_dir: &Path, compose_file_name: &str) -> Result<()> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create output dir {}", output_dir.display()))?;
        self.compose.save(output_dir, compose_file_name).await?;
        if let Some(caddyfile) = &self.caddyfile {
            let path = output_dir.join(&self.caddyfile_name);
            tokio::fs::write(&path, caddyfile)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        for file in &self.files {
            let path = output_dir.join(&file.rel_path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&path, &file.content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        self.config.save(output_dir).await?;
        Ok(())
    }
}

/// Run the conversion pipeline over a batch of parsed documents.
///
/// The phases run strictly in order; each one only observes what the
/// previous phases produced. Nothing here performs file I/O.
pub fn convert(
    documents: Vec<Value>,
    config: ProjectConfig,
    registry: &ExtensionRegistry,
    mut warnings: Vec<String>,
) -> Result<ConversionOutput> {
    // phase 1: ingest & index
    let claimed = registry.claimed_kinds();
    let mut index = ManifestIndex::new();
    index.ingest(documents, &claimed, &mut warnings);
    log::debug!("indexed {} manifests", index.len());

    // phase 2: converter fan-out, synthetic manifests re-evaluated
    let mut extension_services: IndexMap<String, Value> = IndexMap::new();
    let mut extension_ingress: Vec<IngressEntry> = Vec::new();
    run_converters(
        &mut index,
        registry,
        &config,
        &mut extension_services,
        &mut extension_ingress,
        &mut warnings,
    );

    // phase 3: alias map, service-port map, published host ports
    let (aliases, service_ports, published) = build_service_maps(&index);

    // phase 4: workload build
    let mut services: IndexMap<String, ComposeService> = IndexMap::new();
    let mut named_volumes: IndexMap<String, ComposeVolume> = IndexMap::new();
    let mut files: Vec<MaterializedFile> = Vec::new();
    let mut parents: IndexMap<String, String> = IndexMap::new();
    for manifest in index.workloads() {
        let Some(built) = build_workload(manifest, &index, &config, &published, &mut warnings)
        else {
            continue;
        };
        for (name, service) in built.services {
            services.insert(name, service);
        }
        for (name, declaration) in built.named_volumes {
            named_volumes.entry(name).or_insert(declaration);
        }
        for file in built.files {
            if !files.iter().any(|f| f.rel_path == file.rel_path) {
                files.push(file);
            }
        }
        for (name, parent) in built.parents {
            parents.insert(name, parent);
        }
    }
    for (name, spec) in &extension_services {
        match serde_yaml::from_value::<ComposeService>(spec.clone()) {
            Ok(service) => {
                parents.insert(name.clone(), name.clone());
                services.insert(name.clone(), service);
            }
            Err(err) => warnings.push(format!(
                "extension service {} has an invalid shape: {}",
                name, err
            )),
        }
    }

    log::debug!("built {} compose services from workloads", services.len());

    // phase 5: ingress build
    let snapshot = context_snapshot(&index, &config, &aliases, &service_ports);
    let mut entries = build_ingress_entries(&index, registry, &config, &snapshot, &mut warnings);
    entries.extend(extension_ingress);
    let resolver = BackendResolver {
        index: &index,
        aliases: &aliases,
        service_ports: &service_ports,
    };
    resolver.resolve_entries(&mut entries, &mut warnings);
    if !config.disable_ingress && !entries.is_empty() {
        services.insert("caddy".to_string(), caddy_service(&entries));
        named_volumes.insert("caddy-data".to_string(), ComposeVolume::local());
        parents.insert("caddy".to_string(), "caddy".to_string());
    }

    // phase 6: alias injection
    for (service_name, alias) in &aliases {
        if let Some(service) = services.get_mut(&alias.workload) {
            service.add_default_alias(service_name);
            service.add_default_alias(&format!(
                "{}.{}.svc.cluster.local",
                service_name, alias.namespace
            ));
            service.add_default_alias(&format!("{}.{}.svc", service_name, alias.namespace));
            service.add_default_alias(&format!("{}.{}", service_name, alias.namespace));
        }
    }

    // phase 7: transforms
    let mut service_values: IndexMap<String, Value> = IndexMap::new();
    for (name, service) in &services {
        service_values.insert(name.clone(), service_to_value(service)?);
    }
    let snapshot = context_snapshot(&index, &config, &aliases, &service_ports);
    for transform in &registry.transforms {
        match registry.call_transform(transform, &service_values, &entries, &snapshot) {
            Ok(None) => {}
            Ok(Some(outcome)) => {
                warnings.extend(outcome.warnings);
                if let Some(replacement) = outcome.services {
                    service_values = reorder_services(&service_values, replacement);
                }
                if let Some(replacement) = outcome.ingress {
                    entries = replacement;
                }
            }
            Err(err) => warnings.push(format!(
                "extension {}: transform failed: {:#}",
                transform.extension, err
            )),
        }
    }

    // phase 8: post-process across env values, command arrays, Caddyfile
    // upstreams and materialised file contents
    let remapper = build_remapper(&aliases, &service_ports);
    for value in service_values.values_mut() {
        post_process_service(value, &remapper, &config, &index, &mut warnings);
    }
    for entry in &mut entries {
        for route in &mut entry.routes {
            route.upstream =
                post_process_str(&route.upstream, &remapper, &config, &index, &mut warnings);
        }
    }
    for file in &mut files {
        file.content =
            post_process_str(&file.content, &remapper, &config, &index, &mut warnings);
    }

    // phase 9: overrides, custom services, exclusions
    for (name, overlay) in &config.overrides {
        let Some(name) = name.as_str() else { continue };
        if let Some(base) = service_values.get_mut(name) {
            deep_merge(base, overlay);
        }
    }
    // overrides may introduce fresh placeholders; the pass is idempotent,
    // so running it again only touches those
    for value in service_values.values_mut() {
        post_process_service(value, &remapper, &config, &index, &mut warnings);
    }
    for (name, spec) in &config.services {
        if let Some(name) = name.as_str() {
            service_values.insert(name.to_string(), spec.clone());
        }
    }
    apply_exclusions(
        &config,
        &parents,
        &mut service_values,
        &mut entries,
        &mut warnings,
    );

    // phase 10: assemble
    let mut networks: IndexMap<String, ComposeNetwork> = IndexMap::new();
    if let Some(network) = &config.network {
        networks.insert(
            "default".to_string(),
            ComposeNetwork {
                name: Some(network.clone()),
                external: true,
            },
        );
    }
    let caddyfile = if entries.is_empty() {
        None
    } else {
        Some(CaddyfileRenderer::new().render(&entries, &config.extensions.caddy)?)
    };
    let caddyfile_name = if config.disable_ingress {
        format!("Caddyfile-{}", config.name)
    } else {
        "Caddyfile".to_string()
    };

    Ok(ConversionOutput {
        compose: ComposeFile {
            services: service_values,
            volumes: named_volumes,
            networks,
        },
        caddyfile,
        caddyfile_name,
        files,
        warnings,
        config,
    })
}

fn run_converters(
    index: &mut ManifestIndex,
    registry: &ExtensionRegistry,
    config: &ProjectConfig,
    extension_services: &mut IndexMap<String, Value>,
    extension_ingress: &mut Vec<IngressEntry>,
    warnings: &mut Vec<String>,
) {
    let empty_aliases = BTreeMap::new();
    let empty_ports = BTreeMap::new();
    let mut processed: HashSet<(String, String, usize)> = HashSet::new();

    let pending_of = |index: &ManifestIndex, processed: &HashSet<(String, String, usize)>| {
        let mut pending: Vec<(String, String)> = Vec::new();
        for manifest in index.iter() {
            let unvisited = registry.converters.iter().enumerate().any(|(i, c)| {
                c.kinds.contains(&manifest.kind)
                    && !processed.contains(&(manifest.kind.clone(), manifest.name.clone(), i))
            });
            if unvisited {
                pending.push((manifest.kind.clone(), manifest.name.clone()));
            }
        }
        pending
    };

    for _ in 0..MAX_CONVERTER_CYCLES {
        let pending = pending_of(index, &processed);
        if pending.is_empty() {
            return;
        }
        let snapshot = context_snapshot(index, config, &empty_aliases, &empty_ports);
        let mut synthetic: Vec<Manifest> = Vec::new();
        for (kind, name) in pending {
            let Some(manifest_value) = index
                .get(&kind, &name)
                .map(|m| Value::Mapping(m.body.clone()))
            else {
                continue;
            };
            for (i, converter) in registry.converters.iter().enumerate() {
                if !converter.kinds.contains(&kind) {
                    continue;
                }
                if !processed.insert((kind.clone(), name.clone(), i)) {
                    continue;
                }
                match registry.call_converter(converter, &manifest_value, &snapshot) {
                    Ok(None) => {}
                    Ok(Some(outcome)) => {
                        warnings.extend(outcome.warnings);
                        for document in outcome.manifests {
                            match Manifest::from_document(document) {
                                Some(synthesised) => synthetic.push(synthesised),
                                None => warnings.push(format!(
                                    "extension {} produced a manifest without kind or name",
                                    converter.extension
                                )),
                            }
                        }
                        if let Some(provided) = outcome.services {
                            for (service_name, spec) in provided {
                                extension_services.insert(service_name, spec);
                            }
                        }
                        extension_ingress.extend(outcome.ingress);
                    }
                    Err(err) => warnings.push(format!(
                        "extension {}: converter failed on {} {}: {:#}",
                        converter.extension, kind, name, err
                    )),
                }
            }
        }
        for manifest in synthetic {
            index.insert(manifest);
        }
    }
    if !pending_of(index, &processed).is_empty() {
        warnings.push(format!(
            "converter fan-out did not settle within {} cycles, proceeding with current state",
            MAX_CONVERTER_CYCLES
        ));
    }
}

fn build_service_maps(
    index: &ManifestIndex,
) -> (
    BTreeMap<String, ServiceAlias>,
    BTreeMap<(String, String), u16>,
    BTreeMap<String, Vec<(u16, u16)>>,
) {
    let mut aliases = BTreeMap::new();
    let mut service_ports = BTreeMap::new();
    let mut published: BTreeMap<String, Vec<(u16, u16)>> = BTreeMap::new();

    for service in index.of_kind("Service") {
        let service_type = service.str_field(&["spec", "type"]).unwrap_or("ClusterIP");
        if service_type == "ExternalName" {
            continue;
        }
        let Some(selector) = service.map_field(&["spec", "selector"]) else {
            continue;
        };
        if selector.is_empty() {
            continue;
        }
        let mut matched: Vec<&Manifest> = index
            .workloads()
            .into_iter()
            .filter(|workload| {
                workload
                    .pod_labels()
                    .map(|labels| selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
                    .unwrap_or(false)
            })
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        let Some(workload) = matched.first() else {
            continue;
        };
        aliases.insert(
            service.name.clone(),
            ServiceAlias {
                namespace: service.namespace.clone(),
                workload: workload.name.clone(),
            },
        );

        for port in service.seq_field(&["spec", "ports"]) {
            let Some(port_number) = value_as_port(lookup(port, &["port"])) else {
                continue;
            };
            let container_port = match lookup(port, &["targetPort"]) {
                Some(Value::Number(_)) => {
                    value_as_port(lookup(port, &["targetPort"])).unwrap_or(port_number)
                }
                Some(Value::String(target_name)) => {
                    named_container_port(workload, target_name).unwrap_or(port_number)
                }
                _ => port_number,
            };
            service_ports.insert(
                (service.name.clone(), port_number.to_string()),
                container_port,
            );
            if let Some(port_name) = lookup_str(port, &["name"]) {
                service_ports.insert(
                    (service.name.clone(), port_name.to_string()),
                    container_port,
                );
            }
            if service_type == "NodePort" || service_type == "LoadBalancer" {
                published
                    .entry(workload.name.clone())
                    .or_default()
                    .push((port_number, container_port));
            }
        }
    }

    (aliases, service_ports, published)
}

fn named_container_port(workload: &Manifest, port_name: &str) -> Option<u16> {
    for container in workload.seq_field(&["spec", "template", "spec", "containers"]) {
        for port in lookup(container, &["ports"])
            .and_then(|v| v.as_sequence())
            .into_iter()
            .flatten()
        {
            if lookup_str(port, &["name"]) == Some(port_name) {
                return value_as_port(lookup(port, &["containerPort"]));
            }
        }
    }
    None
}

fn value_as_port(value: Option<&Value>) -> Option<u16> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn build_ingress_entries(
    index: &ManifestIndex,
    registry: &ExtensionRegistry,
    config: &ProjectConfig,
    snapshot: &ContextSnapshot,
    warnings: &mut Vec<String>,
) -> Vec<IngressEntry> {
    let mut entries = Vec::new();
    for manifest in index.of_kind("Ingress") {
        let canonical = resolve_class(manifest, &config.ingress_types);
        let candidates = registry.rewriters_named(&canonical);
        if candidates.is_empty() {
            warnings.push(format!(
                "ingress {}: no rewriter registered for class {}",
                manifest.name,
                if canonical.is_empty() { "<none>" } else { &canonical }
            ));
            continue;
        }
        let manifest_value = Value::Mapping(manifest.body.clone());
        let mut handled = false;
        for rewriter in candidates {
            match registry.call_rewriter_match(rewriter, &manifest_value) {
                Ok(false) => continue,
                Ok(true) => match registry.call_rewriter(rewriter, &manifest_value, snapshot) {
                    Ok(mut rewritten) => {
                        entries.append(&mut rewritten);
                        handled = true;
                    }
                    Err(err) => warnings.push(format!(
                        "extension {}: rewriter {} failed on ingress {}: {:#}",
                        rewriter.extension, rewriter.name, manifest.name, err
                    )),
                },
                Err(err) => warnings.push(format!(
                    "extension {}: rewriter {} match failed on ingress {}: {:#}",
                    rewriter.extension, rewriter.name, manifest.name, err
                )),
            }
            if handled {
                break;
            }
        }
        if !handled {
            warnings.push(format!("ingress {} matched no rewriter", manifest.name));
        }
    }
    entries
}

/// Keep the pre-transform ordering for services that survive a transform
/// and append new ones in name order, so Lua table iteration cannot make
/// the output nondeterministic.
fn reorder_services(
    before: &IndexMap<String, Value>,
    after: IndexMap<String, Value>,
) -> IndexMap<String, Value> {
    let mut out = IndexMap::new();
    for name in before.keys() {
        if let Some(value) = after.get(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    let mut added: Vec<&String> = after.keys().filter(|k| !before.contains_key(*k)).collect();
    added.sort();
    for name in added {
        if let Some(value) = after.get(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

fn build_remapper(
    aliases: &BTreeMap<String, ServiceAlias>,
    service_ports: &BTreeMap<(String, String), u16>,
) -> PortRemapper {
    let mut remapper = PortRemapper::new();
    for ((service, label), target) in service_ports {
        if let Ok(port) = label.parse::<u16>() {
            let namespace = aliases
                .get(service)
                .map(|a| a.namespace.as_str())
                .unwrap_or("default");
            remapper.add_service(service, namespace, port, *target);
        }
    }
    remapper
}

fn post_process_str(
    input: &str,
    remapper: &PortRemapper,
    config: &ProjectConfig,
    index: &ManifestIndex,
    warnings: &mut Vec<String>,
) -> String {
    let step = remapper.apply(input);
    let step = apply_replacements(&step, &config.replacements);
    resolve_placeholders(
        &step,
        |name, key| secret_value(index, name, key),
        &config.volume_root,
        warnings,
    )
}

fn post_process_service(
    value: &mut Value,
    remapper: &PortRemapper,
    config: &ProjectConfig,
    index: &ManifestIndex,
    warnings: &mut Vec<String>,
) {
    let Some(mapping) = value.as_mapping_mut() else {
        return;
    };
    if let Some(environment) = mapping
        .get_mut("environment")
        .and_then(|v| v.as_mapping_mut())
    {
        for (_, entry) in environment.iter_mut() {
            if let Value::String(text) = entry {
                *text = post_process_str(text, remapper, config, index, warnings);
            }
        }
    }
    for key in ["entrypoint", "command"] {
        if let Some(items) = mapping.get_mut(key).and_then(|v| v.as_sequence_mut()) {
            for item in items {
                if let Value::String(text) = item {
                    *text = post_process_str(text, remapper, config, index, warnings);
                }
            }
        }
    }
}

fn apply_exclusions(
    config: &ProjectConfig,
    parents: &IndexMap<String, String>,
    service_values: &mut IndexMap<String, Value>,
    entries: &mut Vec<IngressEntry>,
    warnings: &mut Vec<String>,
) {
    if config.exclude.is_empty() {
        return;
    }
    let mut patterns = Vec::new();
    for raw in &config.exclude {
        match glob::Pattern::new(raw) {
            Ok(pattern) => patterns.push(pattern),
            Err(err) => warnings.push(format!("invalid exclude pattern {}: {}", raw, err)),
        }
    }
    let matches = |name: &str| patterns.iter().any(|p| p.matches(name));
    let excluded: HashSet<String> = service_values
        .keys()
        .filter(|name| {
            matches(name)
                || parents
                    .get(name.as_str())
                    .is_some_and(|parent| matches(parent))
        })
        .cloned()
        .collect();
    if excluded.is_empty() {
        return;
    }
    service_values.retain(|name, _| !excluded.contains(name));
    for entry in entries.iter_mut() {
        let host = entry.host.clone();
        entry.routes.retain(|route| {
            let upstream_host = route.upstream.split(':').next().unwrap_or("");
            if excluded.contains(upstream_host) {
                warnings.push(format!(
                    "dropped route {}{} pointing at excluded service {}",
                    host, route.path, upstream_host
                ));
                false
            } else {
                true
            }
        });
    }
    entries.retain(|entry| !entry.routes.is_empty());
}

fn context_snapshot(
    index: &ManifestIndex,
    config: &ProjectConfig,
    aliases: &BTreeMap<String, ServiceAlias>,
    service_ports: &BTreeMap<(String, String), u16>,
) -> ContextSnapshot {
    let mut manifests: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for manifest in index.iter() {
        manifests
            .entry(manifest.kind.clone())
            .or_default()
            .insert(manifest.name.clone(), Value::Mapping(manifest.body.clone()));
    }
    ContextSnapshot {
        aliases: aliases
            .iter()
            .map(|(name, alias)| (name.clone(), alias.workload.clone()))
            .collect(),
        service_ports: service_ports
            .iter()
            .map(|((service, port), target)| (format!("{}/{}", service, port), *target))
            .collect(),
        volume_root: config.volume_root.clone(),
        ingress_types: config.ingress_types.clone(),
        project: serde_yaml::to_value(config).unwrap_or(Value::Null),
        manifests,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(yaml: &[&str]) -> Vec<Value> {
        yaml.iter()
            .map(|y| serde_yaml::from_str(y).unwrap())
            .collect()
    }

    #[test]
    fn test_minimal_deployment_with_clusterip_service() {
        let documents = docs(&[
            r#"
kind: Deployment
metadata: {name: web}
spec:
  template:
    metadata:
      labels: {app: web}
    spec:
      containers:
        - name: web
          image: nginx:1.25
          env: [{name: FOO, value: bar}]
"#,
            r#"
kind: Service
metadata: {name: web}
spec:
  type: ClusterIP
  selector: {app: web}
  ports: [{port: 80}]
"#,
        ]);
        let registry = ExtensionRegistry::new();
        let output = convert(
            documents,
            ProjectConfig::new("test"),
            &registry,
            Vec::new(),
        )
        .unwrap();
        let web = &output.compose.services["web"];
        assert_eq!(
            web.get("image").and_then(|v| v.as_str()),
            Some("nginx:1.25")
        );
        assert_eq!(
            lookup_str(web, &["environment", "FOO"]),
            Some("bar")
        );
        // ClusterIP never publishes host ports
        assert!(web.get("ports").is_none());
        let aliases: Vec<&str> = lookup(web, &["networks", "default", "aliases"])
            .and_then(|v| v.as_sequence())
            .map(|seq| seq.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        assert!(aliases.contains(&"web.default.svc.cluster.local"));
    }

    #[test]
    fn test_nodeport_publishes() {
        let documents = docs(&[
            r#"
kind: Deployment
metadata: {name: web}
spec:
  template:
    metadata:
      labels: {app: web}
    spec:
      containers:
        - {name: web, image: "nginx:1.25"}
"#,
            r#"
kind: Service
metadata: {name: web}
spec:
  type: NodePort
  selector: {app: web}
  ports: [{port: 80, targetPort: 8080}]
"#,
        ]);
        let registry = ExtensionRegistry::new();
        let output = convert(
            documents,
            ProjectConfig::new("test"),
            &registry,
            Vec::new(),
        )
        .unwrap();
        let web = &output.compose.services["web"];
        let ports: Vec<&str> = lookup(web, &["ports"])
            .and_then(|v| v.as_sequence())
            .map(|seq| seq.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ports, vec!["80:8080"]);
    }

    #[test]
    fn test_override_with_placeholder_and_null_delete() {
        let documents = docs(&[
            r#"
kind: Deployment
metadata: {name: redis}
spec:
  template:
    metadata:
      labels: {app: redis}
    spec:
      containers:
        - name: redis
          image: redis:7
          env: [{name: DROP_ME, value: x}]
"#,
            // aHVudGVyMg== is "hunter2"
            "kind: Secret\nmetadata: {name: redis}\ndata: {pw: aHVudGVyMg==}",
        ]);
        let mut config = ProjectConfig::new("test");
        let overrides: Value = serde_yaml::from_str(
            r#"
redis:
  command: [redis-server, --requirepass, "$secret:redis:pw"]
  environment:
"#,
        )
        .unwrap();
        config.overrides = overrides.as_mapping().unwrap().clone();
        let registry = ExtensionRegistry::new();
        let output = convert(documents, config, &registry, Vec::new()).unwrap();
        let redis = &output.compose.services["redis"];
        let command: Vec<&str> = lookup(redis, &["command"])
            .and_then(|v| v.as_sequence())
            .map(|seq| seq.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        assert_eq!(command, vec!["redis-server", "--requirepass", "hunter2"]);
        assert!(redis.get("environment").is_none());
    }

    #[test]
    fn test_exclude_takes_family_down() {
        let workload = |name: &str| {
            format!(
                "kind: Deployment\nmetadata: {{name: {}}}\nspec:\n  template:\n    spec:\n      containers:\n        - {{name: c, image: \"x:1\"}}\n",
                name
            )
        };
        let documents = docs(&[
            &workload("meet-celery-worker"),
            &workload("meet-celery-beat"),
            &workload("meet-api"),
        ]);
        let mut config = ProjectConfig::new("test");
        config.exclude.push("meet-celery-*".to_string());
        let registry = ExtensionRegistry::new();
        let output = convert(documents, config, &registry, Vec::new()).unwrap();
        assert!(output.compose.services.contains_key("meet-api"));
        assert!(!output.compose.services.contains_key("meet-celery-worker"));
        assert!(!output.compose.services.contains_key("meet-celery-beat"));
    }

    #[test]
    fn test_converter_synthetic_manifests_are_reevaluated() {
        let mut registry = ExtensionRegistry::new();
        let mut load_warnings = Vec::new();
        registry.register_source(
            "crd",
            r#"
return {
    kinds = {"AppBundle"},
    convert = function(manifest, ctx)
        return {
            manifests = {
                {
                    kind = "Deployment",
                    metadata = { name = manifest.metadata.name },
                    spec = {
                        template = {
                            spec = {
                                containers = {
                                    { name = "main", image = manifest.spec.image },
                                },
                            },
                        },
                    },
                },
            },
        }
    end,
}
"#,
            &mut load_warnings,
        );
        assert!(load_warnings.is_empty());
        let documents = docs(&[
            "kind: AppBundle\nmetadata: {name: bundled}\nspec: {image: \"bundle:1\"}",
        ]);
        let output = convert(
            documents,
            ProjectConfig::new("test"),
            &registry,
            Vec::new(),
        )
        .unwrap();
        let bundled = &output.compose.services["bundled"];
        assert_eq!(
            bundled.get("image").and_then(|v| v.as_str()),
            Some("bundle:1")
        );
    }

    #[test]
    fn test_empty_input_yields_empty_services() {
        let registry = ExtensionRegistry::new();
        let output = convert(
            Vec::new(),
            ProjectConfig::new("test"),
            &registry,
            Vec::new(),
        )
        .unwrap();
        assert!(output.compose.services.is_empty());
        assert!(output.caddyfile.is_none());
    }
}
