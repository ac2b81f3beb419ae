use crate::compose::ComposeService;
use crate::config::CaddySettings;
use crate::index::{Manifest, ManifestIndex};
use crate::pipeline::ServiceAlias;
use anyhow::{Context, Result};
use handlebars::Handlebars;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};

/// Longest alias chain we are willing to follow through ExternalName
/// Services before declaring a cycle.
const MAX_ALIAS_HOPS: usize = 8;

/// One Caddy site: a host and its routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressEntry {
    pub host: String,
    #[serde(default)]
    pub routes: Vec<IngressRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRoute {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<IngressBackend>,
    /// Resolved `host:port` upstream. Rewriters normally leave this empty
    /// and let backend resolution fill it in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub https: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressBackend {
    pub service: String,
    pub port: Value,
}

fn default_path() -> String {
    "/".to_string()
}

/// Map an ingress class to its canonical rewriter name through the
/// project's `ingress_types` mapping: exact match first, then substring.
pub fn resolve_class(manifest: &Manifest, ingress_types: &IndexMap<String, String>) -> String {
    let class = manifest
        .str_field(&["spec", "ingressClassName"])
        .or_else(|| manifest.str_field(&["metadata", "annotations", "kubernetes.io/ingress.class"]))
        .unwrap_or("");
    if let Some(canonical) = ingress_types.get(class) {
        return canonical.clone();
    }
    for (pattern, canonical) in ingress_types {
        if !pattern.is_empty() && class.contains(pattern.as_str()) {
            return canonical.clone();
        }
    }
    class.to_string()
}

/// Resolves route backends to compose upstreams through the Service index.
pub struct BackendResolver<'a> {
    pub index: &'a ManifestIndex,
    pub aliases: &'a BTreeMap<String, ServiceAlias>,
    pub service_ports: &'a BTreeMap<(String, String), u16>,
}

impl BackendResolver<'_> {
    /// Fill in `upstream` for every route that still carries a backend.
    /// Routes whose backend cannot be resolved are dropped with a warning.
    pub fn resolve_entries(&self, entries: &mut Vec<IngressEntry>, warnings: &mut Vec<String>) {
        for entry in entries.iter_mut() {
            let host = entry.host.clone();
            entry.routes.retain_mut(|route| {
                if !route.upstream.is_empty() {
                    return true;
                }
                let Some(backend) = route.backend.clone() else {
                    warnings.push(format!(
                        "ingress host {}: route {} has no backend",
                        host, route.path
                    ));
                    return false;
                };
                match self.resolve_backend(&backend, &host, warnings) {
                    Some(upstream) => {
                        route.upstream = upstream;
                        route.backend = None;
                        true
                    }
                    None => false,
                }
            });
        }
        entries.retain(|entry| !entry.routes.is_empty());
    }

    fn resolve_backend(
        &self,
        backend: &IngressBackend,
        host: &str,
        warnings: &mut Vec<String>,
    ) -> Option<String> {
        let port_label = port_label(&backend.port);
        let mut current = backend.service.clone();
        let mut visited: HashSet<String> = HashSet::new();

        for _ in 0..MAX_ALIAS_HOPS {
            if !visited.insert(current.clone()) {
                warnings.push(format!(
                    "ingress host {}: alias cycle at Service {}",
                    host, current
                ));
                return self.upstream_for(&current, &backend.service, &port_label, host, warnings);
            }
            let Some(service) = self.index.get("Service", &current) else {
                warnings.push(format!(
                    "ingress host {}: backend references missing Service {}",
                    host, current
                ));
                return None;
            };
            let service_type = service
                .str_field(&["spec", "type"])
                .unwrap_or("ClusterIP");
            if service_type != "ExternalName" {
                return self.upstream_for(&current, &backend.service, &port_label, host, warnings);
            }
            let Some(target) = service.str_field(&["spec", "externalName"]) else {
                warnings.push(format!(
                    "ingress host {}: ExternalName Service {} has no target",
                    host, current
                ));
                return None;
            };
            let first_label = target.split('.').next().unwrap_or(target);
            if self.index.get("Service", first_label).is_some() {
                current = first_label.to_string();
                continue;
            }
            // the chain leaves the known set: keep the external host
            return Some(format!("{}:{}", target, port_label));
        }
        warnings.push(format!(
            "ingress host {}: alias chain through {} exceeds {} hops",
            host, backend.service, MAX_ALIAS_HOPS
        ));
        self.upstream_for(&current, &backend.service, &port_label, host, warnings)
    }

    fn upstream_for(
        &self,
        service: &str,
        entry_service: &str,
        port_label: &str,
        host: &str,
        warnings: &mut Vec<String>,
    ) -> Option<String> {
        let target = match self.aliases.get(service) {
            Some(alias) => alias.workload.clone(),
            None => {
                warnings.push(format!(
                    "ingress host {}: Service {} selects no workload",
                    host, service
                ));
                service.to_string()
            }
        };
        // remap the Service port to the container port where phase 3
        // resolved one
        let port = match self
            .service_ports
            .get(&(service.to_string(), port_label.to_string()))
        {
            Some(container_port) => container_port.to_string(),
            None => match port_label.parse::<u16>() {
                Ok(number) => number.to_string(),
                Err(_) => {
                    warnings.push(format!(
                        "ingress host {}: port {} of Service {} cannot be resolved",
                        host, port_label, entry_service
                    ));
                    return None;
                }
            },
        };
        Some(format!("{}:{}", target, port))
    }
}

fn port_label(port: &Value) -> String {
    match port {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

/// The synthesised ingress service running Caddy. Every ingress host
/// becomes a network alias so in-cluster absolute URLs keep working.
pub fn caddy_service(entries: &[IngressEntry]) -> ComposeService {
    let mut service = ComposeService {
        image: Some("caddy:2-alpine".to_string()),
        ports: vec!["80:80".to_string(), "443:443".to_string()],
        volumes: vec![
            "./Caddyfile:/etc/caddy/Caddyfile:ro".to_string(),
            "caddy-data:/data".to_string(),
        ],
        restart: Some("unless-stopped".to_string()),
        ..ComposeService::default()
    };
    for entry in entries {
        service.add_default_alias(&entry.host);
    }
    service
}

const CADDYFILE_TEMPLATE: &str = "{{#if email}}{\n\temail {{email}}\n}\n\n{{/if}}{{#each sites}}{{host}} {\n{{#if tls}}\ttls {{tls}}\n{{/if}}{{#each routes}}{{this}}\n{{/each}}}\n\n{{/each}}";

pub struct CaddyfileRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for CaddyfileRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl CaddyfileRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("caddyfile", CADDYFILE_TEMPLATE)
            .expect("static template compiles");
        Self { handlebars }
    }

    pub fn render(&self, entries: &[IngressEntry], caddy: &CaddySettings) -> Result<String> {
        let mut sites: IndexMap<String, (Option<String>, Vec<IngressRoute>)> = IndexMap::new();
        for entry in entries {
            let site = sites.entry(entry.host.clone()).or_default();
            if site.0.is_none() {
                site.0 = entry.tls.clone();
            }
            site.1.extend(entry.routes.iter().cloned());
        }

        let default_tls = caddy.tls_internal.then(|| "internal".to_string());
        let site_data: Vec<serde_json::Value> = sites
            .into_iter()
            .map(|(host, (tls, mut routes))| {
                // specific prefixes first, the catch-all last
                routes.sort_by_key(|route| {
                    (route.path == "/" || route.path.is_empty(), usize::MAX - route.path.len())
                });
                json!({
                    "host": host,
                    "tls": tls.or_else(|| default_tls.clone()),
                    "routes": routes.iter().map(render_route).collect::<Vec<String>>(),
                })
            })
            .collect();

        let data = json!({
            "email": caddy.email,
            "sites": site_data,
        });
        let rendered = self
            .handlebars
            .render("caddyfile", &data)
            .context("Failed to render Caddyfile template")?;
        Ok(format!("{}\n", rendered.trim_end()))
    }
}

fn render_route(route: &IngressRoute) -> String {
    let matcher = match route.path.as_str() {
        "" | "/" => String::new(),
        path if path.ends_with('*') => format!("{} ", path),
        path => format!("{}* ", path),
    };
    let mut line = format!("\treverse_proxy {}{}", matcher, route.upstream);
    if route.https {
        line.push_str(" {\n\t\ttransport http {\n\t\t\ttls\n\t\t}\n\t}");
    }
    for directive in &route.directives {
        line.push_str("\n\t");
        line.push_str(directive);
    }
    line
}
