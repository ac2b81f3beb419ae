use composify::config::{ProjectConfig, Replacement};
use composify::extensions::ExtensionRegistry;
use composify::pipeline;
use composify::service::truncate_hostname;
use serde_yaml::Value;

fn docs(yaml: &[&str]) -> Vec<Value> {
    yaml.iter()
        .map(|y| serde_yaml::from_str(y).unwrap())
        .collect()
}

fn deployment(name: &str, label: &str, image: &str) -> String {
    format!(
        r#"
kind: Deployment
metadata:
  name: {name}
spec:
  template:
    metadata:
      labels: {{app: {label}}}
    spec:
      containers:
        - name: main
          image: "{image}"
"#
    )
}

#[test]
fn test_port_remap_in_env_values() {
    let documents = docs(&[
        &deployment("api", "api", "api:1"),
        r#"
kind: Service
metadata:
  name: api
spec:
  selector: {app: api}
  ports: [{port: 80, targetPort: 8080}]
"#,
        r#"
kind: Deployment
metadata:
  name: client
spec:
  template:
    spec:
      containers:
        - name: main
          image: "client:1"
          env:
            - {name: API_URL, value: "http://api:80/v1"}
            - {name: API_FQDN, value: "api.default.svc.cluster.local:80"}
"#,
    ]);
    let registry = ExtensionRegistry::new();
    let output = pipeline::convert(
        documents,
        ProjectConfig::new("test"),
        &registry,
        Vec::new(),
    )
    .unwrap();
    let client = &output.compose.services["client"];
    assert_eq!(
        client["environment"]["API_URL"].as_str(),
        Some("http://api:8080/v1")
    );
    assert_eq!(
        client["environment"]["API_FQDN"].as_str(),
        Some("api.default.svc.cluster.local:8080")
    );
}

#[test]
fn test_named_target_port_resolves_through_container() {
    let documents = docs(&[
        r#"
kind: Deployment
metadata:
  name: web
spec:
  template:
    metadata:
      labels: {app: web}
    spec:
      containers:
        - name: web
          image: "web:1"
          ports:
            - {name: http, containerPort: 3000}
"#,
        r#"
kind: Service
metadata:
  name: web
spec:
  type: LoadBalancer
  selector: {app: web}
  ports: [{port: 80, targetPort: http}]
"#,
    ]);
    let registry = ExtensionRegistry::new();
    let output = pipeline::convert(
        documents,
        ProjectConfig::new("test"),
        &registry,
        Vec::new(),
    )
    .unwrap();
    let ports: Vec<&str> = output.compose.services["web"]["ports"]
        .as_sequence()
        .map(|seq| seq.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    assert_eq!(ports, vec!["80:3000"]);
}

#[test]
fn test_multiple_services_alias_one_workload() {
    let documents = docs(&[
        &deployment("backend", "backend", "backend:1"),
        r#"
kind: Service
metadata: {name: backend}
spec:
  selector: {app: backend}
  ports: [{port: 8000}]
"#,
        r#"
kind: Service
metadata: {name: backend-public, namespace: edge}
spec:
  selector: {app: backend}
  ports: [{port: 8000}]
"#,
    ]);
    let registry = ExtensionRegistry::new();
    let output = pipeline::convert(
        documents,
        ProjectConfig::new("test"),
        &registry,
        Vec::new(),
    )
    .unwrap();
    let aliases: Vec<&str> = output.compose.services["backend"]["networks"]["default"]["aliases"]
        .as_sequence()
        .map(|seq| seq.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    // both Services alias the same workload
    assert!(aliases.contains(&"backend.default.svc.cluster.local"));
    assert!(aliases.contains(&"backend-public.edge.svc.cluster.local"));
    assert!(aliases.contains(&"backend-public.edge"));
}

#[test]
fn test_selector_tie_break_is_lexicographic() {
    let documents = docs(&[
        &deployment("zeta", "shared", "a:1"),
        &deployment("alpha", "shared", "a:1"),
        r#"
kind: Service
metadata: {name: shared}
spec:
  selector: {app: shared}
  ports: [{port: 80}]
"#,
    ]);
    let registry = ExtensionRegistry::new();
    let output = pipeline::convert(
        documents,
        ProjectConfig::new("test"),
        &registry,
        Vec::new(),
    )
    .unwrap();
    let alpha = &output.compose.services["alpha"];
    let zeta = &output.compose.services["zeta"];
    assert!(alpha.get("networks").is_some());
    assert!(zeta.get("networks").is_none());
}

#[test]
fn test_custom_services_and_external_network() {
    let documents = docs(&[&deployment("app", "app", "app:1")]);
    let mut config = ProjectConfig::new("test");
    config.network = Some("shared-edge".to_string());
    let extra: Value = serde_yaml::from_str("adminer:\n  image: adminer:4\n").unwrap();
    config.services = extra.as_mapping().unwrap().clone();
    let registry = ExtensionRegistry::new();
    let output = pipeline::convert(documents, config, &registry, Vec::new()).unwrap();
    assert!(output.compose.services.contains_key("adminer"));
    let networks = &output.compose.networks["default"];
    assert_eq!(networks.name.as_deref(), Some("shared-edge"));
    assert!(networks.external);
}

#[test]
fn test_user_replacements_apply_to_env() {
    let documents = docs(&[r#"
kind: Deployment
metadata: {name: app}
spec:
  template:
    spec:
      containers:
        - name: main
          image: "app:1"
          env:
            - {name: BUCKET, value: "s3.internal.example.com/assets"}
"#]);
    let mut config = ProjectConfig::new("test");
    config.replacements.push(Replacement {
        old: "s3.internal.example.com".to_string(),
        new: "minio".to_string(),
    });
    let registry = ExtensionRegistry::new();
    let output = pipeline::convert(documents, config, &registry, Vec::new()).unwrap();
    assert_eq!(
        output.compose.services["app"]["environment"]["BUCKET"].as_str(),
        Some("minio/assets")
    );
}

#[test]
fn test_hostname_truncation_invariants() {
    for length in [64usize, 70, 100] {
        let name = "x".repeat(length);
        let hostname = truncate_hostname(&name);
        assert!(hostname.len() <= 63);
        assert!(hostname.ends_with(|c: char| c.is_ascii_alphanumeric()));
    }
    // trailing separators are trimmed past the cut
    let awkward = format!("{}---{}", "a".repeat(60), "b".repeat(20));
    assert_eq!(truncate_hostname(&awkward), "a".repeat(60));
}

#[test]
fn test_unknown_override_keys_survive_merge() {
    let documents = docs(&[&deployment("app", "app", "app:1")]);
    let mut config = ProjectConfig::new("test");
    let overrides: Value = serde_yaml::from_str(
        "app:\n  deploy:\n    resources:\n      limits: {memory: 512M}\n",
    )
    .unwrap();
    config.overrides = overrides.as_mapping().unwrap().clone();
    let registry = ExtensionRegistry::new();
    let output = pipeline::convert(documents, config, &registry, Vec::new()).unwrap();
    let app = &output.compose.services["app"];
    assert_eq!(
        app["deploy"]["resources"]["limits"]["memory"].as_str(),
        Some("512M")
    );
}

#[test]
fn test_provider_services_are_post_processed() {
    let mut registry = ExtensionRegistry::new();
    let mut warnings = Vec::new();
    registry.register_source(
        "grafana",
        r#"
return {
    kinds = {"GrafanaStack"},
    convert = function(manifest, ctx)
        return {
            services = {
                grafana = {
                    image = "grafana/grafana:10",
                    environment = { ADMIN_PASSWORD = "$secret:grafana:admin" },
                },
            },
        }
    end,
}
"#,
        &mut warnings,
    );
    assert!(warnings.is_empty());
    let documents = docs(&[
        "kind: GrafanaStack\nmetadata: {name: monitoring}",
        // YWRtaW4tcHc= is "admin-pw"
        "kind: Secret\nmetadata: {name: grafana}\ndata: {admin: YWRtaW4tcHc=}",
    ]);
    let output = pipeline::convert(
        documents,
        ProjectConfig::new("test"),
        &registry,
        Vec::new(),
    )
    .unwrap();
    assert_eq!(
        output.compose.services["grafana"]["environment"]["ADMIN_PASSWORD"].as_str(),
        Some("admin-pw")
    );
}
