use anyhow::{anyhow, Context, Result};
use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use walkdir::WalkDir;

/// Kinds that are dropped without any notice. They have no Compose
/// counterpart and showing up in every Helm chart makes warning on them
/// pure noise.
const SILENT_KINDS: &[&str] = &[
    "Role",
    "RoleBinding",
    "ClusterRole",
    "ClusterRoleBinding",
    "ServiceAccount",
    "NetworkPolicy",
    "CustomResourceDefinition",
    "IngressClass",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PriorityClass",
];

/// Kinds we recognise but cannot convert. One warning per kind, not per
/// instance.
const UNSUPPORTED_KINDS: &[&str] = &["CronJob", "HorizontalPodAutoscaler", "PodDisruptionBudget"];

/// Kinds the conversion pipeline consumes directly.
const CORE_KINDS: &[&str] = &[
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "Service",
    "Ingress",
    "ConfigMap",
    "Secret",
    "PersistentVolumeClaim",
];

/// Workload kinds, i.e. everything that produces a main compose service.
pub const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "Job"];

/// A single parsed Kubernetes-shaped document. The full document body is
/// kept as an ordered mapping so unknown fields survive untouched.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub body: Mapping,
}

impl Manifest {
    /// Build a manifest from a raw document. Returns `None` when `kind` or
    /// `metadata.name` is missing, which the caller reports.
    pub fn from_document(doc: Value) -> Option<Self> {
        let kind = doc.get("kind")?.as_str()?.to_string();
        let name = lookup_str(&doc, &["metadata", "name"])?.to_string();
        let namespace = lookup_str(&doc, &["metadata", "namespace"])
            .unwrap_or("default")
            .to_string();
        let body = match doc {
            Value::Mapping(mapping) => mapping,
            _ => return None,
        };
        Some(Self {
            kind,
            name,
            namespace,
            body,
        })
    }

    /// Null-safe nested field access on the document body.
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        let mut current: &Value = self.body.get(path.first()?)?;
        for key in &path[1..] {
            current = current.get(key)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn str_field(&self, path: &[&str]) -> Option<&str> {
        self.field(path).and_then(|v| v.as_str())
    }

    /// Sequence field that yields nothing when the field is absent or null.
    pub fn seq_field<'a>(&'a self, path: &[&str]) -> impl Iterator<Item = &'a Value> {
        self.field(path)
            .and_then(|v| v.as_sequence())
            .into_iter()
            .flatten()
    }

    pub fn map_field(&self, path: &[&str]) -> Option<&Mapping> {
        self.field(path).and_then(|v| v.as_mapping())
    }

    /// Labels of the pod template for workloads, falling back to the
    /// manifest's own labels.
    pub fn pod_labels(&self) -> Option<&Mapping> {
        self.map_field(&["spec", "template", "metadata", "labels"])
            .or_else(|| self.map_field(&["metadata", "labels"]))
    }

    /// The pod spec for workload kinds.
    pub fn pod_spec(&self) -> Option<&Value> {
        self.field(&["spec", "template", "spec"])
    }
}

/// Null-safe nested lookup on a raw value: absent keys and explicit nulls
/// both read as missing. Conditional templating routinely renders
/// `annotations:`, `ports:` and friends as nulls.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

pub fn lookup_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    lookup(value, path).and_then(|v| v.as_str())
}

pub fn lookup_seq<'a>(value: &'a Value, path: &[&str]) -> impl Iterator<Item = &'a Value> {
    lookup(value, path)
        .and_then(|v| v.as_sequence())
        .into_iter()
        .flatten()
}

/// Flat `(kind, name)` index over all retained manifests plus per-kind
/// lists in document order. Flat means the namespace is ignored: if two
/// manifests of the same kind share a name across namespaces the later one
/// wins. Immutable after ingestion except for synthetic manifests inserted
/// by converters.
#[derive(Debug, Default)]
pub struct ManifestIndex {
    manifests: Vec<Manifest>,
    by_key: HashMap<(String, String), usize>,
    by_kind: HashMap<String, Vec<usize>>,
    warned_kinds: HashSet<String>,
}

impl ManifestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a batch of raw documents. `claimed_kinds` is the set of kinds
    /// some extension converter has registered for; unknown kinds outside
    /// that set are dropped with a warning.
    pub fn ingest(
        &mut self,
        documents: Vec<Value>,
        claimed_kinds: &HashSet<String>,
        warnings: &mut Vec<String>,
    ) {
        for doc in documents {
            self.ingest_document(doc, claimed_kinds, warnings);
        }
    }

    fn ingest_document(
        &mut self,
        doc: Value,
        claimed_kinds: &HashSet<String>,
        warnings: &mut Vec<String>,
    ) {
        if doc.is_null() {
            return;
        }
        let kind = doc.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if kind.is_empty() || lookup_str(&doc, &["metadata", "name"]).is_none() {
            warnings.push("dropped a document without kind or metadata.name".to_string());
            return;
        }
        if SILENT_KINDS.contains(&kind) {
            return;
        }
        if UNSUPPORTED_KINDS.contains(&kind) {
            if self.warned_kinds.insert(kind.to_string()) {
                warnings.push(format!("kind {} is not supported and was skipped", kind));
            }
            return;
        }
        if !CORE_KINDS.contains(&kind) && !claimed_kinds.contains(kind) {
            if self.warned_kinds.insert(kind.to_string()) {
                warnings.push(format!("unknown kind {}, no extension claims it", kind));
            }
            return;
        }
        match Manifest::from_document(doc) {
            Some(manifest) => self.insert(manifest),
            None => warnings.push("dropped a malformed document".to_string()),
        }
    }

    /// Insert a manifest, replacing any existing one with the same
    /// `(kind, name)` key. Synthetic manifests from converters come through
    /// here as well.
    pub fn insert(&mut self, manifest: Manifest) {
        let key = (manifest.kind.clone(), manifest.name.clone());
        if let Some(&slot) = self.by_key.get(&key) {
            self.manifests[slot] = manifest;
            return;
        }
        let slot = self.manifests.len();
        self.by_kind
            .entry(manifest.kind.clone())
            .or_default()
            .push(slot);
        self.by_key.insert(key, slot);
        self.manifests.push(manifest);
    }

    pub fn get(&self, kind: &str, name: &str) -> Option<&Manifest> {
        self.by_key
            .get(&(kind.to_string(), name.to_string()))
            .map(|&slot| &self.manifests[slot])
    }

    /// All manifests of one kind, in document order.
    pub fn of_kind(&self, kind: &str) -> Vec<&Manifest> {
        self.by_kind
            .get(kind)
            .map(|slots| slots.iter().map(|&slot| &self.manifests[slot]).collect())
            .unwrap_or_default()
    }

    pub fn workloads(&self) -> Vec<&Manifest> {
        let mut result = Vec::new();
        for kind in WORKLOAD_KINDS {
            result.extend(self.of_kind(kind));
        }
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.manifests.iter()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

/// Read every `.yaml`/`.yml` file under `dir` recursively, in path order,
/// and parse the documents inside. An unreadable directory is fatal; a
/// malformed document only costs a warning.
pub async fn read_manifest_dir(dir: &Path, warnings: &mut Vec<String>) -> Result<Vec<Value>> {
    if !dir.is_dir() {
        return Err(anyhow!("input dir {} is not readable", dir.display()));
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let is_yaml = entry
            .path()
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if entry.file_type().is_file() && is_yaml {
            paths.push(entry.path().to_path_buf());
        }
    }
    let mut documents = Vec::new();
    for path in paths {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        documents.extend(parse_documents(
            &content,
            &path.display().to_string(),
            warnings,
        ));
    }
    Ok(documents)
}

/// Split a rendered file into YAML documents and parse each one. A document
/// that fails to parse is reported and skipped, the rest of the file is
/// still used.
pub fn parse_documents(content: &str, source: &str, warnings: &mut Vec<String>) -> Vec<Value> {
    let mut documents = Vec::new();
    for (position, chunk) in split_documents(content).into_iter().enumerate() {
        if chunk.trim().is_empty() {
            continue;
        }
        match serde_yaml::from_str::<Value>(&chunk) {
            Ok(value) if !value.is_null() => documents.push(value),
            Ok(_) => {}
            Err(err) => warnings.push(format!(
                "malformed document {} in {}: {}",
                position + 1,
                source,
                err
            )),
        }
    }
    documents
}

fn split_documents(content: &str) -> Vec<String> {
    let mut chunks = vec![String::new()];
    for line in content.lines() {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed.starts_with("--- ") {
            chunks.push(String::new());
            continue;
        }
        let chunk = chunks.last_mut().expect("chunks is never empty");
        chunk.push_str(line);
        chunk.push('\n');
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(yaml: &str) -> Manifest {
        Manifest::from_document(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_null_safe_field_reads() {
        let m = manifest(
            r#"
kind: Deployment
metadata:
  name: web
  annotations:
spec:
  template:
    spec:
      containers:
"#,
        );
        assert!(m.field(&["metadata", "annotations"]).is_none());
        assert_eq!(m.seq_field(&["spec", "template", "spec", "containers"]).count(), 0);
        assert_eq!(m.namespace, "default");
    }

    #[test]
    fn test_flat_index_later_wins() {
        let mut index = ManifestIndex::new();
        let mut warnings = Vec::new();
        let docs = vec![
            serde_yaml::from_str(
                "kind: ConfigMap\nmetadata: {name: app, namespace: a}\ndata: {k: one}",
            )
            .unwrap(),
            serde_yaml::from_str(
                "kind: ConfigMap\nmetadata: {name: app, namespace: b}\ndata: {k: two}",
            )
            .unwrap(),
        ];
        index.ingest(docs, &HashSet::new(), &mut warnings);
        let cm = index.get("ConfigMap", "app").unwrap();
        assert_eq!(cm.str_field(&["data", "k"]), Some("two"));
        assert_eq!(index.of_kind("ConfigMap").len(), 1);
    }

    #[test]
    fn test_unsupported_kind_warns_once() {
        let mut index = ManifestIndex::new();
        let mut warnings = Vec::new();
        let cronjob = |name: &str| -> Value {
            serde_yaml::from_str(&format!("kind: CronJob\nmetadata: {{name: {}}}", name)).unwrap()
        };
        index.ingest(
            vec![cronjob("a"), cronjob("b")],
            &HashSet::new(),
            &mut warnings,
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("CronJob"));
    }

    #[test]
    fn test_unknown_kind_retained_when_claimed() {
        let mut index = ManifestIndex::new();
        let mut warnings = Vec::new();
        let claimed: HashSet<String> = ["Middleware".to_string()].into_iter().collect();
        index.ingest(
            vec![
                serde_yaml::from_str("kind: Middleware\nmetadata: {name: strip}").unwrap(),
                serde_yaml::from_str("kind: Mystery\nmetadata: {name: x}").unwrap(),
            ],
            &claimed,
            &mut warnings,
        );
        assert!(index.get("Middleware", "strip").is_some());
        assert!(index.get("Mystery", "x").is_none());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_parse_documents_skips_malformed() {
        let mut warnings = Vec::new();
        let content = "kind: ConfigMap\nmetadata: {name: a}\n---\n{broken\n---\nkind: Secret\nmetadata: {name: b}\n";
        let docs = parse_documents(content, "apps.yaml", &mut warnings);
        assert_eq!(docs.len(), 2);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("apps.yaml"));
    }
}
