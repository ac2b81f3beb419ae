//! # Composify - Kubernetes Manifests to Docker Compose Conversion Tool
//!
//! Composify takes a directory of rendered Kubernetes manifests (the output
//! of a Helm-style templating tool) and converts it into a Docker Compose
//! project: a `compose.yml` describing services, volumes and networks, a
//! `Caddyfile` describing HTTP reverse-proxy routing, and a persistent
//! project configuration a human may edit and that survives re-runs.
//!
//! ## Features
//!
//! - **Workload Conversion**: Deployments, StatefulSets, DaemonSets and
//!   Jobs become compose services, including init containers and sidecars
//! - **Env & Volume Resolution**: ConfigMaps, Secrets, fieldRefs, kubelet
//!   `$(VAR)` expansion, PVCs and materialised file mounts
//! - **Caddy Ingress**: Ingress manifests become Caddy site blocks through
//!   pluggable rewriters
//! - **Lua Extensions**: converters, providers, transforms and ingress
//!   rewriters loaded at runtime from an extensions directory
//! - **Deterministic Re-Runs**: post-processing rewrites are idempotent and
//!   the project config round-trips byte-identically
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use composify::config::ProjectConfig;
//! use composify::Composify;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProjectConfig::new("my-project");
//!     let composify = Composify::new(config);
//!
//!     let output = composify.convert_dir(Path::new("./rendered")).await?;
//!     output.write(Path::new("./out"), "compose.yml").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`index`] - manifest ingestion, classification and lookup
//! - [`env`] - container environment resolution
//! - [`volumes`] - volume and mount resolution
//! - [`service`] - workload to compose service conversion
//! - [`ingress`] - ingress rewriting and Caddyfile rendering
//! - [`extensions`] - the Lua extension registry
//! - [`pipeline`] - the phased conversion driver
//! - [`rewrite`] - post-processing rewrites and placeholder resolution
//! - [`compose`] - compose file model and output assembly
//! - [`config`] - persistent project configuration

pub mod compose;
pub mod config;
pub mod env;
pub mod extensions;
pub mod index;
pub mod ingress;
pub mod pipeline;
pub mod rewrite;
pub mod service;
pub mod volumes;

// Re-export commonly used types for convenience
pub use compose::{ComposeFile, ComposeService};
pub use config::ProjectConfig;
pub use extensions::ExtensionRegistry;
pub use index::{Manifest, ManifestIndex};
pub use ingress::IngressEntry;
pub use pipeline::ConversionOutput;

use anyhow::Result;
use std::path::Path;

/// Current version of Composify
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Composify library error types
#[derive(thiserror::Error, Debug)]
pub enum ComposifyError {
    /// IO error occurred during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Template rendering error
    #[error("Template rendering error: {0}")]
    Template(#[from] handlebars::RenderError),

    /// Project configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Extension loading or runtime error
    #[error("Extension error: {0}")]
    Extension(String),

    /// Conversion error
    #[error("Conversion error: {0}")]
    Conversion(String),
}

/// Main Composify client for programmatic usage
pub struct Composify {
    config: ProjectConfig,
    registry: ExtensionRegistry,
}

impl Composify {
    /// Create a client with an empty extension registry.
    pub fn new(config: ProjectConfig) -> Self {
        Self::with_registry(config, ExtensionRegistry::new())
    }

    pub fn with_registry(config: ProjectConfig, registry: ExtensionRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn registry_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.registry
    }

    /// Read every YAML file under `input_dir` and run the full conversion
    /// pipeline over the documents.
    pub async fn convert_dir(&self, input_dir: &Path) -> Result<ConversionOutput> {
        let mut warnings = Vec::new();
        let documents = index::read_manifest_dir(input_dir, &mut warnings).await?;
        pipeline::convert(documents, self.config.clone(), &self.registry, warnings)
    }

    /// Run the pipeline over already-parsed documents.
    pub fn convert_documents(
        &self,
        documents: Vec<serde_yaml::Value>,
    ) -> Result<ConversionOutput> {
        pipeline::convert(documents, self.config.clone(), &self.registry, Vec::new())
    }
}
