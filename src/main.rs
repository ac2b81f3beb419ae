use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use composify::config::ProjectConfig;
use composify::extensions::ExtensionRegistry;
use composify::index::read_manifest_dir;
use composify::pipeline;

#[derive(Parser)]
#[command(name = "composify")]
#[command(about = "Convert rendered Kubernetes manifests into a Docker Compose project")]
#[command(version)]
#[command(group(
    clap::ArgGroup::new("input")
        .required(true)
        .args(["helmfile_dir", "from_dir"])
))]
struct Cli {
    /// Render this helmfile directory with `helmfile template` first
    #[arg(long, value_name = "PATH")]
    helmfile_dir: Option<PathBuf>,
    /// Skip rendering and read manifests from this directory
    #[arg(long, value_name = "PATH")]
    from_dir: Option<PathBuf>,
    /// Environment name passed to the renderer
    #[arg(short, long)]
    environment: Option<String>,
    /// Target directory for compose.yml, Caddyfile and project config
    #[arg(short, long, value_name = "PATH")]
    output_dir: PathBuf,
    /// Override the compose output file name
    #[arg(long, default_value = "compose.yml")]
    compose_file: String,
    /// Load Lua extensions from this directory
    #[arg(long, value_name = "PATH")]
    extensions_dir: Option<PathBuf>,
    /// Project name used when no config exists yet
    #[arg(long)]
    project_name: Option<String>,
    /// Suppress status output
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", format!("error: {:#}", err).bold().red());
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // the tempdir holding rendered output must outlive ingestion
    let mut rendered = None;
    let input_dir = match (&cli.helmfile_dir, &cli.from_dir) {
        (Some(helmfile_dir), None) => {
            if !cli.quiet {
                println!(
                    "{}",
                    format!("🎈 Rendering helmfile in {}...", helmfile_dir.display())
                        .bold()
                        .blue()
                );
            }
            let scratch = render_helmfile(helmfile_dir, cli.environment.as_deref()).await?;
            let path = scratch.path().to_path_buf();
            rendered = Some(scratch);
            path
        }
        (None, Some(from_dir)) => from_dir.clone(),
        _ => bail!("exactly one of --helmfile-dir or --from-dir must be set"),
    };

    let default_name = cli
        .project_name
        .clone()
        .or_else(|| {
            cli.output_dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "project".to_string());
    let config = ProjectConfig::load_or_init(&cli.output_dir, &default_name).await?;

    let mut warnings = Vec::new();
    let mut registry = ExtensionRegistry::new();
    if let Some(extensions_dir) = &cli.extensions_dir {
        registry.load_dir(extensions_dir, &mut warnings).await?;
    }
    if config.fix_permissions {
        registry.register_fix_permissions(&mut warnings);
    }

    if !cli.quiet {
        println!(
            "{}",
            "🚀 Converting Kubernetes manifests to Docker Compose..."
                .bold()
                .green()
        );
    }

    let documents = read_manifest_dir(&input_dir, &mut warnings).await?;
    let output = pipeline::convert(documents, config, &registry, warnings)?;
    output.write(&cli.output_dir, &cli.compose_file).await?;
    drop(rendered);

    for warning in &output.warnings {
        eprintln!("{}", format!("warning: {}", warning).yellow());
    }

    if output.compose.services.is_empty() {
        eprintln!(
            "{}",
            "pipeline completed but produced zero compose services"
                .bold()
                .yellow()
        );
        return Ok(ExitCode::from(2));
    }

    if !cli.quiet {
        println!(
            "{}",
            format!(
                "✅ Wrote {} services to {}",
                output.compose.services.len(),
                cli.output_dir.join(&cli.compose_file).display()
            )
            .bold()
            .green()
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Invoke the upstream renderer and collect its output in a scratch
/// directory.
async fn render_helmfile(
    helmfile_dir: &Path,
    environment: Option<&str>,
) -> Result<tempfile::TempDir> {
    let scratch = tempfile::tempdir().context("Failed to create scratch dir for rendering")?;
    let mut command = tokio::process::Command::new("helmfile");
    command.current_dir(helmfile_dir);
    if let Some(environment) = environment {
        command.args(["--environment", environment]);
    }
    command.arg("template").arg("--output-dir");
    command.arg(scratch.path());
    let status = command
        .status()
        .await
        .context("Failed to run helmfile; is it on PATH?")?;
    if !status.success() {
        bail!("helmfile template exited with {}", status);
    }
    Ok(scratch)
}
