//! FluxDistro CLI
//!
//! Commands: build, render
//! Writes manifests or a JSON summary to stdout, logs to stderr.
//! Returns 2 on policy violations, 1 on any other failure.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tempfile::TempDir;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fluxdistro_core::resources::to_yaml_stream;
use fluxdistro_core::{
    combine_providers, compile, load_config, BuiltinOverlay, DistributionConfig, Error, InputProvider,
    InputStrategy, Kustomize, OverlayEngine, ResourceSet, SlugOptions, TemplateEngine,
};

#[derive(Parser)]
#[command(name = "fluxdistro")]
#[command(about = "FluxDistro - distribution manifest compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Output {
    /// Multi-document YAML manifest
    Manifest,
    /// JSON summary with the revision and component images
    Summary,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the distribution manifests described by a config file
    Build {
        /// Distribution config (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Directory holding one sub-directory per release
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Staging directory, must be empty; a temporary one is used if unset
        #[arg(short, long)]
        work_dir: Option<PathBuf>,

        /// Override the version expression of the config
        #[arg(long)]
        version: Option<String>,

        /// Override the target namespace of the config
        #[arg(long)]
        namespace: Option<String>,

        /// Build in-process instead of running kustomize
        #[arg(long)]
        builtin: bool,

        /// kustomize binary
        #[arg(long, default_value = "kustomize")]
        kustomize: PathBuf,

        #[arg(short, long, value_enum, default_value = "manifest")]
        output: Output,
    },

    /// Render object templates against combined inputs
    Render {
        /// Multi-document template file
        #[arg(short, long)]
        templates: PathBuf,

        /// YAML list of input providers: [{name, inputs: [...]}]
        #[arg(short, long)]
        inputs: Option<PathBuf>,

        /// Flatten or Permute
        #[arg(short, long, default_value = "Flatten")]
        strategy: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Build {
            config,
            data_dir,
            work_dir,
            version,
            namespace,
            builtin,
            kustomize,
            output,
        } => run_build(
            &config,
            &data_dir,
            work_dir,
            version,
            namespace,
            builtin,
            kustomize,
            output,
        ),
        Commands::Render {
            templates,
            inputs,
            strategy,
        } => run_render(&templates, inputs.as_deref(), &strategy),
    };

    match result {
        Ok(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "command failed");
            let output = serde_json::json!({
                "success": false,
                "error": e.to_string(),
            });
            println!("{output}");
            if e.is_policy_violation() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    config_path: &Path,
    data_dir: &Path,
    work_dir: Option<PathBuf>,
    version: Option<String>,
    namespace: Option<String>,
    builtin: bool,
    kustomize: PathBuf,
    output: Output,
) -> Result<String, Error> {
    let mut config: DistributionConfig = load_config(config_path)?;
    if let Some(version) = version {
        config.version = version;
    }
    if let Some(namespace) = namespace {
        config.namespace = namespace;
    }

    let overlay: Box<dyn OverlayEngine> = if builtin {
        Box::new(BuiltinOverlay)
    } else {
        Box::new(Kustomize::with_binary(kustomize))
    };

    let (work_dir, scratch) = prepare_work_dir(work_dir)?;
    let result = compile(data_dir, &work_dir, &config, overlay)?;
    drop(scratch);

    match output {
        Output::Manifest => Ok(result.manifest),
        Output::Summary => {
            let summary = serde_json::json!({
                "success": true,
                "objects": result.objects.len(),
                "result": result,
            });
            Ok(format!("{}\n", serde_json::to_string_pretty(&summary)?))
        }
    }
}

/// Create the staging directory. Without an explicit one a scratch directory
/// is used; it is removed when the returned guard drops.
fn prepare_work_dir(work_dir: Option<PathBuf>) -> Result<(PathBuf, Option<TempDir>), Error> {
    match work_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
            Ok((dir, None))
        }
        None => {
            let scratch = tempfile::Builder::new()
                .prefix("fluxdistro-")
                .tempdir()
                .map_err(|e| Error::io("failed to create scratch directory", e))?;
            Ok((scratch.path().to_path_buf(), Some(scratch)))
        }
    }
}

fn run_render(templates: &Path, inputs: Option<&Path>, strategy: &str) -> Result<String, Error> {
    let strategy: InputStrategy = strategy.parse()?;
    let text = fs::read_to_string(templates)
        .map_err(|e| Error::io(format!("failed to read {}", templates.display()), e))?;

    let providers: Vec<InputProvider> = match inputs {
        Some(path) => {
            let content = fs::read_to_string(path)
                .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
            serde_yaml::from_str(&content)?
        }
        None => vec![],
    };
    let fact_sets = combine_providers(strategy, &providers)?;

    let engine = TemplateEngine::new(SlugOptions::default()).map_err(|source| Error::Render {
        template: 0,
        input: None,
        source,
    })?;
    let mut acc = ResourceSet::new();
    engine.render_document_set(0, &text, &fact_sets, &mut acc)?;
    Ok(to_yaml_stream(&acc.into_resources())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_work_dir_removed_on_drop() {
        let (first, guard) = prepare_work_dir(None).unwrap();
        let (second, other) = prepare_work_dir(None).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir());
        drop(guard);
        drop(other);
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_explicit_work_dir_is_kept() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("stage");
        let (path, guard) = prepare_work_dir(Some(dir.clone())).unwrap();
        assert_eq!(path, dir);
        assert!(guard.is_none());
        assert!(dir.is_dir());
    }
}
