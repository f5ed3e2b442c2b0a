//! DashCalendar CLI - Bridge interface for the setup script
//!
//! Commands: placeholders, render, check
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on render or validation failure

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use dashcal_core::{PipelineError, RenderPipeline, Template, ValueError, ValueSet};

#[derive(Parser)]
#[command(name = "dashcal-cli")]
#[command(about = "DashCalendar CLI - display host config renderer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom template file (defaults to the built-in dashboard)
    #[arg(long, global = true, requires = "schema")]
    template: Option<PathBuf>,

    /// Placeholder schema for --template
    #[arg(long, global = true, requires = "template")]
    schema: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the placeholders the template declares
    Placeholders,

    /// Render the config document
    Render {
        /// JSON value set
        #[arg(long)]
        values: Option<PathBuf>,

        /// Read declared placeholders from the environment
        #[arg(long)]
        from_env: bool,

        /// Override a placeholder (NAME=VALUE)
        #[arg(short = 's', long = "set")]
        set: Vec<String>,

        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate an existing config document
    Check {
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let template = match (&cli.template, &cli.schema) {
        (Some(template), Some(schema)) => Template::load(template, schema),
        _ => Template::dashboard(),
    };
    let pipeline = match template.map_err(PipelineError::from).and_then(RenderPipeline::new) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "template rejected");
            print_json(&serde_json::json!({ "success": false, "error": e.to_string() }));
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Placeholders => {
            let schema = pipeline.template().schema();
            print_json(&serde_json::json!({
                "id": schema.id,
                "name": schema.name,
                "version": schema.template_version,
                "referenced": pipeline.template().referenced(),
                "required": pipeline.template().required(),
                "placeholders": schema.placeholders,
            }));
            ExitCode::SUCCESS
        }

        Commands::Render { values, from_env, set, output } => {
            let values = match collect_values(&pipeline, values.as_deref(), from_env, &set) {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "value set rejected");
                    print_json(&serde_json::json!({ "success": false, "error": e.to_string() }));
                    return ExitCode::FAILURE;
                }
            };
            debug!(bindings = values.len(), "value set collected");

            let result = match &output {
                Some(path) => pipeline.render_to(path, &values),
                None => pipeline.render(&values),
            };

            match result {
                Ok(document) if output.is_none() => {
                    print!("{}", document.text);
                    ExitCode::SUCCESS
                }
                Ok(document) => {
                    let values_digest = pipeline.values_digest(&values).unwrap_or_default();
                    print_json(&serde_json::json!({
                        "success": true,
                        "templateId": document.template_id,
                        "templateVersion": document.template_version,
                        "output": output.as_ref().map(|p| p.display().to_string()),
                        "bytes": document.text.len(),
                        "modules": document.modules().len(),
                        "digest": document.digest,
                        "valuesDigest": values_digest,
                        "renderedAt": chrono::Utc::now(),
                    }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "render failed");
                    print_json(&serde_json::json!({ "success": false, "error": e.to_string() }));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Check { path } => match RenderPipeline::check_file(&path) {
            Ok(parsed) => {
                print_json(&serde_json::json!({
                    "valid": true,
                    "binding": parsed.binding,
                    "modules": parsed.root.get("modules").and_then(|m| m.as_array()).map(|m| m.len()),
                }));
                ExitCode::SUCCESS
            }
            Err(PipelineError::Io { path, source }) => {
                print_json(&serde_json::json!({
                    "valid": false,
                    "error": format!("Failed to read {}: {}", path.display(), source),
                }));
                ExitCode::FAILURE
            }
            Err(e) => {
                print_json(&serde_json::json!({ "valid": false, "error": e.to_string() }));
                ExitCode::from(2)
            }
        },
    }
}

/// Merge value sources: file, then environment, then --set (later wins).
fn collect_values(
    pipeline: &RenderPipeline,
    values_file: Option<&Path>,
    from_env: bool,
    overrides: &[String],
) -> Result<ValueSet, ValueError> {
    let env = from_env.then(std::env::vars_os);
    ValueSet::collect(pipeline.template().schema(), values_file, env, overrides)
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => println!(r#"{{"success": false, "error": "Serialization failed: {}"}}"#, e),
    }
}
