//! dashql CLI
//!
//! Command-line front end for dashboard query resolution:
//! - List the SQL templates of a dashboard
//! - Render them with variable selections and a time range
//! - Run them against SQLite or Databricks and print the report

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dashql::config::AnalysisConfig;
use dashql::template::TimeRange;
use dashql::{
    extract_queries, generate_default_config, render, AnalysisRequest, Analyzer, CancelToken,
    Config, Dashboard, DatabricksEngine, SqlEngine, SqliteEngine,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dashql")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resolve, run, and summarize the SQL behind a dashboard")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the SQL query templates of a dashboard
    Extract {
        /// Dashboard JSON file
        dashboard: PathBuf,
    },

    /// Print the resolved SQL of every query
    Render {
        /// Dashboard JSON file
        dashboard: PathBuf,
        #[command(flatten)]
        inputs: RunInputs,
    },

    /// Run every query and print the analysis report
    Analyze {
        /// Dashboard JSON file
        dashboard: PathBuf,
        #[command(flatten)]
        inputs: RunInputs,
        /// Run against a local SQLite database instead of Databricks
        #[arg(long)]
        sqlite: Option<PathBuf>,
        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
pub struct RunInputs {
    /// Variable selection, e.g. `env=prod,staging` (repeatable)
    #[arg(short = 'v', long = "var")]
    pub vars: Vec<String>,
    /// Range start (e.g. now-7d, 2024-03-01, epoch millis)
    #[arg(long)]
    pub from: Option<String>,
    /// Range end
    #[arg(long)]
    pub to: Option<String>,
}

impl RunInputs {
    fn to_request(&self, defaults: &AnalysisConfig) -> anyhow::Result<AnalysisRequest> {
        let mut request = AnalysisRequest::new();
        request.selections = parse_vars(&self.vars)?;

        match (&self.from, &self.to) {
            (None, None) => {}
            (from, to) => {
                let range = TimeRange::parse(
                    from.as_deref().unwrap_or(&defaults.default_from),
                    to.as_deref().unwrap_or(&defaults.default_to),
                )
                .context("Invalid --from/--to")?;
                request.time_range = Some(range);
            }
        }
        Ok(request)
    }
}

fn parse_vars(vars: &[String]) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut selections = HashMap::new();
    for var in vars {
        let Some((name, values)) = var.split_once('=') else {
            bail!("Invalid --var '{}', expected name=value[,value...]", var);
        };
        let values: Vec<String> = values
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        selections.insert(name.trim().to_string(), values);
    }
    Ok(selections)
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("dashql={}", config.logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(Config::load_with_env(path)?),
        None => Ok(Config::load_default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config);

    match cli.command {
        Commands::Extract { dashboard } => {
            let dashboard = Dashboard::load(&dashboard)
                .with_context(|| format!("Failed to load {:?}", dashboard))?;
            let templates = extract_queries(&dashboard);

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&templates)?);
            } else if templates.is_empty() {
                println!("No SQL panels found.");
            } else {
                println!("{:<10} {:<5} {:<30} {:<15} {}", "Panel", "Ref", "Title", "Datasource", "Variables");
                println!("{}", "-".repeat(80));
                for t in &templates {
                    println!(
                        "{:<10} {:<5} {:<30} {:<15} {}",
                        t.panel_id,
                        t.ref_id,
                        truncate(&t.title, 30),
                        truncate(&t.datasource_ref, 15),
                        t.variables.join(", ")
                    );
                }
            }
        }

        Commands::Render { dashboard, inputs } => {
            let dashboard = Dashboard::load(&dashboard)
                .with_context(|| format!("Failed to load {:?}", dashboard))?;
            let fallback = TimeRange::parse(&config.analysis.default_from, &config.analysis.default_to)
                .context("Invalid analysis default time range in config")?;
            let rendered = render(&dashboard, &inputs.to_request(&config.analysis)?, &fallback);

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&rendered)?);
            } else {
                if let Some(range) = rendered.resolved_time_range {
                    println!("Time range: {} .. {}", range.from_iso(), range.to_iso());
                }
                for diagnostic in &rendered.diagnostics {
                    println!("! {}", diagnostic);
                }
                for query in &rendered.queries {
                    println!();
                    println!("-- panel {} / {} ({})", query.template.panel_id, query.template.ref_id, query.template.title);
                    for diagnostic in &query.diagnostics {
                        println!("-- ! {}", diagnostic);
                    }
                    println!("{}", query.sql);
                }
            }
        }

        Commands::Analyze {
            dashboard,
            inputs,
            sqlite,
            output,
        } => {
            let json = std::fs::read_to_string(&dashboard)
                .with_context(|| format!("Failed to read {:?}", dashboard))?;

            let engine: Arc<dyn SqlEngine> = match sqlite {
                Some(path) => Arc::new(SqliteEngine::open(&path)?),
                None => Arc::new(DatabricksEngine::new(&config.databricks)?),
            };
            let analyzer = Analyzer::new(engine, &config)?;

            let cancel = CancelToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("Interrupted, waiting for in-flight queries");
                        cancel.cancel();
                    }
                });
            }

            let report = analyzer
                .analyze_json(&json, &inputs.to_request(&config.analysis)?, &cancel)
                .await?;

            let body = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, body)?;
                    println!(
                        "Wrote report for {} panels ({} failed) to {:?}",
                        report.panels.len(),
                        report.failed(),
                        path
                    );
                }
                None => println!("{}", body),
            }
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, &content)?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
