//! dhf-rag CLI - Maintain and query the DHF context index of a project

use clap::{Parser, Subcommand};
use colored::Colorize;
use dhf_rag_core::{CacheManager, Config, DhfError, RetrievalOptions};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "dhf-rag")]
#[command(about = "Context retrieval for Design History File generation", long_about = None)]
struct Cli {
    /// Config file (default: <project>/.dhf-rag.toml, then built-in defaults)
    #[arg(long, global = true, env = "DHF_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .dhf-rag.toml into the project
    InitConfig {
        #[arg(default_value = ".")]
        project: PathBuf,
    },

    /// Build the index if it is missing or stale
    Index {
        #[arg(default_value = ".")]
        project: PathBuf,
    },

    /// Show cache state without rebuilding
    Status {
        #[arg(default_value = ".")]
        project: PathBuf,
    },

    /// Print the current fingerprint of the tracked files
    Fingerprint {
        #[arg(default_value = ".")]
        project: PathBuf,
    },

    /// Assemble the context package for a prompt
    Retrieve {
        #[arg(default_value = ".")]
        project: PathBuf,

        /// Prompt text, may contain [Category|...] directives
        #[arg(short, long, conflicts_with = "prompt_file")]
        prompt: Option<String>,

        /// Read the prompt from a file
        #[arg(long)]
        prompt_file: Option<PathBuf>,

        /// Token budget for the assembled fragment
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Procedure chunks to retrieve
        #[arg(long)]
        procedure_top_k: Option<usize>,

        /// Context chunks to retrieve
        #[arg(long)]
        context_top_k: Option<usize>,

        /// Master record field as NAME=VALUE (repeatable)
        #[arg(long = "master-record", value_name = "NAME=VALUE")]
        master_record: Vec<String>,

        /// Master checklist text file
        #[arg(long)]
        master_checklist: Option<PathBuf>,
    },

    /// Delete the project's cached index
    Clear {
        #[arg(default_value = ".")]
        project: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    let config = cli.config;
    let result = match cli.command {
        Commands::InitConfig { project } => cmd_init_config(&project, json),
        Commands::Index { project } => cmd_index(config, &project, json).await,
        Commands::Status { project } => cmd_status(config, &project, json).await,
        Commands::Fingerprint { project } => cmd_fingerprint(config, &project, json).await,
        Commands::Retrieve {
            project,
            prompt,
            prompt_file,
            max_tokens,
            procedure_top_k,
            context_top_k,
            master_record,
            master_checklist,
        } => {
            let request = RetrieveRequest {
                prompt,
                prompt_file,
                max_tokens,
                procedure_top_k,
                context_top_k,
                master_record,
                master_checklist,
            };
            cmd_retrieve(config, &project, request, json).await
        }
        Commands::Clear { project } => cmd_clear(config, &project, json).await,
    };

    if let Err(e) = result {
        if json {
            match serde_json::to_string_pretty(&e.envelope()) {
                Ok(body) => eprintln!("{body}"),
                Err(_) => eprintln!("{{\"code\": \"{}\", \"message\": {:?}}}", e.code(), e.to_string()),
            }
        } else {
            eprintln!("{}: {}", "Error".red(), e);
            if e.is_retriable() {
                eprintln!("{}: {}", "Hint".yellow(), e.envelope().hint);
            }
        }
        std::process::exit(1);
    }
}

fn load_config(config: Option<PathBuf>, project: &Path) -> dhf_rag_core::Result<Config> {
    match config {
        Some(path) => {
            tracing::debug!(config = %path.display(), "loading config");
            Config::load(&path)
        }
        None => Config::for_project(project),
    }
}

fn make_manager(config: Option<PathBuf>, project: &Path) -> dhf_rag_core::Result<CacheManager> {
    CacheManager::new(load_config(config, project)?)
}

fn print_json<T: Serialize>(value: &T) -> dhf_rag_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init_config(project: &Path, json: bool) -> dhf_rag_core::Result<()> {
    let path = Config::init_project(project)?;
    if json {
        print_json(&serde_json::json!({ "created": path }))
    } else {
        println!("{} {}", "Created".green(), path.display());
        Ok(())
    }
}

async fn cmd_index(config: Option<PathBuf>, project: &Path, json: bool) -> dhf_rag_core::Result<()> {
    let manager = make_manager(config, project)?;
    let started = Instant::now();
    let index = manager.ensure_index_ready(project).await?;
    let rebuilt = manager.rebuild_count() > 0;

    if json {
        return print_json(&serde_json::json!({
            "rebuilt": rebuilt,
            "record": index.record,
            "elapsedMs": started.elapsed().as_millis() as u64,
        }));
    }

    let verb = if rebuilt { "Indexed".green() } else { "Up to date".yellow() };
    println!(
        "{}: {} files, {} chunks ({:.1}s)",
        verb,
        index.record.file_count,
        index.record.chunk_count,
        started.elapsed().as_secs_f64()
    );
    println!("{}: {}", "Fingerprint".blue(), index.record.fingerprint);
    println!("{}: {}", "Model".blue(), index.record.model_id);
    Ok(())
}

async fn cmd_status(config: Option<PathBuf>, project: &Path, json: bool) -> dhf_rag_core::Result<()> {
    let manager = make_manager(config, project)?;
    let status = manager.status(project).await?;
    if json {
        return print_json(&status);
    }

    println!("{}: {}", "Project".blue(), status.project.display());
    println!("{}: {}", "Cache".blue(), status.cache_dir.display());
    match &status.record {
        Some(record) => {
            let state = if status.valid { "valid".green() } else { "stale".yellow() };
            println!("{}: {}", "Index".blue(), state);
            println!(
                "{}: {} files, {} chunks, indexed {}",
                "Contents".blue(),
                record.file_count,
                record.chunk_count,
                record.indexed_at
            );
            println!("{}: {}", "Model".blue(), record.model_id);
        }
        None => println!("{}: {}", "Index".blue(), "none".red()),
    }
    println!("{}: {}", "Fingerprint".blue(), status.current_fingerprint);
    Ok(())
}

async fn cmd_fingerprint(config: Option<PathBuf>, project: &Path, json: bool) -> dhf_rag_core::Result<()> {
    let manager = make_manager(config, project)?;
    let fingerprint = manager.fingerprint(project).await?;
    if json {
        print_json(&serde_json::json!({ "fingerprint": fingerprint }))
    } else {
        println!("{fingerprint}");
        Ok(())
    }
}

struct RetrieveRequest {
    prompt: Option<String>,
    prompt_file: Option<PathBuf>,
    max_tokens: Option<usize>,
    procedure_top_k: Option<usize>,
    context_top_k: Option<usize>,
    master_record: Vec<String>,
    master_checklist: Option<PathBuf>,
}

fn read_file(path: &Path) -> dhf_rag_core::Result<String> {
    std::fs::read_to_string(path).map_err(|e| DhfError::IoAt {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Parse `NAME=VALUE` pairs
fn parse_master_record(pairs: &[String]) -> dhf_rag_core::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| DhfError::ConfigParse(format!("expected NAME=VALUE, got {pair:?}")))
        })
        .collect()
}

async fn cmd_retrieve(
    config: Option<PathBuf>,
    project: &Path,
    request: RetrieveRequest,
    json: bool,
) -> dhf_rag_core::Result<()> {
    let manager = make_manager(config, project)?;

    let prompt = match (request.prompt, &request.prompt_file) {
        (Some(prompt), _) => prompt,
        (None, Some(path)) => read_file(path)?,
        (None, None) => {
            return Err(DhfError::ConfigParse(
                "provide --prompt or --prompt-file".to_string(),
            ))
        }
    };

    let defaults = &manager.config().retrieval;
    let mut options = RetrievalOptions::from_config(defaults)
        .with_top_k(
            request.procedure_top_k.unwrap_or(defaults.procedure_top_k),
            request.context_top_k.unwrap_or(defaults.context_top_k),
        )
        .with_max_tokens(request.max_tokens.unwrap_or(defaults.max_tokens))
        .with_master_record(parse_master_record(&request.master_record)?);
    if let Some(path) = &request.master_checklist {
        options = options.with_master_checklist(read_file(path)?);
    }

    let package = manager.retrieve_context(project, &prompt, &options).await?;
    if json {
        return print_json(&package);
    }

    println!("{}", package.fragment);
    eprintln!();
    eprintln!(
        "{}: {} procedure, {} context chunks, ~{} tokens (budget {})",
        "Retrieved".green(),
        package.ranked_procedure_chunks.len(),
        package.ranked_context_chunks.len(),
        package.estimated_tokens,
        options.max_tokens
    );
    if package.over_budget {
        eprintln!(
            "{}: instructions and summaries alone exceed the budget",
            "Warning".yellow()
        );
    }
    eprintln!("{}: {}", "Sources".blue(), package.sources.join(", "));
    Ok(())
}

async fn cmd_clear(config: Option<PathBuf>, project: &Path, json: bool) -> dhf_rag_core::Result<()> {
    let manager = make_manager(config, project)?;
    manager.clear(project).await?;
    if json {
        print_json(&serde_json::json!({ "cleared": project }))
    } else {
        println!("{} cache for {}", "Cleared".green(), project.display());
        Ok(())
    }
}
