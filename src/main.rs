use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codectx::config::{Config, DEFAULT_CONFIG_FILE};
use codectx::db::Store;
use codectx::indexer::{FileOutcome, Indexer};
use codectx::ranker::{ContextOptions, CurrentFile, Ranker};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codectx", version, about = "Index a codebase and assemble context for questions about it")]
struct Cli {
    /// Configuration file (JSON).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Index database, overriding the configured path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a project directory.
    Index {
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Re-index files whose modification time did not change.
        #[arg(long)]
        force: bool,
        /// Extra exclude patterns, e.g. `vendor` or `*.pb.go`.
        #[arg(long)]
        exclude: Vec<String>,
        /// Only index file names matching these patterns, e.g. `*.py`.
        #[arg(long)]
        include: Vec<String>,
    },
    /// Search the index.
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Assemble context for a question.
    Context {
        query: String,
        /// File being edited, relative to the project root or absolute.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Cursor line in `--file`, 1-indexed.
        #[arg(long)]
        line: Option<usize>,
        /// Token budget.
        #[arg(long)]
        budget: Option<usize>,
        /// Project root; the current directory by default.
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show index statistics.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove everything from the index.
    Clear {
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Index or re-index a single file, e.g. from an editor save hook.
    /// Prints a JSON result.
    IndexFile {
        path: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(db) = &cli.db {
        config.db_path = db.to_string_lossy().into_owned();
    }
    config.validate().context("invalid configuration")?;

    match cli.command {
        Command::Index {
            path,
            force,
            exclude,
            include,
        } => run_index(config, &path, force, exclude, include).await,
        Command::Search { query, limit, json } => run_search(&config, &query, limit, json),
        Command::Context {
            query,
            file,
            line,
            budget,
            root,
            json,
        } => run_context(&config, &query, file, line, budget, root, json),
        Command::Status { json } => run_status(&config, json),
        Command::Clear { yes } => run_clear(&config, yes),
        Command::IndexFile { path, root } => run_index_file(&config, &path, root),
    }
}

fn open_store(config: &Config) -> Result<Store> {
    Store::open(&config.db_path)
        .with_context(|| format!("failed to open index at {}", config.db_path))
}

fn index_exists(config: &Config) -> bool {
    Path::new(&config.db_path).exists()
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    let root = match root {
        Some(root) => root,
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    root.canonicalize()
        .with_context(|| format!("cannot resolve {}", root.display()))
}

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]") {
        bar.set_style(style);
    }
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

async fn run_index(
    mut config: Config,
    path: &Path,
    force: bool,
    exclude: Vec<String>,
    include: Vec<String>,
) -> Result<()> {
    config.index.exclude.extend(exclude);
    if !include.is_empty() {
        config.index.include = include;
    }
    let root = resolve_root(Some(path.to_path_buf()))?;

    let store = Arc::new(open_store(&config)?);
    let indexer = Indexer::new(store.clone(), &config)?;
    info!("Indexing {} into {}", root.display(), config.db_path);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current file");
            on_interrupt.cancel();
        }
    });

    let bar = spinner(format!("Indexing {}", root.display()));
    let result = tokio::task::spawn_blocking(move || indexer.index_directory(&root, force, &cancel))
        .await
        .context("indexing task failed")??;
    bar.finish_and_clear();

    let stats = store.get_stats()?;
    println!("Indexing {}", if result.cancelled { "cancelled" } else { "complete" });
    println!("  Files indexed:   {} ({} new, {} updated)", result.indexed, result.added, result.updated);
    println!("  Chunks created:  {}", result.chunks);
    println!("  Files skipped:   {}", result.skipped);
    println!("  Files removed:   {}", result.removed);
    println!("  Errors:          {}", result.failed);
    println!("  Index total:     {} files, {} chunks", stats.file_count, stats.chunk_count);
    Ok(())
}

fn run_search(config: &Config, query: &str, limit: usize, as_json: bool) -> Result<()> {
    if !index_exists(config) {
        anyhow::bail!("no index found at {}; run `codectx index` first", config.db_path);
    }
    let ranker = Ranker::new(Some(Arc::new(open_store(config)?)), config);
    let results = ranker.search(query, limit)?;

    if as_json {
        println!("{}", json!({ "query": query, "results": results }));
        return Ok(());
    }
    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} results for: {query}\n", results.len());
    for (i, hit) in results.iter().enumerate() {
        let chunk = &hit.record.chunk;
        println!(
            "#{} {}:{}-{}  {} {}",
            i + 1,
            hit.record.file_path,
            chunk.start_line,
            chunk.end_line,
            chunk.kind.as_str(),
            chunk.name.as_deref().unwrap_or("")
        );
        println!("    Score: {:.4}", hit.score);
        let mut preview: String = chunk.content.chars().take(200).collect();
        if chunk.content.chars().count() > 200 {
            preview.push_str("...");
        }
        println!("    {}\n", preview.replace('\n', " "));
    }
    Ok(())
}

fn run_context(
    config: &Config,
    query: &str,
    file: Option<PathBuf>,
    line: Option<usize>,
    budget: Option<usize>,
    root: Option<PathBuf>,
    as_json: bool,
) -> Result<()> {
    let root = resolve_root(root)?;
    let store = if index_exists(config) {
        match open_store(config) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("{e:#}");
                None
            }
        }
    } else {
        warn!("No index found at {}", config.db_path);
        None
    };

    let current_file = file.map(|file| {
        let file = file.canonicalize().unwrap_or(file);
        CurrentFile::new(file.to_string_lossy())
    });
    let opts = ContextOptions {
        budget,
        current_file,
        cursor_line: line,
        project_root: Some(root),
        lsp_definitions: Vec::new(),
    };

    let result = Ranker::new(store, config).build_context(query, &opts);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    print!("{}", result.text);
    let meta = &result.metadata;
    eprintln!(
        "\n[{}] {} blocks, {}/{} tokens, {} deduplicated{}",
        meta.query_type,
        meta.sources.len(),
        meta.total_tokens,
        meta.budget,
        meta.deduplicated,
        if meta.degraded { ", degraded" } else { "" }
    );
    Ok(())
}

fn run_status(config: &Config, as_json: bool) -> Result<()> {
    if !index_exists(config) {
        println!("No index found. Run `codectx index` first.");
        return Ok(());
    }
    let stats = open_store(config)?.get_stats()?;
    let db_size = std::fs::metadata(&config.db_path).map(|m| m.len()).unwrap_or(0);

    if as_json {
        println!("{}", json!({ "database": config.db_path, "db_size": db_size, "stats": stats }));
        return Ok(());
    }

    println!("Index status ({})", config.db_path);
    println!("  Files:    {}", stats.file_count);
    println!("  Chunks:   {}", stats.chunk_count);
    println!("  Imports:  {}", stats.import_count);
    println!("  Calls:    {}", stats.call_count);
    println!("  Size:     {:.1} KiB", db_size as f64 / 1024.0);
    if !stats.languages.is_empty() {
        println!("By language:");
        let mut languages: Vec<_> = stats.languages.iter().collect();
        languages.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (language, files) in languages {
            println!("  {language:<12} {files}");
        }
    }
    Ok(())
}

fn run_clear(config: &Config, yes: bool) -> Result<()> {
    if !index_exists(config) {
        println!("No index found.");
        return Ok(());
    }
    if !yes {
        print!("Clear the index at {}? [y/N] ", config.db_path);
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }
    open_store(config)?.clear()?;
    println!("Index cleared.");
    Ok(())
}

fn run_index_file(config: &Config, path: &Path, root: Option<PathBuf>) -> Result<()> {
    if !index_exists(config) {
        println!("{}", json!({ "success": false, "error": "No index found. Run `codectx index` first." }));
        return Ok(());
    }

    let outcome = resolve_root(root).and_then(|root| {
        let file = path
            .canonicalize()
            .with_context(|| format!("cannot resolve {}", path.display()))?;
        let indexer = Indexer::new(Arc::new(open_store(config)?), config)?;
        let outcome = indexer.on_file_saved(&root, &file)?;
        Ok((file, outcome))
    });

    match outcome {
        Ok((file, outcome)) => {
            println!(
                "{}",
                json!({
                    "success": true,
                    "indexed": matches!(outcome, FileOutcome::Indexed { .. }),
                    "filepath": file.to_string_lossy(),
                })
            );
            Ok(())
        }
        Err(e) => {
            println!("{}", json!({ "success": false, "error": format!("{e:#}") }));
            std::process::exit(1);
        }
    }
}
