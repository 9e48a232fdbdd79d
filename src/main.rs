//! # local-rag CLI (`lrag`)
//!
//! The `lrag` binary drives the indexer and query engine from the shell and
//! starts the HTTP service.
//!
//! ## Usage
//!
//! ```bash
//! lrag --config ./config/lrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lrag init` | Create the app database and the vector store |
//! | `lrag index` | Incrementally index the configured roots |
//! | `lrag index --full` | Drop everything under the roots and rebuild |
//! | `lrag search "<query>"` | Query the local index and synthesize an answer |
//! | `lrag web "<query>"` | Web search with engine fallback |
//! | `lrag ask <file> "<query>"` | Ask about one file, blended with the web |
//! | `lrag stats` | Index and event log overview |
//! | `lrag serve` | Start the HTTP service |
//! | `lrag completions <shell>` | Print shell completions |

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};

use local_rag::app::App;
use local_rag::config::{load_config, Config};
use local_rag::ingest::IndexRequest;
use local_rag::models::{IndexRunResult, RunStatus};
use local_rag::query::{AskWithFileRequest, LocalSearchRequest, WebSearchRequest};
use local_rag::store::SqliteVectorStore;
use local_rag::{logging, migrate, server, stats};

/// local-rag: index local documents, search them, and blend in the web.
#[derive(Parser)]
#[command(name = "lrag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/lrag.toml`. A missing file means built-in
    /// defaults plus environment overrides (`DATA_DIR`, `INDEX_ROOTS`, ...).
    #[arg(long, global = true, default_value = "./config/lrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the app database and vector store. Safe to run repeatedly.
    Init,

    /// Index document roots into the vector store.
    ///
    /// Incremental by default: only new and changed files are re-embedded
    /// and files that disappeared are removed from the index.
    Index {
        /// Root directory or file. Repeatable; defaults to `index.roots`.
        #[arg(long = "root")]
        roots: Vec<PathBuf>,

        /// Remove everything under the roots first, then index from scratch.
        #[arg(long)]
        full: bool,

        /// Re-embed files even when their content is unchanged.
        #[arg(long)]
        force_reembed: bool,

        /// Embedding model override for this run.
        #[arg(long)]
        model: Option<String>,

        /// Print the run result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Query the local index.
    Search {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        /// Only return chunks whose source path starts with this prefix.
        #[arg(long)]
        path_prefix: Option<String>,

        /// Skip answer synthesis and print hits only.
        #[arg(long)]
        no_answer: bool,

        #[arg(long)]
        json: bool,
    },

    /// Search the web, falling back across engines.
    Web {
        query: String,

        /// Engine preference such as `exa|serper`.
        #[arg(long)]
        engine: Option<String>,

        #[arg(long)]
        top_n: Option<usize>,

        /// Fetch page text for results that lack it.
        #[arg(long)]
        data: bool,

        #[arg(long)]
        no_answer: bool,

        #[arg(long)]
        json: bool,
    },

    /// Ask a question about a single file, blended with web results.
    ///
    /// The file is indexed into a private scope for the duration of the
    /// question and removed afterwards.
    Ask {
        file: PathBuf,
        query: String,

        #[arg(long)]
        engine: Option<String>,

        #[arg(long)]
        local_top_k: Option<usize>,

        #[arg(long)]
        web_top_n: Option<usize>,

        /// Fetch page text for web results.
        #[arg(long)]
        scrape_web: bool,

        /// Also retrieve from the persistent index, not just the file.
        #[arg(long)]
        include_index: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show index and event log statistics.
    Stats,

    /// Start the HTTP service on `server.bind`.
    Serve,

    /// Print shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "lrag", &mut std::io::stdout());
        return Ok(());
    }

    logging::init("info");
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => init(&config).await?,
        Commands::Index {
            roots,
            full,
            force_reembed,
            model,
            json,
        } => {
            let app = App::open(config).await?;
            let mut request = if full {
                IndexRequest::full(roots)
            } else {
                IndexRequest::incremental(roots)
            };
            request.force_reembed = force_reembed;
            request.embedder = app.embedder_for(model.as_deref())?;

            let result = app.indexer.run(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_run(&result);
            }
            app.close().await;
            if result.status == RunStatus::Failed {
                bail!("indexing run failed");
            }
        }
        Commands::Search {
            query,
            top_k,
            path_prefix,
            no_answer,
            json,
        } => {
            let app = App::open(config).await?;
            let request = LocalSearchRequest {
                user_id: None,
                query,
                top_k,
                filters: path_prefix.map(|p| serde_json::json!({ "path_prefix": p })),
                answer: !no_answer,
            };
            let response = app.engine.search_local(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                if response.hits.is_empty() {
                    println!("No results.");
                }
                for (i, hit) in response.hits.iter().enumerate() {
                    println!(
                        "{}. [{:.2}] {} #{}",
                        i + 1,
                        hit.score,
                        hit.path,
                        hit.chunk_index
                    );
                    println!("    {}", snippet(&hit.text, 200));
                }
                print_answer(response.answer.as_deref(), response.answer_error.as_deref());
            }
            app.close().await;
        }
        Commands::Web {
            query,
            engine,
            top_n,
            data,
            no_answer,
            json,
        } => {
            let app = App::open(config).await?;
            let request = WebSearchRequest {
                user_id: None,
                q: query,
                engine,
                top_n,
                data,
                answer: !no_answer,
            };
            let response = app.engine.search_web(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                for failure in &response.attempt_errors {
                    eprintln!("  {} failed: {}", failure.engine, failure.error);
                }
                for (i, result) in response.results.iter().enumerate() {
                    println!("{}. {} ({})", i + 1, result.title, result.engine);
                    println!("    {}", result.url);
                    if !result.snippet.is_empty() {
                        println!("    {}", snippet(&result.snippet, 200));
                    }
                }
                print_answer(response.answer.as_deref(), response.answer_error.as_deref());
            }
            app.close().await;
            if response.all_failed() {
                bail!("all web search engines failed");
            }
        }
        Commands::Ask {
            file,
            query,
            engine,
            local_top_k,
            web_top_n,
            scrape_web,
            include_index,
            json,
        } => {
            let file_bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let app = App::open(config).await?;
            let request = AskWithFileRequest {
                user_id: None,
                query,
                file_name: file_name_of(&file),
                file_bytes,
                engine,
                local_top_k,
                web_top_n,
                scrape_web,
                restrict_local_to_file: !include_index,
            };
            let response = app.engine.ask_with_file(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!(
                    "{}: {} chunks, {} local hits, {} web results",
                    response.file.name,
                    response.file.chunks,
                    response.local.len(),
                    response.web.results.len()
                );
                for failure in &response.web.attempt_errors {
                    eprintln!("  {} failed: {}", failure.engine, failure.error);
                }
                print_answer(response.answer.as_deref(), response.answer_error.as_deref());
            }
            app.close().await;
        }
        Commands::Stats => {
            let app = App::open(config).await?;
            stats::run_stats(&app).await?;
            app.close().await;
        }
        Commands::Serve => {
            let app = App::open(config).await?;
            server::run_server(app).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    let vector_dir = config.storage.vector_dir();
    SqliteVectorStore::open(&vector_dir)
        .await
        .with_context(|| format!("Failed to create vector store in {}", vector_dir.display()))?;
    let upload_dir = config.storage.upload_dir();
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .with_context(|| format!("Failed to create {}", upload_dir.display()))?;

    println!("Database initialized successfully.");
    println!("  App database: {}", config.storage.app_db_path().display());
    println!("  Vector store: {}", vector_dir.display());
    Ok(())
}

fn print_run(result: &IndexRunResult) {
    let id = result
        .event_id
        .map(|id| format!("#{} ", id))
        .unwrap_or_default();
    println!("Index run {}({:?}): {}", id, result.mode, result.status.as_str());
    let c = &result.counts;
    println!(
        "  scanned: {}  new: {}  changed: {}  unchanged: {}  deleted: {}",
        c.scanned, c.new, c.changed, c.unchanged, c.deleted
    );
    println!(
        "  chunks written: {}  chunks deleted: {}  ({} ms)",
        result.chunks_written, result.chunks_deleted, result.elapsed_ms
    );
    if !result.errors.is_empty() {
        println!("  errors:");
        for err in &result.errors {
            println!("    {} [{:?}] {}", err.path, err.kind, err.message);
        }
    }
}

fn print_answer(answer: Option<&str>, error: Option<&str>) {
    if let Some(answer) = answer {
        println!();
        println!("{}", answer);
    }
    if let Some(error) = error {
        eprintln!("answer unavailable: {}", error);
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
