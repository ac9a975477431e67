//! CLI driver: loads configuration, assembles the `Runtime`, and either
//! processes a single file, watches a directory, or prints cache/health
//! stats (`spec.md` §6, SPEC_FULL.md §4.11).
//!
//! Exit codes follow `spec.md` §6: `0` success, `1` configuration error,
//! `2` a document failed irrecoverably, `3` an unexpected panic/internal
//! error escaped the pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use docpipe::config::{self, Config, LogFormat};
use docpipe::embedding_cache::{EmbeddingCache, HttpEmbeddingProvider};
use docpipe::llm::ResponsesApiClient;
use docpipe::observability::{AlertManager, HealthRegistry, MetricsCollector};
use docpipe::pipeline::{Outcome, Pipeline, Runtime};
use docpipe::store::{DocumentStore, PgDocumentStore, SqliteDocumentStore};
use docpipe::vector_store::HttpVectorStoreClient;
use docpipe::PipelineError;
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "docpipe", about = "Content-addressed PDF ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch a directory for new PDFs and process each as it lands.
    Watch {
        directory: PathBuf,
    },
    /// Process a single file and print the outcome.
    Process {
        file: PathBuf,
    },
    /// Print embedding-cache and health-registry stats, then exit.
    Stats,
}

const LLM_BASE_URL_ENV: &str = "LLM_BASE_URL";
const VECTOR_STORE_BASE_URL_ENV: &str = "VECTOR_STORE_BASE_URL";
const EMBEDDING_BASE_URL_ENV: &str = "EMBEDDING_BASE_URL";
const PRICING_TABLE_PATH_ENV: &str = "PRICING_TABLE_PATH";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    let cli = Cli::parse();

    let runtime = match build_runtime(&config).await {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to assemble runtime: {err}");
            std::process::exit(1);
        }
    };

    let pipeline = Pipeline::new(runtime.clone());

    let exit_code = match cli.command {
        Command::Process { file } => run_process(&pipeline, file).await,
        Command::Watch { directory } => run_watch(&pipeline, directory).await,
        Command::Stats => run_stats(&runtime).await,
    };

    std::process::exit(exit_code);
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(config.log_level.as_filter_directive());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

async fn build_runtime(config: &Config) -> Result<Arc<Runtime>, PipelineError> {
    let config = Arc::new(config.clone());

    let store: Arc<dyn DocumentStore> = if config.db_url.starts_with("postgres") {
        Arc::new(PgDocumentStore::connect(&config.db_url).await?)
    } else {
        Arc::new(SqliteDocumentStore::connect(&config.db_url).await?)
    };

    let llm_base_url = std::env::var(LLM_BASE_URL_ENV)
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let llm = Arc::new(ResponsesApiClient::new(
        llm_base_url,
        config.llm_api_key.clone(),
        config.retry_policy(),
    ));

    let vector_store_base_url = std::env::var(VECTOR_STORE_BASE_URL_ENV)
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let vector_store = Arc::new(HttpVectorStoreClient::new(
        vector_store_base_url,
        config.llm_api_key.clone(),
        config.retry_policy(),
    ));

    let embedding_base_url = std::env::var(EMBEDDING_BASE_URL_ENV)
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let embedding_provider = Arc::new(HttpEmbeddingProvider::new(
        embedding_base_url,
        config.llm_api_key.clone(),
        config.retry_policy(),
    ));
    let embedding_pool = sqlx::SqlitePool::connect(&embedding_cache_db_url(&config.db_url))
        .await
        .map_err(|e| PipelineError::store(format!("embedding cache pool failed: {e}")))?;
    let embedding_cache = Arc::new(EmbeddingCache::new(
        embedding_pool,
        embedding_provider,
        10_000,
        config.vector_cache_ttl_days,
        config.batch_size,
    ));

    let pricing_table = match std::env::var(PRICING_TABLE_PATH_ENV) {
        Ok(path) => config::load_pricing_table_from_file(path)?,
        Err(_) => docpipe::cost::PricingTable::default(),
    };
    let pricing = Arc::new(pricing_table.with_overrides(
        &config.llm_model,
        config.prompt_price_override,
        config.cached_price_override,
        config.output_price_override,
    ));

    let metrics = Arc::new(MetricsCollector::new(10_000));
    let alerts = Arc::new(AlertManager::with_default_window());
    let health = Arc::new(HealthRegistry::new());

    let runtime = Runtime::new(
        config, store, llm, vector_store, embedding_cache, pricing, metrics, alerts, health,
    )
    .await?;

    Ok(Arc::new(runtime))
}

/// The embedding cache's durable tier lives in the same database as
/// `Document` rows; only SQLite dev setups need a distinct connection
/// string carved out (Postgres `DocumentStore` and the cache's SQLite pool
/// are intentionally allowed to diverge in dev).
fn embedding_cache_db_url(db_url: &str) -> String {
    if db_url.starts_with("postgres") {
        "sqlite://embeddings.db?mode=rwc".to_string()
    } else {
        db_url.to_string()
    }
}

async fn run_process(pipeline: &Pipeline, file: PathBuf) -> i32 {
    match pipeline.process(file.clone()).await {
        Ok(Outcome::Completed(doc)) => {
            println!("completed: id={:?} doc_type={:?}", doc.id, doc.doc_type);
            0
        }
        Ok(Outcome::Duplicate { doc_id }) => {
            println!("duplicate: existing id={doc_id}");
            0
        }
        Ok(Outcome::VectorUploadFailed(doc)) => {
            println!("completed with vector upload failed: id={:?}", doc.id);
            0
        }
        Err(err) => {
            eprintln!("document failed: {err}");
            2
        }
    }
}

async fn run_watch(pipeline: &Pipeline, directory: PathBuf) -> i32 {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

    let watcher_result = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            if event.kind.is_create() || event.kind.is_modify() {
                for path in event.paths {
                    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("pdf")) {
                        let _ = tx.send(path);
                    }
                }
            }
        }
    });

    let mut watcher = match watcher_result {
        Ok(watcher) => watcher,
        Err(err) => {
            eprintln!("failed to start directory watcher: {err}, falling back to polling");
            return run_poll(pipeline, directory).await;
        }
    };

    if let Err(err) = watcher.watch(&directory, RecursiveMode::NonRecursive) {
        eprintln!("failed to watch {}: {err}, falling back to polling", directory.display());
        return run_poll(pipeline, directory).await;
    }

    println!("watching {} for new PDFs", directory.display());
    while let Some(path) = rx.recv().await {
        let outcome = pipeline.process(path.clone()).await;
        log_watch_outcome(&path, outcome);
    }
    0
}

/// Polling fallback for filesystems where `notify`'s native backend is
/// unavailable (e.g. some container/network mounts).
async fn run_poll(pipeline: &Pipeline, directory: PathBuf) -> i32 {
    let mut seen = std::collections::HashSet::new();
    println!("polling {} for new PDFs every 5s", directory.display());
    loop {
        let mut entries = match tokio::fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(err) => {
                eprintln!("failed to read {}: {err}", directory.display());
                return 2;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("pdf")) && seen.insert(path.clone()) {
                let outcome = pipeline.process(path.clone()).await;
                log_watch_outcome(&path, outcome);
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

fn log_watch_outcome(path: &PathBuf, outcome: Result<Outcome, PipelineError>) {
    match outcome {
        Ok(result) => println!("{}: {:?}", path.display(), result.doc_id()),
        Err(err) => eprintln!("{}: failed: {err}", path.display()),
    }
}

async fn run_stats(runtime: &Runtime) -> i32 {
    let stats = runtime.embedding_cache.stats();
    println!(
        "embedding cache: {} requests, {:.1}% hit rate ({} memory, {} persistent, {} remote)",
        stats.total_requests,
        stats.overall_hit_rate() * 100.0,
        stats.memory_hits,
        stats.persistent_hits,
        stats.remote_calls,
    );
    println!("health: {:?}", runtime.health.overall());
    0
}
