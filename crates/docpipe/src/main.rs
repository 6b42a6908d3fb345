use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use docpipe::audit::{Auditor, SqliteAuditSink, TracingAuditSink};
use docpipe::chunking::counter_by_name;
use docpipe::config::{
    default_config_path, load_config_or_default, resolve_database_path, AuditSinkKind, Config,
};
use docpipe::db::Database;
use docpipe::document::NewDocument;
use docpipe::error::{ConfigError, DocpipeError, PipelineError, WorkerError};
use docpipe::extraction::{is_supported_media_type, PdfExtractor};
use docpipe::logging::{init_logging, LogFormat};
use docpipe::pipeline::{Pipeline, PipelineConfig};
use docpipe::service;
use docpipe::worker::{shutdown_channel, SqliteConnector, WorkerPool};

/// docpipe: durable document ingestion. Uploads are queued as jobs and
/// turned into token-bounded text chunks by one or more worker processes.
#[derive(Parser)]
#[command(name = "docpipe", version, about)]
struct Cli {
    /// Path to the JSON configuration file. Defaults to
    /// `~/.docpipe/config.json`; a missing file means built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and a default config file if absent.
    Init,

    /// Register a local file as an uploaded document and queue it.
    Submit {
        /// File to ingest.
        path: PathBuf,

        /// Uploader ID recorded as the document owner.
        #[arg(long)]
        owner: String,

        /// Document title. Defaults to the file stem.
        #[arg(long)]
        title: Option<String>,

        /// Declared media type. Guessed from the extension when omitted.
        #[arg(long)]
        mime_type: Option<String>,
    },

    /// Run ingestion workers until interrupted.
    Worker {
        /// Number of job slots in this process (overrides config).
        #[arg(long)]
        slots: Option<usize>,
    },

    /// Show a job's current state.
    Status {
        job_id: String,
    },

    /// List dead-lettered jobs, most recently updated first.
    Dead {
        #[arg(long, default_value_t = service::DEAD_JOB_LIMIT)]
        limit: u32,
    },

    /// Reset a DEAD job so workers pick it up again.
    Retry {
        job_id: String,

        /// Administrator performing the reset.
        #[arg(long)]
        actor: String,
    },

    /// Print the stored chunks of a document.
    Chunks {
        document_id: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    if let Err(e) = run(cli) {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> docpipe::Result<()> {
    let config_path = cli.config.clone().or_else(default_config_path);
    let config = match &config_path {
        Some(path) => load_config_or_default(path)?,
        None => Config::default(),
    };
    let db_path = resolve_database_path(&config)?;

    match cli.command {
        Commands::Init => init(&config, config_path.as_deref(), &db_path),
        Commands::Submit {
            path,
            owner,
            title,
            mime_type,
        } => {
            let db = Database::open(&db_path)?;
            let auditor = build_auditor(&config, &db_path);
            let upload = describe_upload(&path, owner, title, mime_type)?;
            let submission = service::submit_upload(&db, &auditor, &upload, config.retry.max_attempts)?;
            print_json(&submission)
        }
        Commands::Worker { slots } => run_workers(config, &db_path, slots),
        Commands::Status { job_id } => {
            let db = Database::open(&db_path)?;
            print_json(&service::job_status(&db, &job_id)?)
        }
        Commands::Dead { limit } => {
            let db = Database::open(&db_path)?;
            print_json(&service::dead_jobs(&db, limit)?)
        }
        Commands::Retry { job_id, actor } => {
            let db = Database::open(&db_path)?;
            let auditor = build_auditor(&config, &db_path);
            print_json(&service::retry_dead_job(&db, &auditor, &job_id, &actor)?)
        }
        Commands::Chunks { document_id } => {
            let db = Database::open(&db_path)?;
            print_json(&service::document_chunks(&db, &document_id)?)
        }
    }
}

fn init(config: &Config, config_path: Option<&Path>, db_path: &Path) -> docpipe::Result<()> {
    Database::open(db_path)?;
    println!("Database ready at {}", db_path.display());

    if let Some(path) = config_path {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DocpipeError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            let json = serde_json::to_string_pretty(config)?;
            std::fs::write(path, json).map_err(|e| DocpipeError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}

fn describe_upload(
    path: &Path,
    owner: String,
    title: Option<String>,
    mime_type: Option<String>,
) -> docpipe::Result<NewDocument> {
    let io_err = |e| DocpipeError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let absolute = path.canonicalize().map_err(io_err)?;
    let size_bytes = std::fs::metadata(&absolute).map_err(io_err)?.len();

    let mime_type = mime_type.unwrap_or_else(|| {
        mime_guess::from_path(&absolute)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    });
    if !is_supported_media_type(&mime_type) {
        return Err(PipelineError::UnsupportedMediaType(mime_type).into());
    }

    let file_name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let title = title.unwrap_or_else(|| {
        absolute
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.clone())
    });

    Ok(NewDocument {
        owner_id: owner,
        title,
        file_name,
        file_path: absolute.display().to_string(),
        mime_type,
        size_bytes,
    })
}

fn build_auditor(config: &Config, db_path: &Path) -> Auditor {
    match config.audit.sink {
        AuditSinkKind::Database => Auditor::new(Arc::new(SqliteAuditSink::at_path(db_path))),
        AuditSinkKind::Log => Auditor::new(Arc::new(TracingAuditSink)),
    }
}

fn run_workers(mut config: Config, db_path: &Path, slots: Option<usize>) -> docpipe::Result<()> {
    if let Some(slots) = slots {
        if slots == 0 {
            return Err(ConfigError::Validation {
                message: "--slots must be at least 1".to_string(),
            }
            .into());
        }
        config.worker.slots = slots;
    }

    let counter = counter_by_name(&config.chunking.token_counter)
        .map_err(|message| ConfigError::Validation { message })?;
    let auditor = build_auditor(&config, db_path);
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(PipelineConfig::from_config(&config)),
        Arc::new(PdfExtractor::new()),
        Arc::from(counter),
        auditor.clone(),
    ));

    let (trigger, signal) = shutdown_channel();
    ctrlc::set_handler(move || {
        info!("Shutdown requested, finishing in-flight jobs...");
        trigger.trigger();
    })
    .map_err(|e| WorkerError::SignalHandler(e.to_string()))?;

    info!("docpipe worker v{} starting", env!("CARGO_PKG_VERSION"));
    let pool = WorkerPool::start(
        config.worker.clone(),
        pipeline,
        Arc::new(SqliteConnector::new(db_path)),
        auditor,
        signal,
    )?;
    info!("{} worker slot(s) running", pool.slots());
    let stats = pool.wait();
    info!(
        "Worker exited: {} completed, {} retried, {} dead, {} unrecorded",
        stats.completed, stats.retried, stats.dead, stats.unrecorded
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> docpipe::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
