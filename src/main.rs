use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use rpi_engine::db::{self, repos::sessions as session_repo, SqliteSessionStore};
use rpi_engine::engine::provider::openai::OpenAiProvider;
use rpi_engine::{AppError, Engine, ProgressEvent, RunConfig, Session, Settings};

/// Recursive prompt improvement runner
#[derive(Parser)]
#[command(name = "rpi")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory holding the session database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit JSON-lines logs instead of the compact format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a config file and print the session summary
    Run {
        /// Run config (JSON)
        config: PathBuf,
        /// Do not persist the session
        #[arg(long)]
        no_save: bool,
    },
    /// List stored sessions, newest first
    List {
        #[arg(short, long)]
        search: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Write a stored session to a JSON file
    Export {
        id: String,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Store a previously exported session under a new id
    Import { file: PathBuf },
    /// Delete one stored session
    Delete { id: String },
}

fn main() {
    // Initialize Sentry before anything else so panics during startup are captured.
    // Returns a no-op guard when SENTRY_DSN is absent.
    let _sentry_guard = sentry::init(sentry_options());
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if cli.json_logs || std::env::var("RPI_LOG_FORMAT").is_ok_and(|v| v == "json") {
        rpi_engine::logging::init_json();
    } else {
        rpi_engine::logging::init();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(dispatch(cli)) {
        tracing::error!(kind = e.kind(), "{e}");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), AppError> {
    let data_dir = cli.db.clone().unwrap_or_else(db::default_data_dir);

    match cli.command {
        Command::Run { config, no_save } => {
            let settings = Settings::load(cli.settings.as_deref())?;
            let store = if no_save {
                None
            } else {
                Some(SqliteSessionStore::new(db::init_db(&data_dir)?))
            };
            run(&config, settings, store).await
        }
        Command::List { search, limit } => {
            let pool = db::init_db(&data_dir)?;
            for session in session_repo::list(&pool, search.as_deref(), Some(limit))? {
                let last = session.summary.iterations.last();
                println!(
                    "{}  {}  {:<9}  {:>3} iter  ai {:>5.1}  {}",
                    session.id,
                    format_timestamp(session.timestamp),
                    session.status.as_str(),
                    session.tests.len(),
                    last.map(|i| i.avg_ai_score).unwrap_or(0.0),
                    session.core_model.label(),
                );
            }
            Ok(())
        }
        Command::Export { id, out } => {
            let pool = db::init_db(&data_dir)?;
            let session = session_repo::get_by_id(&pool, &id)?;
            let path = out.join(session.export_file_name());
            std::fs::write(&path, session.export_json()?)?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Import { file } => {
            let pool = db::init_db(&data_dir)?;
            let raw = std::fs::read_to_string(&file)?;
            let session = Session::import_json(&raw)?;
            session_repo::save(&pool, &session)?;
            println!("{}", session.id);
            Ok(())
        }
        Command::Delete { id } => {
            let pool = db::init_db(&data_dir)?;
            if !session_repo::delete(&pool, &id)? {
                return Err(AppError::NotFound(format!("Session {id}")));
            }
            Ok(())
        }
    }
}

async fn run(
    config_path: &Path,
    settings: Settings,
    store: Option<SqliteSessionStore>,
) -> Result<(), AppError> {
    let raw = std::fs::read_to_string(config_path)?;
    let config: RunConfig = serde_json::from_str(&raw)?;

    let provider = Arc::new(OpenAiProvider::new(&settings.provider)?);
    let mut engine = Engine::new(provider).with_settings(settings.engine);
    if let Some(store) = store {
        engine = engine.with_store(Arc::new(store));
    }

    let mut handle = engine.start(config)?;
    tracing::info!(run_id = %handle.id(), "Run started");

    let stop = handle.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping run");
            stop.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        log_event(&event);
    }

    let session = handle.wait().await?;
    let summary = serde_json::json!({
        "id": session.id,
        "status": session.status,
        "error": session.error,
        "output": session.output.last(),
        "summary": session.summary,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn log_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::IterationStarted { index } => {
            tracing::info!(iteration = index, "Iteration started");
        }
        ProgressEvent::TestCompleted {
            iteration,
            pair_index,
            result,
        } => {
            tracing::info!(
                iteration,
                pair = pair_index,
                is_equal = result.is_equal,
                similarity = result.similarity,
                ai_score = result.ai_score,
                "Test completed"
            );
            for warning in &result.warnings {
                tracing::warn!(iteration, pair = pair_index, "{warning}");
            }
        }
        ProgressEvent::ImprovementProduced {
            iteration,
            instructions,
        } => {
            tracing::info!(iteration, chars = instructions.len(), "Instructions improved");
        }
        ProgressEvent::RunCompleted { .. } => tracing::info!("Run completed"),
        ProgressEvent::RunAborted { .. } => tracing::warn!("Run aborted"),
        ProgressEvent::RunFailed { error, .. } => tracing::error!(%error, "Run failed"),
    }
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

fn sentry_options() -> sentry::ClientOptions {
    sentry::ClientOptions {
        dsn: option_env!("SENTRY_DSN").and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        before_send: Some(Arc::new(|mut event| {
            if let Some(ref mut user) = event.user {
                user.email = None;
                user.ip_address = None;
                user.username = None;
            }
            if let Some(ref mut request) = event.request {
                request.data = None;
            }
            // Prompts and model output can carry user data.
            event.extra.remove("instructions");
            Some(event)
        })),
        ..Default::default()
    }
}
