//! Agent container entrypoint.
//!
//! Reads its configuration from the environment the task orchestrator
//! injects, runs one session to completion, and exits. Exit code 0 for
//! `success`/`stopped`, 1 otherwise.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use appforge_agent_loop::{CompressionConfig, CompressionMiddleware, GenaiProvider};
use appforge_contract::{FinishStatus, Framework};
use appforge_runtime::{run_session, RuntimeConfig, RuntimeDeps};
use appforge_store_adapters::{MemoryStore, PostgresStore};
use appforge_team::GraphConfig;

#[derive(Debug, Parser)]
#[command(name = "appforge-agent")]
struct Args {
    #[arg(long, env = "SESSION_ID")]
    session_id: String,

    #[arg(long, env = "WORKSPACE_ID")]
    workspace_id: String,

    /// Target framework: nextjs or fastapi-vite.
    #[arg(long, env = "FRAMEWORK")]
    framework: String,

    /// memory (local smoke runs) or database (production).
    #[arg(long, env = "RUN_MODE", default_value = "database")]
    run_mode: String,

    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Workspace mount point inside this container.
    #[arg(long, env = "WORKSPACE_ROOT", default_value = "/workspace")]
    workspace_root: PathBuf,

    /// Gateway base URL for protocol-peer tool callbacks.
    #[arg(long, env = "APPFORGE_API_URL")]
    api_url: Option<String>,

    /// Protocol-peer key (equals the session id).
    #[arg(long, env = "MGX_AGENT_API_KEY")]
    api_key: Option<String>,

    #[arg(long, env = "AGENT_MODEL", default_value = "gpt-4o")]
    model: String,

    /// Model used to summarise older turns when context budgets overflow.
    #[arg(long, env = "SUMMARY_MODEL", default_value = "gpt-4o-mini")]
    summary_model: String,

    #[arg(long, env = "TRACE_ID")]
    trace_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let framework: Framework = match args.framework.parse() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let deps = match args.run_mode.as_str() {
        "memory" => {
            let store = Arc::new(MemoryStore::new());
            RuntimeDeps {
                events: store.clone(),
                messages: store.clone(),
                stop: store,
                provider: Arc::new(GenaiProvider::default()),
                registry: appforge_tools::team_registry(),
            }
        }
        "database" => {
            let url = match args.database_url.as_deref() {
                Some(url) => url,
                None => {
                    eprintln!("DATABASE_URL is required in database mode");
                    std::process::exit(2);
                }
            };
            let store = match PostgresStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    eprintln!("store connect failed: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = store.ensure_schema().await {
                eprintln!("schema setup failed: {e}");
                std::process::exit(1);
            }
            RuntimeDeps {
                events: store.clone(),
                messages: store.clone(),
                stop: store,
                provider: Arc::new(GenaiProvider::default()),
                registry: appforge_tools::team_registry(),
            }
        }
        other => {
            eprintln!("unknown RUN_MODE: {other}");
            std::process::exit(2);
        }
    };

    let mut config = RuntimeConfig::new(&args.session_id, &args.workspace_id, framework);
    config.workspace_path = args.workspace_root;
    config.trace_id = args.trace_id;
    config.api_base = args.api_url;
    config.api_key = args.api_key;
    let mut graph = GraphConfig {
        model: args.model,
        ..GraphConfig::default()
    };
    graph.loop_config.compression = Some(Arc::new(CompressionMiddleware::new(
        CompressionConfig {
            summary_model: args.summary_model,
            ..CompressionConfig::default()
        },
    )));
    config.graph = graph;

    info!(
        session_id = %args.session_id,
        workspace_id = %args.workspace_id,
        framework = framework.as_str(),
        run_mode = %args.run_mode,
        "starting agent run"
    );

    let status = run_session(deps, config).await;
    match status {
        FinishStatus::Success | FinishStatus::Stopped => {}
        FinishStatus::Failed | FinishStatus::Timeout => std::process::exit(1),
    }
}
