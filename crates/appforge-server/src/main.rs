use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use appforge_server::auth::AuthConfig;
use appforge_server::dev_containers::DevContainers;
use appforge_server::state::{AppState, StreamSettings};
use appforge_store_adapters::PostgresStore;
use appforge_taskd::TaskBroker;

#[derive(Debug, Parser)]
#[command(name = "appforge-server")]
struct Args {
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// JWKS document URL for bearer-token validation; omit for
    /// single-tenant local mode.
    #[arg(long, env = "JWKS_URL")]
    jwks_url: Option<String>,

    /// SSE poll interval in milliseconds.
    #[arg(long, env = "SSE_POLL_MS", default_value_t = 500)]
    sse_poll_ms: u64,

    /// SSE connection timeout in seconds.
    #[arg(long, env = "SSE_IDLE_SECS", default_value_t = 300)]
    sse_idle_secs: u64,
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

    let store = match PostgresStore::connect(&args.database_url).await {
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

    let broker = match TaskBroker::connect(&args.nats_url).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("broker connect failed: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = broker.ensure_stream().await {
        eprintln!("broker stream setup failed: {e}");
        std::process::exit(1);
    }

    let auth = match &args.jwks_url {
        Some(url) => match AuthConfig::from_jwks_url(url).await {
            Ok(auth) => {
                info!(jwks_url = %url, "bearer auth enabled");
                auth
            }
            Err(e) => {
                eprintln!("jwks setup failed: {e}");
                std::process::exit(1);
            }
        },
        None => {
            warn!("no JWKS_URL set; running in single-tenant local mode");
            AuthConfig::Disabled
        }
    };

    let dev = match DevContainers::connect() {
        Ok(dev) => Some(Arc::new(dev)),
        Err(e) => {
            warn!(error = %e, "container engine unreachable; internal exec endpoints disabled");
            None
        }
    };

    let state = AppState {
        events: store.clone(),
        messages: store.clone(),
        sessions: store.clone(),
        stop: store,
        tasks: Arc::new(broker),
        auth: Arc::new(auth),
        dev,
        stream: StreamSettings {
            poll_interval: std::time::Duration::from_millis(args.sse_poll_ms),
            idle_timeout: std::time::Duration::from_secs(args.sse_idle_secs),
            ..Default::default()
        },
    };

    let app = appforge_server::router(state);

    let listener = match tokio::net::TcpListener::bind(&args.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", args.http_addr);
            std::process::exit(1);
        }
    };
    info!(addr = %args.http_addr, "gateway listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    {
        eprintln!("http server crashed: {e}");
        std::process::exit(1);
    }
}
