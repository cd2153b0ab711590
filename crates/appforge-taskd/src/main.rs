//! Worker binary.
//!
//! Thin shim: pulls tasks from the broker and hands each to the task
//! orchestrator. Also owns the periodic TTL sweep over events and messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use appforge_contract::clock::monotonic_now;
use appforge_contract::storage::{EventStore, MessageStore};
use appforge_store_adapters::PostgresStore;
use appforge_taskd::{DockerControl, OrchestratorConfig, TaskBroker, TaskOrchestrator};

#[derive(Debug, Parser)]
#[command(name = "appforge-taskd")]
struct Args {
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Durable consumer name; one per worker pool.
    #[arg(long, env = "WORKER_NAME", default_value = "appforge-worker")]
    worker_name: String,

    #[arg(long, env = "AGENT_IMAGE", default_value = "appforge-agent:latest")]
    agent_image: String,

    /// Host directory holding one subdirectory per workspace id.
    #[arg(long, env = "HOST_WORKSPACES_ROOT", default_value = "/var/lib/appforge/workspaces")]
    host_workspaces_root: String,

    #[arg(long, env = "AGENT_NETWORK")]
    agent_network: Option<String>,

    /// Gateway base URL injected into agent containers.
    #[arg(long, env = "APPFORGE_API_URL", default_value = "http://127.0.0.1:8080/api")]
    api_url: String,

    #[arg(long, env = "TASK_TIMEOUT_SECS", default_value_t = 1800)]
    task_timeout_secs: u64,

    /// Event retention in days.
    #[arg(long, env = "EVENT_TTL_DAYS", default_value_t = 7)]
    event_ttl_days: u64,

    /// Message retention in days; messages outlive events.
    #[arg(long, env = "MESSAGE_TTL_DAYS", default_value_t = 30)]
    message_ttl_days: u64,
}

/// Environment keys forwarded into agent containers when present.
const PASSTHROUGH_KEYS: &[&str] = &[
    "OPENAI_API_KEY",
    "OPENAI_BASE_URL",
    "ANTHROPIC_API_KEY",
    "AGENT_MODEL",
    "TRACE_ID",
];

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
            error!(error = %e, "store connect failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = store.ensure_schema().await {
        error!(error = %e, "schema setup failed");
        std::process::exit(1);
    }

    let broker = match TaskBroker::connect(&args.nats_url).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "broker connect failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = broker.ensure_stream().await {
        error!(error = %e, "broker stream setup failed");
        std::process::exit(1);
    }

    let control = match DockerControl::connect() {
        Ok(control) => control,
        Err(e) => {
            error!(error = %e, "docker connect failed");
            std::process::exit(1);
        }
    };

    let mut passthrough_env = HashMap::new();
    for key in PASSTHROUGH_KEYS {
        if let Ok(value) = std::env::var(key) {
            passthrough_env.insert(key.to_string(), value);
        }
    }

    let mut config = OrchestratorConfig::new(&args.database_url, &args.api_url);
    config.image = args.agent_image.clone();
    config.host_workspaces_root = args.host_workspaces_root.clone();
    config.network = args.agent_network.clone();
    config.task_timeout = Duration::from_secs(args.task_timeout_secs);
    config.passthrough_env = passthrough_env;

    let orchestrator = Arc::new(TaskOrchestrator::new(
        control,
        store.clone(),
        store.clone(),
        store.clone(),
        config,
    ));

    // TTL sweep: hourly purge of expired events and messages.
    {
        let store = store.clone();
        let event_ttl = Duration::from_secs(args.event_ttl_days * 24 * 3600);
        let message_ttl = Duration::from_secs(args.message_ttl_days * 24 * 3600);
        tokio::spawn(async move {
            loop {
                let now = monotonic_now();
                match EventStore::purge_expired(store.as_ref(), now - event_ttl.as_secs_f64())
                    .await
                {
                    Ok(purged) if purged > 0 => info!(purged, "expired events purged"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "event purge failed"),
                }
                match MessageStore::purge_expired(
                    store.as_ref(),
                    now - message_ttl.as_secs_f64(),
                )
                .await
                {
                    Ok(purged) if purged > 0 => info!(purged, "expired messages purged"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "message purge failed"),
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    }

    info!(worker = %args.worker_name, "worker ready, consuming tasks");
    let consume = broker
        .consume(&args.worker_name, |task| {
            let orchestrator = orchestrator.clone();
            async move {
                match orchestrator.execute(&task).await {
                    Ok(result) => info!(
                        session_id = %result.session_id,
                        status = result.status.as_str(),
                        reason = result.reason.as_deref().unwrap_or(""),
                        "task finished"
                    ),
                    Err(e) => error!(session_id = %task.session_id, error = %e, "task failed"),
                }
            }
        })
        .await;

    if let Err(e) = consume {
        error!(error = %e, "consumer stopped");
        std::process::exit(1);
    }
}
