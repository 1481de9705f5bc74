use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use agent_dispatch::api::api_routes;
use agent_dispatch::config::{CoordinatorConfig, RouteTable, ServerConfig};
use agent_dispatch::coordinator::Coordinator;
use agent_dispatch::error::HandlerError;
use agent_dispatch::task::{Payload, Task};
use agent_dispatch::worker::{HandlerRegistry, handler_fn};

/// Upper bound for the `sleep` handler.
const MAX_SLEEP_MS: u64 = 60_000;

fn system_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            "echo",
            handler_fn(|task: Task| async move { Ok(task.payload) }),
        )
        .with(
            "sleep",
            handler_fn(|task: Task| async move {
                let ms = task
                    .payload
                    .get("ms")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| HandlerError::invalid_payload("sleep", "missing integer 'ms'"))?
                    .min(MAX_SLEEP_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let mut result = Payload::new();
                result.insert("slept_ms".into(), json!(ms));
                Ok::<_, HandlerError>(result)
            }),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = ServerConfig::from_env().context("Invalid server configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit.
    let (file_layer, _log_guard) = match &server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    let config = CoordinatorConfig::from_env().context("Invalid coordinator configuration")?;
    let routes = RouteTable::from_env().context("Invalid AGENT_DISPATCH_ROUTES")?;

    eprintln!("📬 Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/tasks", server.port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws", server.port);
    eprintln!(
        "   Ledger: max {} tasks, retention {}h",
        config.max_tasks,
        config.retention.as_secs() / 3600
    );
    if let Some(dir) = &server.log_dir {
        eprintln!("   Logs: {}", dir.display());
    }

    let coordinator = Coordinator::builder(config)
        .worker("system", "system", system_handlers())
        .routes(routes)
        .build();
    coordinator.start();

    let app = api_routes(Arc::clone(&coordinator));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
        .context("API server failed")?;

    tracing::info!("Shutting down");
    coordinator.shutdown().await;
    Ok(())
}
