use anyhow::Context;
use search_cluster::cluster::handlers::router;
use search_cluster::cluster::registry::Registry;
use search_cluster::cluster::session::{serve_clients, serve_workers};
use search_cluster::config::CoordinatorConfig;
use std::future::IntoFuture;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let config = match CoordinatorConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("Usage: {} {}", args[0], CoordinatorConfig::USAGE);
            eprintln!("Example: {} --workers 0.0.0.0:7000 --http 0.0.0.0:8080", args[0]);
            std::process::exit(1);
        }
    };

    tracing::info!("Starting coordinator with {:?}", config.timings);

    // 1. Registry (owns all cluster state):
    let cluster = Registry::spawn(config.timings.clone());

    // 2. Listeners:
    let workers = TcpListener::bind(config.worker_addr)
        .await
        .with_context(|| format!("failed to bind node listener on {}", config.worker_addr))?;
    let clients = TcpListener::bind(config.client_addr)
        .await
        .with_context(|| format!("failed to bind client listener on {}", config.client_addr))?;
    let http = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_addr))?;

    let worker_server = tokio::spawn(serve_workers(workers, cluster.clone(), config.timings.clone()));
    let client_server = tokio::spawn(serve_clients(clients, cluster.clone()));

    // 3. Stats reporter:
    let stats = cluster.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            let Ok(nodes) = stats.nodes().await else {
                return;
            };
            tracing::info!("Cluster stats: {} connected nodes", nodes.len());
            for node in nodes {
                tracing::info!(
                    "  - node {} disk={} memory={}",
                    node.name,
                    node.chunks.len(),
                    node.memory.len()
                );
            }
        }
    });

    // 4. HTTP server:
    tracing::info!("HTTP server listening on {}", config.http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let app = router(cluster);
    tokio::select! {
        result = worker_server => result??,
        result = client_server => result??,
        result = axum::serve(http, app).into_future() => result?,
    }

    Ok(())
}
