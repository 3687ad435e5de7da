use search_cluster::config::WorkerConfig;
use search_cluster::worker::{Shutdown, WorkerAgent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let config = match WorkerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("Usage: {} {}", args[0], WorkerConfig::USAGE);
            eprintln!("Example: {} --id 1 --coordinator 127.0.0.1:7000", args[0]);
            std::process::exit(1);
        }
    };

    let agent = WorkerAgent::new(&config).await?;
    tracing::info!("Starting worker [{}]", agent.id());

    match agent.connect(config.coordinator_addr).await? {
        Shutdown::Exit => tracing::info!("Coordinator ordered worker [{}] to exit", agent.id()),
        Shutdown::Disconnected => {
            tracing::info!("Worker [{}] lost its coordinator, shutting down", agent.id())
        }
    }

    Ok(())
}
