use clap::{Parser, Subcommand};
use registry_ingest::broker::{BatchStream, InMemoryBroker, RedisBroker};
use registry_ingest::config::Config;
use registry_ingest::consumer::run_consumer;
use registry_ingest::reconciler::Reconciler;
use registry_ingest::registry::InMemoryRegistry;
use registry_ingest::{logging, metrics, server};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "registry_ingest")]
#[command(about = "Device registration ingest API and registry worker")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP ingest API
    Serve {
        /// Port to listen on (overrides APP_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the broker consumer and registry reconciler
    Worker {
        /// Consumer name within the group (defaults to worker-<pid>)
        #[arg(long)]
        consumer: Option<String>,
    },
    /// Run API and worker in one process against an in-memory broker
    Run {
        /// Port to listen on (overrides APP_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();
    metrics::init_metrics();

    let config = Config::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            println!("🔄 Starting ingest API...");
            let broker = Arc::new(RedisBroker::new(
                &config.redis_url,
                &config.stream_key,
                &config.consumer_group,
            )?);
            let port = port.unwrap_or(config.app_port);
            server::start_server(broker, config.max_body_size, &config.app_host, port)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        Commands::Worker { consumer } => {
            let broker = Arc::new(RedisBroker::new(
                &config.redis_url,
                &config.stream_key,
                &config.consumer_group,
            )?);
            // The relational registry backend is deployment-specific; the
            // in-memory store stands in until one is wired up.
            let store = Arc::new(InMemoryRegistry::new());
            let reconciler = Arc::new(Reconciler::new(store));
            let name = consumer.unwrap_or_else(|| format!("worker-{}", std::process::id()));
            println!(
                "🔨 Worker '{}' consuming '{}' in group '{}'",
                name, config.stream_key, config.consumer_group
            );
            run_consumer(broker, reconciler, &name).await?;
        }
        Commands::Run { port } => {
            println!("🚀 Running combined API + worker (in-memory broker)...");
            let broker = Arc::new(InMemoryBroker::new());
            let store = Arc::new(InMemoryRegistry::new());
            let reconciler = Arc::new(Reconciler::new(store));
            let stream: Arc<dyn BatchStream> = broker.clone();
            let worker =
                tokio::spawn(async move { run_consumer(stream, reconciler, "worker-local").await });
            let port = port.unwrap_or(config.app_port);
            let result =
                server::start_server(broker, config.max_body_size, &config.app_host, port).await;
            worker.abort();
            result.map_err(|e| anyhow::anyhow!("{}", e))?;
        }
    }
    Ok(())
}
