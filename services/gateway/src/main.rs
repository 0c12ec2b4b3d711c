use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use expr::ExpressionCache;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fix_gateway::broker::BrokerClient;
use fix_gateway::http;
use fix_gateway::supervisor::Supervisor;
use fix_gateway::test_utils::MemoryBroker;

/// FIX message gateway: routes FIX payloads between a broker log and FIX
/// endpoints.
#[derive(Debug, Parser)]
#[command(name = "fix-gateway", version)]
struct Args {
    /// Routing configuration file. Falls back to FIX_ROUTING_CONFIG_PATH,
    /// fix.routing.config.path, then the packaged default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address for the HTTP introspection surface.
    #[arg(long, default_value = "127.0.0.1:8080")]
    http_addr: SocketAddr,

    /// Run against the embedded in-process broker. External broker clients
    /// plug in behind the broker traits; none is wired in this build.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    embedded_broker: bool,

    /// Bound on draining in-flight dispatches at shutdown, seconds.
    #[arg(long, default_value_t = 30)]
    shutdown_deadline_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if let Err(error) = run(args).await {
        error!("{error:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let expressions = Arc::new(ExpressionCache::new());
    let table = Arc::new(
        routing::load(args.config.as_deref(), &expressions)
            .context("loading routing configuration")?,
    );

    let broker: Arc<dyn BrokerClient> = if args.embedded_broker {
        info!("using embedded in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        anyhow::bail!(
            "no external broker client is wired in this build; run with --embedded-broker"
        );
    };

    let supervisor = Supervisor::start(Arc::clone(&table), broker, expressions)
        .await
        .context("starting supervisor")?;

    let router = http::build_router(Arc::clone(&table));
    let http_listener = tokio::net::TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("binding http listener on {}", args.http_addr))?;
    info!(addr = %args.http_addr, "http introspection listening");

    tokio::select! {
        served = axum::serve(http_listener, router) => {
            served.context("http server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    supervisor
        .shutdown(Duration::from_secs(args.shutdown_deadline_secs))
        .await;
    Ok(())
}
