use clap::Parser;
use plover::{Registry, registry::DEFAULT_PATH};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:9999")]
    pub addr: std::net::SocketAddr,

    /// HTTP path serving the server list.
    #[arg(long, default_value = DEFAULT_PATH)]
    pub path: String,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let registry = Registry::new(&args.path);
    let addr = registry.serve(args.addr).await.unwrap();
    tracing::info!("Registry on http://{addr}{}", registry.path());

    registry.join().await
}
