use clap::Parser;
use plover::{Router, Server, ServerConfig};
use plover_demo::{Foo, FooImpl};
use std::{sync::Arc, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:8000")]
    pub addr: std::net::SocketAddr,

    /// Registry url to announce this server to.
    #[arg(long)]
    pub registry: Option<String>,

    /// Address announced to the registry, defaults to the listen address.
    #[arg(long)]
    pub advertise: Option<String>,

    /// Seconds between two announcements.
    #[arg(long, default_value = "10")]
    pub heartbeat_secs: u64,

    /// Milliseconds a connection waits for one handler.
    #[arg(long, default_value = "1000")]
    pub handle_timeout_ms: u64,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let demo = Arc::new(FooImpl::default());
    let mut router = Router::default();
    demo.plover_export(&mut router).unwrap();
    let server = Server::create(
        router,
        &ServerConfig {
            handle_timeout: Duration::from_millis(args.handle_timeout_ms),
        },
    );

    let addr = server.listen(args.addr).await.unwrap();
    tracing::info!(
        "Serving {:?} on {}...",
        server.router().method_names(),
        addr.to_string()
    );

    if let Some(registry) = &args.registry {
        let advertise = args.advertise.clone().unwrap_or_else(|| addr.to_string());
        server.start_heartbeat(
            registry,
            &advertise,
            Duration::from_secs(args.heartbeat_secs),
        );
    }

    server.join().await
}
