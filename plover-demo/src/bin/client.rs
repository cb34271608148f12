use clap::Parser;
use plover::*;
use plover_demo::{Args as SumArgs, Foo};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server addresses. More than one switches to load balanced calls.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addrs: Vec<String>,

    /// Registry url to discover servers from.
    #[arg(long)]
    pub registry: Option<String>,

    /// Server selection when several servers are known.
    #[arg(long, default_value = "random")]
    pub mode: SelectMode,

    /// Wire codec.
    #[arg(long, default_value = "msgpack")]
    pub codec: CodecType,

    /// Per call timeout in milliseconds.
    #[arg(long, default_value = "1000")]
    pub timeout_ms: u64,

    /// Seconds each `Foo.Sum` handler sleeps.
    #[arg(long, default_value = "0.5")]
    pub handle_time: f32,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args, client: Arc<XClient>) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let secs = args.secs;
    let mut tasks = vec![];
    for i in 0..args.coroutines {
        let state = state.clone();
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = Context::background();
            let mut value = i as i64;
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = client.double(&ctx, &value).await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                    value = value.wrapping_add(1) % 1_000_000;
                }
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                task.await.unwrap();
            }
        } => {
        }
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {
        }
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let config = XClientConfig {
        mode: args.mode,
        poll_interval: Duration::from_secs(5),
        registry: args.registry.clone(),
        client: ClientConfig {
            codec: args.codec,
            ..Default::default()
        },
        ..Default::default()
    };
    let client = Arc::new(XClient::new(&config));
    if args.registry.is_none() {
        let dialed = client.dial_servers(&args.addrs).await;
        tracing::info!("connected to {dialed} of {} servers", args.addrs.len());
    } else {
        // give discovery one round.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    if args.stress {
        stress_test(args, client).await;
        return;
    }

    let ctx = Context::background();
    let rsp = client.double(&ctx, &21).await;
    tracing::info!("double rsp: {:?}", rsp);

    // the first calls fit in the timeout, the later ones don't.
    for (i, handle_time) in [args.handle_time, args.handle_time * 4.0].into_iter().enumerate() {
        let sum = SumArgs {
            num1: i as i64,
            num2: i as i64 * 2,
            handle_time,
        };
        let ctx = ctx.with_timeout(Duration::from_millis(args.timeout_ms));
        let rsp = client.sum(&ctx, &sum).await;
        tracing::info!("sum({}, {}) after {handle_time}s: {:?}", sum.num1, sum.num2, rsp);
    }

    client.close().await;
}
