use async_chunks::{
    fetch::HttpFetcher,
    Config,
    DeliveryMode,
    Engine,
    Outcome,
};
use clap::Parser;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::runtime::Builder;
use tracing_subscriber::EnvFilter;


/// Fetch a batch of seeded images across a worker pool.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Number of images to fetch
    #[arg(long, default_value_t = 80)]
    count: usize,

    /// Publish a snapshot per finished chunk instead of one at the end
    #[arg(long)]
    incremental: bool,

    /// Fixed pool size (defaults to the host's logical CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds to wait for all chunks before failing the stragglers
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn image_urls(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("https://picsum.photos/seed/{}/1080/1920", (i * 7919) % 10_000))
        .collect()
}

fn render(outcomes: &[Outcome<async_chunks::fetch::Blob>]) -> String {
    outcomes
        .iter()
        .map(|outcome| match outcome {
            Outcome::Pending => '.',
            Outcome::Success(_) => '#',
            Outcome::Failed => 'x',
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mode = if args.incremental {
        DeliveryMode::Incremental
    } else {
        DeliveryMode::Batch
    };
    let config = Config::default()
        .with_delivery_mode(mode)
        .with_pool_size_override(args.workers)
        .with_completion_timeout(Duration::from_secs(args.timeout));

    let rt = Builder::new_multi_thread().enable_all().build()?;

    rt.block_on(async {
        let now = Instant::now();
        let engine = Engine::new(HttpFetcher::new(), config)?;
        let mut snapshots = engine.submit(image_urls(args.count))?;

        while let Some(snapshot) = snapshots.next().await {
            println!(
                "[{:>8.2?}] {} {}/{} ready",
                now.elapsed(),
                render(snapshot.outcomes()),
                snapshot.succeeded(),
                snapshot.len(),
            );
        }

        let metrics = engine.metrics();
        println!(
            "workers: {}, success rate: {:.1}%, elapsed: {:?}",
            metrics.workers,
            metrics.success_rate() * 100.0,
            now.elapsed()
        );
        engine.dispose();
        Ok::<_, anyhow::Error>(())
    })
}
