use clap::Parser;
use futures::StreamExt;
use log::Level;
use rankpool::comm::Communicator;
use rankpool::config::PoolConfig;
use rankpool::context::Context;
use rankpool::data::{Column, ColumnMap, DataSourceHandle, Defaults, MemorySource, Scalar};
use rankpool::error::PoolError;
use rankpool::network::Client;
use rankpool::pool::TaskPool;
use std::sync::Arc;

/// One rank of a `rankpool` job. Every task opens an in-memory dataset on
/// its worker group and computes the weighted mass of its particles.
#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// The IP:Port at which the registration server is running
    #[clap(short = 's', long = "server", default_value = "127.0.0.1:9000")]
    server_address: String,
    /// The IP this rank accepts connections from other ranks on
    #[clap(short = 'i', long = "ip", default_value = "127.0.0.1")]
    ip: String,
    /// The number of ranks in the job
    #[clap(short = 'n', long = "num-nodes", default_value = "3")]
    num_nodes: usize,
    /// The number of ranks in each worker group
    #[clap(long = "cpus-per-worker", default_value = "1")]
    cpus_per_worker: usize,
    /// Give ranks that do not fill a worker group to the first groups
    #[clap(long = "use-all-cpus")]
    use_all_cpus: bool,
    /// The number of tasks to run
    #[clap(short = 't', long = "tasks", default_value = "8")]
    tasks: u64,
    /// The number of particles in the dataset of each task
    #[clap(short = 'r', long = "rows", default_value = "1000")]
    rows: usize,
    /// Log at debug level and log every task
    #[clap(long)]
    debug: bool,
}

/// The dataset of task `seed`: only masses, the weights are defaulted
fn particles(seed: u64, rows: usize) -> ColumnMap {
    let mass: Vec<f64> = (0..rows)
        .map(|i| ((seed as usize + i) % 17) as f64 + 1.0)
        .collect();
    let mut data = ColumnMap::new();
    data.insert("Mass".to_string(), Column::from(mass));
    data
}

async fn weighted_mass(ctx: Context, seed: u64, rows: usize) -> Result<f64, PoolError> {
    let source = MemorySource::new(particles(seed, rows));
    let handle = DataSourceHandle::new(ctx.clone(), Arc::new(source));
    let mut defaults = Defaults::new();
    defaults.insert("Weight".to_string(), Scalar::Float(0.5));
    let stream = handle.open(defaults).await?;

    let mut local = 0.0;
    {
        let mut batches = stream.read(&["Mass", "Weight"], false)?;
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            local += batch[0]
                .iter()
                .zip(batch[1].iter())
                .filter_map(|(m, w)| Some(m.as_f64()? * w.as_f64()?))
                .sum::<f64>();
        }
    }
    stream.close();
    ctx.comm().all_reduce(local, |a, b| a + b).await
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    let opts: Opts = Opts::parse();
    let level = if opts.debug { Level::Debug } else { Level::Info };
    simple_logger::init_with_level(level)
        .map_err(|e| PoolError::Configuration(e.to_string()))?;

    let client = Client::new(&opts.server_address, &opts.ip, opts.num_nodes).await?;
    let ctx = Context::new(Communicator::world(client.clone()));
    let config = PoolConfig {
        cpus_per_worker: opts.cpus_per_worker,
        use_all_cpus: opts.use_all_cpus,
        debug: opts.debug,
    };
    let pool = TaskPool::new(&ctx, config).await?;

    let rows = opts.rows;
    let tasks: Vec<u64> = (0..opts.tasks).collect();
    let results = pool
        .compute(tasks, |ctx, _index, seed: u64| weighted_mass(ctx, seed, rows))
        .await?;
    if let Some(results) = results {
        for (seed, total) in results.iter().enumerate() {
            println!("task {}: weighted mass {}", seed, total);
        }
    }
    pool.close();
    // a rank that exits without saying goodbye aborts the others
    ctx.comm().barrier().await?;
    client.close().await?;
    Ok(())
}
