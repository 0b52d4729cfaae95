use clap::Parser;
use log::Level;
use rankpool::error::PoolError;
use rankpool::network::Server;

/// The registration server of a `rankpool` job: hands out rank ids and
/// introduces the ranks to each other
#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// The IP:Port at which to run the registration server
    #[clap(short = 'a', long = "address", default_value = "127.0.0.1:9000")]
    address: String,
    /// The number of ranks in the job
    #[clap(short = 'n', long = "num-nodes", default_value = "3")]
    num_nodes: usize,
    /// Log at debug level
    #[clap(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    let opts: Opts = Opts::parse();
    let level = if opts.debug { Level::Debug } else { Level::Info };
    simple_logger::init_with_level(level)
        .map_err(|e| PoolError::Configuration(e.to_string()))?;

    let mut server = Server::new(&opts.address).await?;
    server.accept_new_connections(opts.num_nodes).await?;
    Ok(())
}
