use rankpool::comm::Communicator;
use rankpool::context::Context;
use rankpool::network::{Endpoint, LocalFabric};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Starts `f` on every endpoint, each with the world context of its rank
pub fn spawn_ranks<F, Fut, R>(endpoints: Vec<Endpoint>, f: F) -> Vec<JoinHandle<R>>
where
    F: Fn(Context) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    endpoints
        .into_iter()
        .map(|ep| tokio::spawn(f(Context::new(Communicator::world(Arc::new(ep))))))
        .collect()
}

/// Runs `f` on every rank of an in-process job of `n` ranks and returns the
/// results in rank order
pub async fn run_ranks<F, Fut, R>(n: usize, f: F) -> Vec<R>
where
    F: Fn(Context) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let mut results = Vec::with_capacity(n);
    for handle in spawn_ranks(LocalFabric::new(n), f) {
        results.push(handle.await.unwrap());
    }
    results
}
