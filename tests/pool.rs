mod common;

use common::{run_ranks, spawn_ranks};
use rankpool::config::PoolConfig;
use rankpool::error::PoolError;
use rankpool::network::{AbortHook, LocalFabric};
use rankpool::pool::TaskPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

fn config(cpus_per_worker: usize, use_all_cpus: bool) -> PoolConfig {
    PoolConfig {
        cpus_per_worker,
        use_all_cpus,
        ..PoolConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn results_come_back_in_task_order() {
    // task 0 cannot finish before task 11 has
    let last_done = Arc::new(Notify::new());
    let finished = Arc::new(Mutex::new(Vec::new()));
    let order = finished.clone();
    let results = run_ranks(4, move |ctx| {
        let last_done = last_done.clone();
        let finished = finished.clone();
        async move {
            let pool = TaskPool::new(&ctx, config(1, false)).await.unwrap();
            assert_eq!(pool.workers(), 3);
            let tasks: Vec<u64> = (0..12).collect();
            let results = pool
                .compute(tasks, |_ctx, index, task: u64| {
                    let last_done = last_done.clone();
                    let finished = finished.clone();
                    async move {
                        if index == 0 {
                            last_done.notified().await;
                        }
                        finished.lock().unwrap().push(index);
                        if index == 11 {
                            last_done.notify_one();
                        }
                        Ok::<u64, PoolError>(task * task)
                    }
                })
                .await
                .unwrap();
            pool.close();
            results
        }
    })
    .await;

    let finished = order.lock().unwrap().clone();
    assert_eq!(finished.len(), 12);
    assert_eq!(finished.last(), Some(&0));
    let expected: Vec<u64> = (0..12).map(|t| t * t).collect();
    assert_eq!(results[0], Some(expected));
    assert!(results[1..].iter().all(Option::is_none));
}

#[tokio::test(flavor = "multi_thread")]
async fn every_group_member_runs_each_task() {
    let results = run_ranks(5, |ctx| async move {
        let pool = TaskPool::new(&ctx, config(2, false)).await.unwrap();
        assert_eq!(pool.workers(), 2);
        let world_rank = ctx.comm().rank();
        let tasks: Vec<u64> = vec![10, 20, 30, 40, 50];
        pool.compute(tasks, |group, _index, task: u64| async move {
            assert_eq!(group.comm().size(), 2);
            // every member contributes, so the sum is twice the task
            group.comm().all_reduce_sum(task).await
        })
        .await
        .unwrap()
        .map(|results| (world_rank, results))
    })
    .await;

    assert_eq!(results[0], Some((0, vec![20, 40, 60, 80, 100])));
    assert!(results[1..].iter().all(Option::is_none));
}

#[tokio::test(flavor = "multi_thread")]
async fn remainder_ranks_stay_idle_unless_included() {
    let strict = run_ranks(4, |ctx| async move {
        let pool = TaskPool::new(&ctx, config(2, false)).await.unwrap();
        let roles = (pool.color(), pool.is_worker(), pool.context().comm().size());
        let results = pool
            .compute(vec![1u64, 2, 3], |_ctx, _index, task: u64| async move {
                Ok::<u64, PoolError>(task + 1)
            })
            .await
            .unwrap();
        (roles, results)
    })
    .await;
    assert_eq!(strict[0], ((0, false, 2), Some(vec![2, 3, 4])));
    assert_eq!(strict[1].0, (1, true, 2));
    assert_eq!(strict[2].0, (1, true, 2));
    // the idle rank shares the coordinator's group
    assert_eq!(strict[3], ((0, false, 2), None));

    let loose = run_ranks(4, |ctx| async move {
        let pool = TaskPool::new(&ctx, config(2, true)).await.unwrap();
        (pool.color(), pool.context().comm().size())
    })
    .await;
    assert_eq!(loose, vec![(0, 1), (1, 3), (1, 3), (1, 3)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn no_tasks_still_shuts_down() {
    let results = run_ranks(3, |ctx| async move {
        let pool = TaskPool::new(&ctx, PoolConfig::default()).await.unwrap();
        pool.compute(Vec::<u64>::new(), |_ctx, _index, task: u64| async move {
            Ok::<u64, PoolError>(task)
        })
        .await
        .unwrap()
    })
    .await;
    assert_eq!(results, vec![Some(vec![]), None, None]);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_single_rank_cannot_form_a_pool() {
    let results = run_ranks(1, |ctx| async move {
        TaskPool::new(&ctx, PoolConfig::default()).await.err()
    })
    .await;
    assert!(matches!(results[0], Some(PoolError::Configuration(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failing_task_aborts_the_job() {
    let hook: AbortHook = Arc::new(|code: i32| panic!("job aborted with code {}", code));
    let mut handles = spawn_ranks(LocalFabric::with_abort_hook(2, hook), |ctx| async move {
        let pool = TaskPool::new(&ctx, PoolConfig::default()).await.unwrap();
        pool.compute(vec![1u64, 2, 3], |_ctx, index, task: u64| async move {
            if index == 1 {
                Err(format!("task {} cannot be computed", task))
            } else {
                Ok(task)
            }
        })
        .await
    });

    let worker = handles.remove(1);
    let outcome = timeout(Duration::from_secs(10), worker)
        .await
        .expect("the worker should abort, not hang");
    assert!(outcome.unwrap_err().is_panic());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_panicking_task_aborts_the_job() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let hook: AbortHook = Arc::new(move |code: i32| {
        let _ = tx.send(code);
        panic!("job aborted with code {}", code)
    });
    let _handles = spawn_ranks(LocalFabric::with_abort_hook(3, hook), |ctx| async move {
        let pool = TaskPool::new(&ctx, config(2, false)).await.unwrap();
        pool.compute(vec![1u64, 2], |group, _index, task: u64| async move {
            if group.comm().rank() == 1 {
                panic!("member 1 cannot compute task {}", task);
            }
            Ok::<u64, PoolError>(task)
        })
        .await
    });

    let code = timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("the panic should abort the job, not hang");
    assert_eq!(code, Some(1));
}
