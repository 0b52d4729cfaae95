mod common;

use common::{run_ranks, spawn_ranks};
use futures::StreamExt;
use rankpool::context::Context;
use rankpool::data::{
    Batch, Chunks, Column, ColumnMap, DataSource, DataSourceHandle, DataStream, Defaults,
    IterSource, MemorySource, Scalar,
};
use rankpool::error::PoolError;
use rankpool::network::LocalFabric;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn columns(entries: Vec<(&str, Column)>) -> ColumnMap {
    entries
        .into_iter()
        .map(|(name, column)| (name.to_string(), column))
        .collect()
}

fn weight_default(value: f64) -> Defaults {
    let mut defaults = Defaults::new();
    defaults.insert("W".to_string(), Scalar::Float(value));
    defaults
}

async fn read_all_batches(
    stream: &DataStream,
    names: &[&str],
    full: bool,
) -> Result<Vec<Batch>, PoolError> {
    let mut batches = stream.read(names, full)?;
    let mut out = Vec::new();
    while let Some(batch) = batches.next().await {
        out.push(batch?);
    }
    Ok(out)
}

/// A source with chunks of 10 rows of `X`, and no `Y`
fn chunked_source(chunks: usize) -> Arc<IterSource> {
    Arc::new(IterSource::new(move || -> Chunks {
        Box::new((0..chunks).map(|c| {
            let x: Vec<f64> = (0..10).map(|i| (c * 10 + i) as f64).collect();
            columns(vec![("X", Column::from(x))])
        }))
    }))
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_reads_fill_defaults_for_every_row() {
    let source = Arc::new(MemorySource::new(columns(vec![(
        "A",
        Column::Int((0..100).collect()),
    )])));
    let results = run_ranks(3, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let stream = handle.open(weight_default(2.5)).await.unwrap();
            let batches = read_all_batches(&stream, &["A", "W"], false).await.unwrap();
            assert_eq!(batches.len(), 1);
            let batch = &batches[0];
            assert!(batch[1].is_repeated());
            assert!(stream.is_default("W", &batch[1]));
            assert!(batch[1].iter().all(|w| w == Scalar::Float(2.5)));
            let first = batch[0].get(0);
            (batch.len(), batch[1].len(), first, stream.nread(), handle.size().unwrap())
        }
    })
    .await;

    let lengths: Vec<usize> = results.iter().map(|r| r.0).collect();
    assert_eq!(lengths, vec![34, 33, 33]);
    assert!(results.iter().all(|r| r.0 == r.1));
    assert_eq!(results[1].2, Some(Scalar::Int(34)));
    assert!(results.iter().all(|r| r.3 == 100 && r.4 == 100));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_column_without_data_or_default_is_missing() {
    let source = Arc::new(MemorySource::new(columns(vec![
        ("A", Column::from(vec![1.0; 6])),
        ("B", Column::from(vec![true; 6])),
    ])));
    let results = run_ranks(2, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let stream = handle.open(weight_default(1.0)).await.unwrap();
            read_all_batches(&stream, &["A", "C"], false).await.err()
        }
    })
    .await;

    for error in results {
        match error {
            Some(PoolError::MissingColumn { column, valid }) => {
                assert_eq!(column, "C");
                assert_eq!(valid, vec!["A", "B", "W"]);
            }
            other => panic!("expected a missing column, got {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn a_streamed_column_without_data_or_default_is_missing() {
    let source = chunked_source(2);
    let results = run_ranks(3, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let stream = handle.open(weight_default(1.0)).await.unwrap();
            read_all_batches(&stream, &["X", "Q"], false).await.err()
        }
    })
    .await;

    for error in results {
        match error {
            Some(PoolError::MissingColumn { column, valid }) => {
                assert_eq!(column, "Q");
                assert_eq!(valid, vec!["W", "X"]);
            }
            other => panic!("expected a missing column, got {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_streams_refuse_reads_and_close_twice() {
    let source = Arc::new(MemorySource::new(columns(vec![("A", Column::from(vec![1i64]))])));
    run_ranks(2, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let stream = handle.open(Defaults::new()).await.unwrap();
            stream.close();
            stream.close();
            assert!(stream.is_closed());
            assert!(matches!(
                stream.read(&["A"], false),
                Err(PoolError::StreamClosed)
            ));
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn size_is_set_once() {
    let source = Arc::new(MemorySource::new(columns(vec![(
        "A",
        Column::from(vec![0.0; 10]),
    )])));
    run_ranks(2, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            assert!(matches!(handle.size(), Err(PoolError::SizeUnknown)));
            let stream = handle.keep_cache().await.unwrap();
            assert_eq!(handle.size().unwrap(), 10);
            handle.set_size(10).unwrap();
            assert!(matches!(
                handle.set_size(20),
                Err(PoolError::SizeConflict {
                    current: 10,
                    requested: 20
                })
            ));
            stream.close();
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_is_rebuilt_unless_pinned() {
    let source = Arc::new(MemorySource::new(columns(vec![(
        "A",
        Column::from(vec![0.0; 8]),
    )])));
    let unpinned = source.clone();
    let builds = run_ranks(2, move |ctx| {
        let source = unpinned.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            for _ in 0..2 {
                let stream = handle.open(Defaults::new()).await.unwrap();
                read_all_batches(&stream, &["A"], false).await.unwrap();
                stream.close();
            }
            assert!(!handle.is_cached());
            handle.cache_builds()
        }
    })
    .await;
    assert_eq!(builds, vec![2, 2]);
    assert_eq!(source.reads(), 2);

    let pinned = source.clone();
    let builds = run_ranks(2, move |ctx| {
        let source = pinned.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let pin = handle.keep_cache().await.unwrap();
            for _ in 0..2 {
                let stream = handle.open(Defaults::new()).await.unwrap();
                read_all_batches(&stream, &["A"], false).await.unwrap();
                // dropping closes the stream
                drop(stream);
            }
            assert!(handle.is_cached());
            pin.close();
            assert!(!handle.is_cached());
            handle.cache_builds()
        }
    })
    .await;
    assert_eq!(builds, vec![1, 1]);
    assert_eq!(source.reads(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_reads_fail_on_every_rank() {
    let empty = Arc::new(MemorySource::new(ColumnMap::new()));
    let results = run_ranks(3, move |ctx| {
        let source = empty.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            handle.open(Defaults::new()).await.err()
        }
    })
    .await;
    assert!(results.iter().all(|e| matches!(e, Some(PoolError::NoData))));

    let uneven = Arc::new(MemorySource::new(columns(vec![
        ("A", Column::from(vec![0.0; 5])),
        ("B", Column::from(vec![0.0; 4])),
    ])));
    let results = run_ranks(3, move |ctx| {
        let source = uneven.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            handle.open(Defaults::new()).await.err()
        }
    })
    .await;
    assert!(results
        .iter()
        .all(|e| matches!(e, Some(PoolError::ProtocolViolation(_)))));

    struct Broken;
    impl DataSource for Broken {
        fn read_all(&self) -> Result<ColumnMap, PoolError> {
            Err(PoolError::ReadFailure("disk on fire".to_string()))
        }
    }
    let results = run_ranks(2, |ctx| async move {
        let handle = DataSourceHandle::new(ctx, Arc::new(Broken));
        handle.open(Defaults::new()).await.err()
    })
    .await;
    for error in results {
        match error {
            Some(PoolError::ReadFailure(msg)) => assert!(msg.contains("disk on fire")),
            other => panic!("expected a read failure, got {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_reads_are_balanced_and_counted() {
    let source = chunked_source(3);
    let results = run_ranks(3, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let stream = handle.open(weight_default(1.0)).await.unwrap();
            assert!(matches!(handle.size(), Err(PoolError::SizeUnknown)));

            let batches = read_all_batches(&stream, &["X", "W"], false).await.unwrap();
            let lengths: Vec<usize> = batches.iter().map(Batch::len).collect();
            assert!(batches.iter().all(|b| b[1].is_repeated() && b[1].len() == b.len()));
            let nread = stream.nread();

            let full = read_all_batches(&stream, &["X"], true).await.unwrap();
            (lengths, nread, full.len(), full[0].len(), stream.nread())
        }
    })
    .await;

    assert_eq!(results[0].0, vec![4, 4, 4]);
    assert_eq!(results[1].0, vec![3, 3, 3]);
    for (_, nread, full_batches, full_len, full_nread) in &results {
        assert_eq!(*nread, 30);
        assert_eq!(*full_batches, 1);
        assert_eq!(*full_nread, 30);
        assert!(*full_len == 10);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn uneven_batch_columns_fail_every_rank() {
    // 10 rows of X and 9 of Z: only rank 0 gets shares of different lengths
    let source = Arc::new(IterSource::new(|| -> Chunks {
        Box::new(std::iter::once(columns(vec![
            ("X", Column::from(vec![0.0; 10])),
            ("Z", Column::from(vec![0.0; 9])),
        ])))
    }));
    let results = run_ranks(3, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let stream = handle.open(Defaults::new()).await.unwrap();
            read_all_batches(&stream, &["X", "Z"], false).await.err()
        }
    })
    .await;
    assert!(results
        .iter()
        .all(|e| matches!(e, Some(PoolError::ProtocolViolation(_)))));
}

#[tokio::test(flavor = "multi_thread")]
async fn sources_without_a_read_strategy_are_not_supported() {
    struct Unreadable;
    impl DataSource for Unreadable {}

    let results = run_ranks(2, |ctx: Context| async move {
        let handle = DataSourceHandle::new(ctx, Arc::new(Unreadable));
        let stream = handle.open(Defaults::new()).await.unwrap();
        read_all_batches(&stream, &["A"], false).await.err()
    })
    .await;
    assert!(results
        .iter()
        .all(|e| matches!(e, Some(PoolError::NotSupported))));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_rank_that_advances_alone_blocks() {
    let source = chunked_source(2);
    let mut endpoints = LocalFabric::new(3);
    // ranks 1 and 2 never read
    let _idle = endpoints.split_off(1);
    let mut handles = spawn_ranks(endpoints, move |ctx| {
        let source = source.clone();
        async move {
            let handle = DataSourceHandle::new(ctx, source);
            let stream = handle.open(Defaults::new()).await?;
            let mut batches = stream.read(&["X"], false)?;
            let first = batches.next().await;
            Ok::<bool, PoolError>(first.is_some())
        }
    });
    let lone = handles.remove(0);
    assert!(timeout(Duration::from_millis(200), lone).await.is_err());
}
