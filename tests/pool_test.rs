//! Integration tests for the worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tempo::error::Error;
use tempo::pool::{PoolConfig, WorkerPool};
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn buggy_task() {
    panic!("task bug")
}

async fn wait_for_live_workers(pool: &WorkerPool, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while pool.live_workers() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("live worker count never settled");
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_every_scheduled_task() {
    let pool = WorkerPool::new(4);
    let counter = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = mpsc::channel(100);

    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        let done_tx = done_tx.clone();
        pool.schedule(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            done_tx.send(()).await.unwrap();
        })
        .await
        .unwrap();
    }

    for _ in 0..100 {
        timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("task never completed");
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn never_runs_more_than_concurrency_tasks_at_once() {
    let pool = WorkerPool::with_config(PoolConfig {
        name: "bounded".to_string(),
        concurrency: 3,
        queue_capacity: 8,
    });
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..30 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let finished = Arc::clone(&finished);
        // Blocks here once 8 tasks are waiting for a worker.
        pool.schedule(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }

    timeout(Duration::from_secs(5), pool.close()).await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 30);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "observed {peak} tasks running at once");
}

#[tokio::test]
async fn schedule_never_runs_task_inline() {
    let pool = WorkerPool::new(1);
    let ran = Arc::new(AtomicBool::new(false));

    pool.schedule({
        let ran = Arc::clone(&ran);
        async move { ran.store(true, Ordering::SeqCst) }
    })
    .await
    .unwrap();
    assert!(!ran.load(Ordering::SeqCst));

    pool.close().await;
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn close_finishes_queued_tasks() {
    let pool = WorkerPool::new(1);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let counter = Arc::clone(&counter);
        pool.schedule(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }

    timeout(Duration::from_secs(2), pool.close()).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn zero_concurrency_is_raised_to_one() {
    let pool = WorkerPool::new(0);
    assert_eq!(pool.concurrency(), 1);
    assert_eq!(pool.live_workers(), 1);
    pool.close().await;
}

// ---------------------------------------------------------------------------
// Panic policy: the worker dies and is not replaced
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_task_kills_only_its_worker() {
    let pool = WorkerPool::new(2);
    pool.schedule(buggy_task()).await.unwrap();
    wait_for_live_workers(&pool, 1).await;

    let (done_tx, mut done_rx) = mpsc::channel(10);
    for i in 0..10 {
        let done_tx = done_tx.clone();
        pool.schedule(async move { done_tx.send(i).await.unwrap() })
            .await
            .unwrap();
    }
    for _ in 0..10 {
        timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("surviving worker stalled");
    }

    // Still one worker: the lost one was not restarted.
    assert_eq!(pool.live_workers(), 1);
    pool.close().await;
}

#[tokio::test]
async fn pool_without_workers_rejects_tasks() {
    let pool = WorkerPool::new(1);
    pool.schedule(buggy_task()).await.unwrap();
    wait_for_live_workers(&pool, 0).await;

    let result = pool.schedule(async {}).await;
    assert!(matches!(result, Err(Error::PoolClosed)));
}
