//! Integration tests for the deduplicating work queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempo::queue::WorkQueue;
use tokio::time::timeout;

fn new_queue() -> Arc<WorkQueue<String>> {
    Arc::new(WorkQueue::new())
}

// ---------------------------------------------------------------------------
// Producers and consumers
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_producers_and_consumers_finish_cleanly() {
    let q = new_queue();

    let mut producers = Vec::new();
    for i in 0..50 {
        let q = Arc::clone(&q);
        producers.push(tokio::spawn(async move {
            for _ in 0..50 {
                q.add(format!("item-{i}"));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    let mut consumers = Vec::new();
    for _ in 0..10 {
        let q = Arc::clone(&q);
        consumers.push(tokio::spawn(async move {
            while let Some(item) = q.get().await {
                assert_ne!(item, "added after shutdown!");
                tokio::time::sleep(Duration::from_millis(3)).await;
                q.done(&item);
            }
        }));
    }

    for producer in producers {
        producer.await.unwrap();
    }
    q.shut_down();
    q.add("added after shutdown!".to_string());

    for consumer in consumers {
        timeout(Duration::from_secs(10), consumer)
            .await
            .expect("consumer hung")
            .unwrap();
    }
    assert_eq!(q.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn re_adding_while_processing_settles() {
    let q = new_queue();

    for i in 0..50 {
        q.add(format!("item-{i}"));
    }

    let mut consumers = Vec::new();
    for _ in 0..10 {
        let q = Arc::clone(&q);
        consumers.push(tokio::spawn(async move {
            // Every consumer re-adds each item it sees once more.
            let mut counters: HashMap<String, u32> = HashMap::new();
            while let Some(item) = q.get().await {
                let seen = counters.entry(item.clone()).or_default();
                *seen += 1;
                if *seen < 2 {
                    q.add(item.clone());
                }
                q.done(&item);
                if q.is_empty() && q.stats().processing == 0 {
                    q.shut_down();
                }
            }
        }));
    }

    for consumer in consumers {
        timeout(Duration::from_secs(10), consumer)
            .await
            .expect("consumer hung")
            .unwrap();
    }
    assert_eq!(q.len(), 0);
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn len_ignores_duplicates() {
    let q = new_queue();
    q.add("foo".to_string());
    assert_eq!(q.len(), 1);
    q.add("bar".to_string());
    assert_eq!(q.len(), 2);
    q.add("foo".to_string());
    assert_eq!(q.len(), 2);
}

#[tokio::test]
async fn duplicate_adds_are_delivered_once() {
    let q = new_queue();
    q.add("k".to_string());
    q.add("k".to_string());

    let got = q.get().await.unwrap();
    assert_eq!(got, "k");
    q.done(&got);
    assert!(q.is_empty());

    q.shut_down();
    assert_eq!(q.get().await, None);
}

#[tokio::test]
async fn reinsert_while_processing_redelivers_after_done() {
    let q = new_queue();
    q.add("foo".to_string());

    let item = q.get().await.unwrap();
    assert_eq!(item, "foo");

    q.add(item.clone());
    q.add(item.clone());
    // Still checked out, so it must not be handed out yet.
    assert_eq!(q.len(), 0);
    assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());

    q.done(&item);
    assert_eq!(q.len(), 1);

    let again = q.get().await.unwrap();
    assert_eq!(again, "foo");
    q.done(&again);
    assert_eq!(q.len(), 0);
    assert_eq!(q.stats().dirty, 0);
}

#[tokio::test]
async fn keys_come_out_in_insertion_order() {
    let q: WorkQueue<u32> = WorkQueue::new();
    for k in [3, 1, 2, 1, 3] {
        q.add(k);
    }
    assert_eq!(q.get().await, Some(3));
    assert_eq!(q.get().await, Some(1));
    assert_eq!(q.get().await, Some(2));
}

#[tokio::test]
async fn done_on_a_key_never_checked_out_is_ignored() {
    let q: WorkQueue<u32> = WorkQueue::new();
    q.add(1);
    q.done(&1);
    assert_eq!(q.len(), 1);

    assert_eq!(q.get().await, Some(1));
    q.done(&1);
    assert!(q.is_empty());
    assert_eq!(q.stats().processing, 0);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_after_shutdown_is_dropped() {
    let q = new_queue();
    q.shut_down();
    q.add("late".to_string());
    assert_eq!(q.len(), 0);
    assert!(q.shutting_down());
    assert_eq!(q.get().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shut_down_releases_blocked_getters() {
    let q = new_queue();
    let getters: Vec<_> = (0..3)
        .map(|_| {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();

    for getter in getters {
        let got = timeout(Duration::from_secs(1), getter).await.unwrap().unwrap();
        assert_eq!(got, None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shut_down_with_drain_waits_for_done() {
    let q = new_queue();
    q.add("foo".to_string());
    q.add("bar".to_string());

    let first = q.get().await.unwrap();
    let second = q.get().await.unwrap();

    let drainer = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.shut_down_with_drain().await }
    });

    // Nothing pending: once the drain starts, get reports shutdown.
    assert_eq!(q.get().await, None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drainer.is_finished(), "drain finished with items in flight");
    assert!(q.stats().draining);

    q.done(&first);
    q.done(&second);

    timeout(Duration::from_secs(1), drainer)
        .await
        .expect("drain did not finish")
        .unwrap();
    assert!(!q.stats().draining);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shut_down_does_not_wait_for_in_flight() {
    let q = new_queue();
    q.add("foo".to_string());
    q.add("bar".to_string());
    q.get().await.unwrap();
    q.get().await.unwrap();

    let stopper = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.shut_down() }
    });
    timeout(Duration::from_secs(1), stopper).await.unwrap().unwrap();
    assert_eq!(q.stats().processing, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_shut_down_aborts_drain() {
    let q = new_queue();
    q.add("foo".to_string());
    q.add("bar".to_string());
    q.get().await.unwrap();
    q.get().await.unwrap();

    let drainer = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.shut_down_with_drain().await }
    });

    assert_eq!(q.get().await, None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drainer.is_finished());

    // A second interrupt: give up on the in-flight items.
    q.shut_down();

    timeout(Duration::from_secs(1), drainer)
        .await
        .expect("forced shutdown did not end the drain")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_redelivers_dirty_item() {
    let q = new_queue();
    q.add("foo".to_string());
    let gotten = q.get().await.unwrap();
    q.add("foo".to_string());

    let drainer = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.shut_down_with_drain().await }
    });

    assert_eq!(q.get().await, None);

    // Finishing the work puts the re-added key back in the queue.
    q.done(&gotten);

    let again = q.get().await;
    assert_eq!(again.as_deref(), Some("foo"), "should not have been done");
    assert!(!drainer.is_finished());
    q.done(&again.unwrap());

    assert_eq!(q.get().await, None, "should have been done");
    timeout(Duration::from_secs(1), drainer).await.unwrap().unwrap();
}

#[tokio::test]
async fn drain_of_idle_queue_returns_immediately() {
    let q = new_queue();
    timeout(Duration::from_secs(1), q.shut_down_with_drain())
        .await
        .unwrap();
    assert!(q.shutting_down());
}
