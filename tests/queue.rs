use std::{sync::Arc, time::Duration};

use gamedeployment::queue::WorkQueue;

#[test_log::test(tokio::test)]
async fn duplicate_adds_collapse() {
    let queue = WorkQueue::new();
    queue.add("default/a");
    queue.add("default/a");
    queue.add("default/b");
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.get().await.as_deref(), Some("default/a"));
    assert_eq!(queue.get().await.as_deref(), Some("default/b"));
    assert!(queue.is_empty());
}

#[test_log::test(tokio::test)]
async fn key_added_while_processing_waits_for_done() {
    let queue = WorkQueue::new();
    queue.add("default/a");
    let key = queue.get().await.unwrap();

    queue.add(&key);
    assert!(queue.is_empty());

    queue.done(&key);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some(key.clone()));
    queue.done(&key);
    assert!(queue.is_empty());
}

#[test]
fn backoff_doubles_until_forgotten() {
    let queue = WorkQueue::new();
    assert_eq!(queue.when("default/a"), Duration::from_millis(5));
    assert_eq!(queue.when("default/a"), Duration::from_millis(10));
    assert_eq!(queue.when("default/a"), Duration::from_millis(20));
    assert_eq!(queue.num_requeues("default/a"), 3);
    assert_eq!(queue.when("default/b"), Duration::from_millis(5));

    queue.forget("default/a");
    assert_eq!(queue.num_requeues("default/a"), 0);
    assert_eq!(queue.when("default/a"), Duration::from_millis(5));
}

#[test]
fn backoff_is_capped() {
    let queue = WorkQueue::new();
    for _ in 0..40 {
        queue.when("default/a");
    }
    assert_eq!(queue.when("default/a"), Duration::from_secs(1000));
}

#[test_log::test(tokio::test)]
async fn delayed_add_lands_after_the_delay() {
    tokio::time::pause();
    let queue = Arc::new(WorkQueue::new());
    queue.add_after("default/a", Duration::from_secs(10));
    assert!(queue.is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(queue.len(), 1);
}

#[test_log::test(tokio::test)]
async fn shut_down_releases_waiting_workers() {
    let queue = Arc::new(WorkQueue::new());
    let waiter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.get().await })
    };
    tokio::task::yield_now().await;

    queue.shut_down();
    assert_eq!(waiter.await.unwrap(), None);
    assert!(queue.is_shutting_down());

    queue.add("default/a");
    assert!(queue.is_empty());
}
