//! Store tests, run against both the in-memory and the SQLite backend.
//!
//! These tests drive the store the way several nodes would: claims, heartbeats,
//! status reports and cancel requests, checking the record state after each step.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tasker_lite::config::{FailoverPolicy, StoreConfig};
use tasker_lite::persister::TaskPersister;
use tasker_lite::tasker::info::PROCESSING_LOG_MAX_CHARS;
use tasker_lite::tasker::{TaskConfig, TaskStatus};
use tasker_lite::TaskerError;
use test_harness::{fast_store_config, status_of, TestStore};

type OpenStore = fn(StoreConfig) -> TestStore;

/// Generates one `#[tokio::test]` per backend for each scenario.
macro_rules! store_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    super::$name(super::TestStore::memory).await;
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    super::$name(super::TestStore::sqlite).await;
                }
            )*
        }
    };
}

store_tests!(
    create_task_starts_new,
    illegal_transitions_are_rejected,
    concurrent_claims_have_one_winner,
    claims_oldest_task_first,
    cancel_before_claim_ends_canceled,
    mark_to_be_cancelled_rules,
    stale_heartbeat_fails_over_once,
    heartbeat_refreshes_only_own_tasks,
    failover_attempts_are_capped,
    failover_backoff,
    list_tasks_order_filters_and_paging,
    processing_log_is_bounded,
    status_report_is_fenced_by_claim,
);

fn config_with(key: &str, value: serde_json::Value) -> TaskConfig {
    let mut cfg = TaskConfig::new();
    cfg.insert(key.to_string(), value);
    cfg
}

/// Test 1: A created task is NEW with its configuration stored
async fn create_task_starts_new(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;

    let cfg = config_with("index", serde_json::json!("contributors"));
    let id = p.create_task("reindex", Some(&cfg)).await.unwrap();

    let info = p.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.id, id);
    assert_eq!(info.task_type, "reindex");
    assert_eq!(info.status, TaskStatus::New);
    assert_eq!(info.run_count, 0);
    assert!(!info.cancel_requested);
    assert!(info.execution_node_id.is_none());
    assert!(info.processing_log.is_none());
    assert_eq!(info.task_config().unwrap(), Some(cfg));

    assert!(p.get_task_status_info("unknown").await.unwrap().is_none());
}

/// Test 2: Transitions outside the status table return false and change nothing
async fn illegal_transitions_are_rejected(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;
    let id = p.create_task("t", None).await.unwrap();

    assert!(!p.change_task_status(&id, TaskStatus::FinishedOk, Some("x")).await.unwrap());
    assert!(!p.change_task_status(&id, TaskStatus::Failover, None).await.unwrap());
    assert!(!p.change_task_status(&id, TaskStatus::New, None).await.unwrap());
    let info = p.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::New);
    assert!(info.processing_log.is_none());

    assert!(!p
        .change_task_status("unknown", TaskStatus::Canceled, None)
        .await
        .unwrap());

    p.get_task_to_run("node-1").await.unwrap().unwrap();
    assert!(p
        .change_task_status(&id, TaskStatus::FinishedOk, Some("done"))
        .await
        .unwrap());
    let info = p.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::FinishedOk);
    assert!(info.last_run_finished_at.is_some());
    assert_eq!(info.processing_log.as_deref(), Some("done"));

    // terminal
    for next in TaskStatus::ALL {
        assert!(!p.change_task_status(&id, next, None).await.unwrap());
    }
    assert_eq!(status_of(p, &id).await, TaskStatus::FinishedOk);
}

/// Test 3: Nodes racing for one NEW task, exactly one wins
async fn concurrent_claims_have_one_winner(open: OpenStore) {
    let store = open(fast_store_config());
    let id = store.persister.create_task("t", None).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..8 {
        let persister = store.node_handle();
        handles.push(tokio::spawn(async move {
            persister.get_task_to_run(&format!("node-{}", n)).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(info) = handle.await.unwrap().unwrap() {
            winners.push(info);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one node should claim the task");

    let info = store.persister.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::Running);
    assert_eq!(info.run_count, 1);
    assert_eq!(info.execution_node_id, winners[0].execution_node_id);
}

/// Test 4: Claims go to the oldest runnable task first
async fn claims_oldest_task_first(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;
    let first = p.create_task("t", None).await.unwrap();
    let second = p.create_task("t", None).await.unwrap();
    let third = p.create_task("t", None).await.unwrap();

    let claimed = p.get_task_to_run("node-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, TaskStatus::Running);
    assert_eq!(claimed.execution_node_id.as_deref(), Some("node-1"));
    assert!(claimed.last_run_started_at.is_some());
    assert!(claimed.heartbeat > 0);

    assert_eq!(p.get_task_to_run("node-1").await.unwrap().unwrap().id, second);
    assert_eq!(p.get_task_to_run("node-1").await.unwrap().unwrap().id, third);
    assert!(p.get_task_to_run("node-1").await.unwrap().is_none());
}

/// Test 5: Cancel requested before any node claims the task ends it CANCELED
async fn cancel_before_claim_ends_canceled(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;
    let id = p.create_task("t", None).await.unwrap();

    assert!(p.mark_task_to_be_cancelled(&id).await.unwrap());
    assert!(p.get_task_to_run("node-1").await.unwrap().is_none());

    let info = p.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::Canceled);
    assert_eq!(info.run_count, 0);
    assert!(info.cancel_requested);
}

/// Test 6: Cancel can be requested once, only for unfinished tasks
async fn mark_to_be_cancelled_rules(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;

    assert!(!p.mark_task_to_be_cancelled("unknown").await.unwrap());

    let running = p.create_task("t", None).await.unwrap();
    p.get_task_to_run("node-1").await.unwrap().unwrap();
    assert!(p.mark_task_to_be_cancelled(&running).await.unwrap());
    assert!(!p.mark_task_to_be_cancelled(&running).await.unwrap());

    // the flag survives status changes
    assert!(p
        .change_task_status(&running, TaskStatus::Failover, None)
        .await
        .unwrap());
    let info = p.get_task_status_info(&running).await.unwrap().unwrap();
    assert!(info.cancel_requested);

    let finished = p.create_task("t", None).await.unwrap();
    p.get_task_to_run("node-1").await.unwrap().unwrap();
    p.change_task_status(&finished, TaskStatus::FinishedOk, None)
        .await
        .unwrap();
    assert!(!p.mark_task_to_be_cancelled(&finished).await.unwrap());
    assert!(!p
        .get_task_status_info(&finished)
        .await
        .unwrap()
        .unwrap()
        .cancel_requested);
}

/// Test 7: A RUNNING task with stale heartbeat is failed over exactly once
async fn stale_heartbeat_fails_over_once(open: OpenStore) {
    let store = open(fast_store_config());
    let node1 = store.node_handle();
    let node2 = store.node_handle();

    let id = node1.create_task("t", None).await.unwrap();
    node1.get_task_to_run("node-1").await.unwrap().unwrap();

    // fresh heartbeat, nothing happens
    node2
        .heartbeat("node-2", &HashSet::new(), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status_of(&node2, &id).await, TaskStatus::Running);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let timeout = Duration::from_millis(30);
    node2.heartbeat("node-2", &HashSet::new(), timeout).await.unwrap();
    node2.heartbeat("node-2", &HashSet::new(), timeout).await.unwrap();

    let info = node2.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::Failover);
    assert!(info.last_run_finished_at.is_some());
    let log = info.processing_log.unwrap_or_default();
    assert_eq!(log.matches("Failover necessity detected by node 'node-2'").count(), 1);
}

/// Test 8: Heartbeats refresh tasks owned by the heartbeating node only
async fn heartbeat_refreshes_only_own_tasks(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;
    let id = p.create_task("t", None).await.unwrap();
    let claimed = p.get_task_to_run("node-1").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let ids: HashSet<String> = [id.clone()].into_iter().collect();
    p.heartbeat("node-1", &ids, Duration::from_secs(10)).await.unwrap();
    let refreshed = p.get_task_status_info(&id).await.unwrap().unwrap();
    assert!(refreshed.heartbeat > claimed.heartbeat);
    assert_eq!(refreshed.status, TaskStatus::Running);

    // a node listing the id it does not own neither refreshes nor protects it
    tokio::time::sleep(Duration::from_millis(80)).await;
    p.heartbeat("node-2", &ids, Duration::from_millis(30)).await.unwrap();
    let info = p.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::Failover);
    assert_eq!(info.heartbeat, refreshed.heartbeat);
}

/// Test 9: Failover tasks are canceled once they used all attempts
async fn failover_attempts_are_capped(open: OpenStore) {
    let config = fast_store_config()
        .with_failover(FailoverPolicy::default().with_fixed_delay(Duration::ZERO).with_max_attempts(3));
    let store = open(config);
    let p = &store.persister;
    let id = p.create_task("t", None).await.unwrap();

    for attempt in 1..=3 {
        let claimed = p.get_task_to_run("node-1").await.unwrap().unwrap();
        assert_eq!(claimed.run_count, attempt);
        assert!(p
            .change_task_status(&id, TaskStatus::Failover, Some("ERROR: boom"))
            .await
            .unwrap());
    }

    assert!(p.get_task_to_run("node-1").await.unwrap().is_none());
    let info = p.get_task_status_info(&id).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::Canceled);
    assert_eq!(info.run_count, 3);
    assert!(info
        .processing_log
        .unwrap_or_default()
        .ends_with("Cancelled due too much failover attempts"));
}

/// Test 10: First failover moves to another node at once, retries wait for the cool-down
async fn failover_backoff(open: OpenStore) {
    let store = open(StoreConfig::default());
    let p = &store.persister;
    let id = p.create_task("t", None).await.unwrap();

    p.get_task_to_run("node-1").await.unwrap().unwrap();
    p.change_task_status(&id, TaskStatus::Failover, None).await.unwrap();

    // same node has to wait 10s, other nodes may take it over immediately
    assert!(p.get_task_to_run("node-1").await.unwrap().is_none());
    let claimed = p.get_task_to_run("node-2").await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.run_count, 2);
    assert_eq!(claimed.execution_node_id.as_deref(), Some("node-2"));

    // second failover waits on every node
    p.change_task_status(&id, TaskStatus::Failover, None).await.unwrap();
    assert!(p.get_task_to_run("node-1").await.unwrap().is_none());
    assert!(p.get_task_to_run("node-3").await.unwrap().is_none());
    assert_eq!(status_of(p, &id).await, TaskStatus::Failover);
}

/// Test 11: Listing is newest first, with type and status filters and paging
async fn list_tasks_order_filters_and_paging(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;

    let mut ids = Vec::new();
    for n in 0..6 {
        let task_type = if n % 2 == 0 { "even" } else { "odd" };
        ids.push(p.create_task(task_type, None).await.unwrap());
    }
    // claims ids[0]
    p.get_task_to_run("node-1").await.unwrap().unwrap();

    let newest_first: Vec<String> = ids.iter().rev().cloned().collect();
    let listed: Vec<String> = p
        .list_tasks(None, &[], 0, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(listed, newest_first);

    let blank = p.list_tasks(Some("  "), &[], 0, 0).await.unwrap();
    assert_eq!(blank.len(), 6);

    let odd = p.list_tasks(Some("odd"), &[], 0, 0).await.unwrap();
    assert_eq!(odd.len(), 3);
    assert!(odd.iter().all(|t| t.task_type == "odd"));

    let running = p.list_tasks(None, &[TaskStatus::Running], 0, 0).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, ids[0]);

    let some = p
        .list_tasks(Some("even"), &[TaskStatus::New, TaskStatus::Running], 0, 0)
        .await
        .unwrap();
    assert_eq!(some.len(), 3);

    let page: Vec<String> = p
        .list_tasks(None, &[], 2, 3)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(page, newest_first[2..5].to_vec());

    assert!(p.list_tasks(None, &[], 10, 3).await.unwrap().is_empty());
    assert!(p
        .list_tasks(None, &[TaskStatus::FinishedError], 0, 0)
        .await
        .unwrap()
        .is_empty());
}

/// Test 12: Processing log keeps the newest content within its bound
async fn processing_log_is_bounded(open: OpenStore) {
    let store = open(fast_store_config());
    let p = &store.persister;
    let id = p.create_task("t", None).await.unwrap();

    p.write_task_log(&id, "").await.unwrap();
    assert!(p
        .get_task_status_info(&id)
        .await
        .unwrap()
        .unwrap()
        .processing_log
        .is_none());

    p.write_task_log(&id, &"a".repeat(40_000)).await.unwrap();
    p.write_task_log(&id, &"b".repeat(40_000)).await.unwrap();
    let log = p
        .get_task_status_info(&id)
        .await
        .unwrap()
        .unwrap()
        .processing_log
        .unwrap();
    assert_eq!(log.chars().count(), PROCESSING_LOG_MAX_CHARS);
    assert!(log.ends_with(&"b".repeat(40_000)));

    assert!(matches!(
        p.write_task_log("unknown", "x").await,
        Err(TaskerError::TaskNotFound(_))
    ));
}

/// Test 13: A run which lost its task to another node cannot report for it
async fn status_report_is_fenced_by_claim(open: OpenStore) {
    let store = open(fast_store_config());
    let p: Arc<dyn TaskPersister> = store.persister.clone();
    let id = p.create_task("t", None).await.unwrap();

    let first_run = p.get_task_to_run("node-1").await.unwrap().unwrap().claim().unwrap();

    // node-1 was falsely considered dead, node-2 took over
    p.change_task_status(&id, TaskStatus::Failover, Some("stale"))
        .await
        .unwrap();
    let second_run = p.get_task_to_run("node-2").await.unwrap().unwrap().claim().unwrap();
    assert_eq!(second_run.run_count, 2);

    assert!(!p
        .change_task_status_for_run(&id, &first_run, TaskStatus::FinishedOk, None)
        .await
        .unwrap());
    assert_eq!(status_of(&p, &id).await, TaskStatus::Running);

    assert!(p
        .change_task_status_for_run(&id, &second_run, TaskStatus::FinishedError, Some("ERROR: x"))
        .await
        .unwrap());
    assert_eq!(status_of(&p, &id).await, TaskStatus::FinishedError);
}
