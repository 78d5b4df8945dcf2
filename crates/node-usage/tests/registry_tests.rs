use node_common::{InstanceRecord, TrafficSnapshot};
use node_usage::InstanceRegistry;
use std::sync::Arc;

fn registry_in(dir: &tempfile::TempDir) -> InstanceRegistry {
    InstanceRegistry::new(dir.path().join("instances.json"))
}

#[tokio::test]
async fn test_add_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);

    assert!(registry.add(InstanceRecord::new(1, 8443)).await.unwrap());
    assert!(!registry.add(InstanceRecord::new(1, 9999)).await.unwrap());

    let all = registry.get_all().await.unwrap();
    assert_eq!(all, vec![InstanceRecord::new(1, 8443)]);
}

#[tokio::test]
async fn test_remove_and_update_ignore_absent_ids() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry.add(InstanceRecord::new(1, 8443)).await.unwrap();

    assert_eq!(registry.remove(42).await.unwrap(), None);

    let mut ghost = InstanceRecord::new(42, 2053);
    ghost.last_total_rx = 10;
    assert!(!registry.update(ghost).await.unwrap());
    assert_eq!(registry.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_replaces_counters() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry.add(InstanceRecord::new(5, 8443)).await.unwrap();

    let mut record = registry.get(5).await.unwrap().unwrap();
    record.last_total_rx = 150;
    record.last_total_tx = 80;
    assert!(registry.update(record.clone()).await.unwrap());

    assert_eq!(registry.get(5).await.unwrap(), Some(record));
}

#[tokio::test]
async fn test_document_is_pretty_json_array() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry.add(InstanceRecord::new(3, 443)).await.unwrap();

    let text = std::fs::read_to_string(registry.path()).unwrap();
    assert!(text.starts_with("[\n"));
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(
        value,
        serde_json::json!([{"id": 3, "inboundPort": 443, "lastTotalRx": 0, "lastTotalTx": 0}])
    );
}

#[tokio::test]
async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    registry_in(&dir).add(InstanceRecord::new(8, 8080)).await.unwrap();

    let reopened = registry_in(&dir);
    assert_eq!(reopened.get_all().await.unwrap(), vec![InstanceRecord::new(8, 8080)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_in(&dir));

    let tasks: Vec<_> = (1..=20)
        .map(|id| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .add(InstanceRecord::new(id, 10_000 + id as u16))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let mut ids: Vec<_> = registry.get_all().await.unwrap().iter().map(|r| r.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=20).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_update_racing_remove_never_resurrects() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_in(&dir));
    registry.add(InstanceRecord::new(1, 8443)).await.unwrap();

    let updater = {
        let registry = registry.clone();
        tokio::spawn(async move {
            for n in 0..20u64 {
                let mut record = InstanceRecord::new(1, 8443);
                record.last_total_rx = n;
                registry.update(record).await.unwrap();
            }
        })
    };
    let remover = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.remove(1).await.unwrap() })
    };
    updater.await.unwrap();
    remover.await.unwrap();

    assert!(registry.get(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_advance_counters_only_touches_unchanged_records() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    for id in 1..=3 {
        registry.add(InstanceRecord::new(id, 8440 + id as u16)).await.unwrap();
    }
    let read = registry.get_all().await.unwrap();

    // 2 is re-provisioned on a new port, 3 is deprovisioned.
    registry.remove(2).await.unwrap();
    registry.add(InstanceRecord::new(2, 9000)).await.unwrap();
    registry.remove(3).await.unwrap();

    let observations: Vec<_> = read
        .into_iter()
        .map(|record| (record, TrafficSnapshot::new(70, 30)))
        .collect();
    let advanced = registry.advance_counters(&observations).await.unwrap();

    assert_eq!(advanced, vec![1]);
    let mut expected = InstanceRecord::new(1, 8441);
    expected.advance_to(TrafficSnapshot::new(70, 30));
    assert_eq!(
        registry.get_all().await.unwrap(),
        vec![expected, InstanceRecord::new(2, 9000)]
    );
}
