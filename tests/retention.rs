use spectre_store::{
    Config, Event, EventStore, QueryRequest, ResourceIdentity, RetentionPolicy, Verb,
};
use std::time::Duration;
use test_log::test;

fn event(ts: u64, i: u64) -> Event {
    Event::new(
        ResourceIdentity::builder()
            .version("v1")
            .kind("Pod")
            .namespace("default")
            .name(format!("p-{i}"))
            .uid(format!("uid-{i}"))
            .build(),
        ts,
        Verb::Create,
        br#"{"status":{"phase":"Running"}}"#.to_vec(),
    )
}

fn wall_clock() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[test]
fn retention_by_age_removes_old_segments() -> spectre_store::Result<()> {
    let now = wall_clock();

    let folder = tempfile::tempdir()?;

    let store = Config::new(&folder)
        .retention(RetentionPolicy {
            max_age: Some(Duration::from_secs(3_600)),
            max_total_size: None,
        })
        .open()?;

    // One segment of ancient data, one of recent data
    for i in 0..20u64 {
        store.append(event(1_000 + i, i))?;
    }
    store.seal_active()?;

    for i in 0..20u64 {
        store.append(event(now - 10 + i / 10, 100 + i))?;
    }
    store.seal_active()?;

    let report = store.retain()?;

    assert_eq!(1, report.deleted.len());
    assert_eq!(1, store.catalog().len()?);

    let result = store.query(&QueryRequest::range(0, u64::MAX), None)?;
    assert_eq!(20, result.count);
    assert!(result.events.iter().all(|e| e.ts >= now - 10));

    Ok(())
}

#[test]
fn retention_by_total_size_removes_oldest_first() -> spectre_store::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(&folder)
        .retention(RetentionPolicy {
            max_age: None,
            max_total_size: Some(1),
        })
        .open()?;

    for segment in 0..3u64 {
        for i in 0..20u64 {
            store.append(event(segment * 100 + i, segment * 100 + i))?;
        }
        store.seal_active()?;
    }

    let ids_before = store
        .catalog()
        .segments()?
        .iter()
        .map(|s| s.meta.id)
        .collect::<Vec<_>>();

    let report = store.retain()?;

    // Oldest first
    assert!(report
        .deleted
        .iter()
        .zip(&ids_before)
        .all(|(deleted, oldest)| deleted == oldest));
    assert!(!report.deleted.is_empty());

    Ok(())
}
