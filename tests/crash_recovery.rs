use spectre_store::{Config, Event, EventStore, QueryRequest, ResourceIdentity, Verb};
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

/// S5 and P8: dying with an unsealed segment loses only the unsealed
/// tail; sealed history is intact and queries never fail.
#[test]
fn crash_mid_segment_keeps_sealed_history() -> spectre_store::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(&folder).open()?;

        // Sealed history
        for i in 0..50u64 {
            store.append(event(i, i))?;
        }
        store.seal_active()?;

        // Unsealed tail, flushed to the .tmp file but never sealed
        for i in 50..150u64 {
            store.append(event(i, i))?;
        }
        store.flush()?;

        // Simulated crash: the store is dropped without seal
    }

    let store = Config::new(&folder).open()?;

    // The unfinished file was cleaned up
    let has_tmp = std::fs::read_dir(&folder)?
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().ends_with(".tmp"));
    assert!(!has_tmp);

    // Sealed history intact, tail possibly gone, query never fails
    let result = store.query(&QueryRequest::range(0, 1_000).with_limit(10_000), None)?;
    assert_eq!(50, result.count);

    let tail = store.query(&QueryRequest::range(50, 1_000), None)?;
    assert_eq!(0, tail.count);

    Ok(())
}

/// Appending after recovery starts a fresh segment id; old ids are
/// never reused.
#[test]
fn recovery_does_not_reuse_segment_ids() -> spectre_store::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(&folder).open()?;
        store.append(event(1, 1))?;
        store.seal_active()?;
    }

    {
        let store = Config::new(&folder).open()?;
        store.append(event(2, 2))?;
        store.seal_active()?;
    }

    let store = Config::new(&folder).open()?;
    assert_eq!(2, store.catalog().len()?);

    let ids = store
        .catalog()
        .segments()?
        .iter()
        .map(|s| s.meta.id)
        .collect::<Vec<_>>();

    assert_eq!(2, ids.len());
    assert_ne!(ids.first(), ids.get(1));

    Ok(())
}

/// A graceful stop seals the open segment, so nothing is lost.
#[test]
fn graceful_stop_seals_everything() -> spectre_store::Result<()> {
    use spectre_store::Component;

    let folder = tempfile::tempdir()?;

    {
        let store = Config::new(&folder).open()?;

        for i in 0..30u64 {
            store.append(event(i, i))?;
        }

        store.stop(std::time::Duration::from_secs(10))?;
    }

    let store = Config::new(&folder).open()?;
    let result = store.query(&QueryRequest::range(0, 1_000), None)?;
    assert_eq!(30, result.count);

    Ok(())
}
