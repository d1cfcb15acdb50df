use rand::prelude::*;
use spectre_store::{
    Config, Event, EventStore, QueryFilter, QueryRequest, ResourceIdentity, Verb,
};
use test_log::test;

const KINDS: &[&str] = &["Pod", "ConfigMap", "Deployment", "Service", "Secret"];
const NAMESPACES: &[&str] = &["default", "kube-system", "monitoring", "prod"];
const GROUPS: &[&str] = &["", "apps", "batch"];

fn random_events(n: usize, rng: &mut impl Rng) -> Vec<Event> {
    let mut ts = 1_000u64;

    (0..n)
        .map(|i| {
            ts += rng.random_range(0..3);

            Event::new(
                ResourceIdentity::builder()
                    .group(*GROUPS.choose(rng).unwrap_or(&""))
                    .version("v1")
                    .kind(*KINDS.choose(rng).unwrap_or(&"Pod"))
                    .namespace(*NAMESPACES.choose(rng).unwrap_or(&"default"))
                    .name(format!("res-{i}"))
                    .uid(format!("uid-{i}"))
                    .build(),
                ts,
                match rng.random_range(0..3) {
                    0 => Verb::Create,
                    1 => Verb::Update,
                    _ => Verb::Delete,
                },
                br#"{"status":{"phase":"Running"}}"#.to_vec(),
            )
        })
        .collect()
}

fn sort_key(event: &Event) -> (u64, String, u8) {
    (event.ts, event.identity.uid.clone(), event.verb as u8)
}

/// P1: writing a random event sequence and querying the full range
/// with empty filters returns exactly that sequence.
#[test]
fn roundtrip_full_range() -> spectre_store::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(&folder)
        .block_rows(64)
        .open()?;

    let mut rng = StdRng::seed_from_u64(42);
    let events = random_events(2_000, &mut rng);

    for (i, event) in events.iter().enumerate() {
        store.append(event.clone())?;

        // Several sealed segments plus an unsealed tail
        if i % 512 == 511 {
            store.seal_active()?;
        }
    }

    let result = store.query(
        &QueryRequest::range(0, u64::MAX).with_limit(10_000),
        None,
    )?;

    assert_eq!(events.len(), result.count);

    let mut expected = events.clone();
    expected.sort_by_key(sort_key);

    let got = result.events;

    // Result ordering is non-decreasing ts with deterministic tie-breaks
    for pair in got.windows(2) {
        if let [a, b] = pair {
            assert!(a.ts <= b.ts);
        }
    }

    let mut got_sorted = got;
    got_sorted.sort_by_key(sort_key);

    assert_eq!(expected, got_sorted);

    Ok(())
}

/// P2: for any filter F, query(E, F) equals the naive scan.
#[test]
fn filter_soundness() -> spectre_store::Result<()> {
    let folder = tempfile::tempdir()?;

    let store = Config::new(&folder)
        .block_rows(64)
        .open()?;

    let mut rng = StdRng::seed_from_u64(7);
    let events = random_events(1_500, &mut rng);

    for (i, event) in events.iter().enumerate() {
        store.append(event.clone())?;

        if i % 400 == 399 {
            store.seal_active()?;
        }
    }

    for _ in 0..20 {
        let kind_count = rng.random_range(0..3);
        let namespace_count = rng.random_range(0..2);
        let group_count = rng.random_range(0..2);

        let filter = QueryFilter {
            kinds: KINDS
                .choose_multiple(&mut rng, kind_count)
                .map(|s| (*s).to_owned())
                .collect(),
            namespaces: NAMESPACES
                .choose_multiple(&mut rng, namespace_count)
                .map(|s| (*s).to_owned())
                .collect(),
            groups: GROUPS
                .choose_multiple(&mut rng, group_count)
                .map(|s| (*s).to_owned())
                .collect(),
            ..Default::default()
        };

        let lo = rng.random_range(900..2_000);
        let hi = lo + rng.random_range(0..2_500);

        let result = store.query(
            &QueryRequest::range(lo, hi)
                .with_filters(filter.clone())
                .with_limit(10_000),
            None,
        )?;

        let mut expected = events
            .iter()
            .filter(|e| e.ts >= lo && e.ts <= hi && filter.matches(e))
            .cloned()
            .collect::<Vec<_>>();
        expected.sort_by_key(sort_key);

        let mut got = result.events;
        got.sort_by_key(sort_key);

        assert_eq!(expected, got, "filter {filter:?} over [{lo}, {hi}]");
    }

    Ok(())
}

/// Empty result is count=0, not an error.
#[test]
fn empty_range_is_not_an_error() -> spectre_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let store = Config::new(&folder).open()?;

    let result = store.query(&QueryRequest::range(1_000, 2_000), None)?;
    assert_eq!(0, result.count);
    assert!(result.events.is_empty());

    Ok(())
}
