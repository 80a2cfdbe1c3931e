use occ_map::{Conflict, OccMap, Stamped, VersionConflict, WriteOutcome};

type Map = OccMap<&'static str, Stamped<&'static str>>;

#[test]
fn test_newer_version_wins() {
    let map = Map::new();
    map.put("k", Stamped::new("v1", 1)).unwrap();
    assert_eq!(map.put("k", Stamped::new("v2", 2)), Ok(Some(Stamped::new("v1", 1))));
    assert_eq!(map.get("k"), Some(Stamped::new("v2", 2)));
}

#[test]
fn test_stale_or_equal_version_conflicts() {
    let map = Map::new();
    map.put("k", Stamped::new("v1", 1)).unwrap();

    let err = map.put("k", Stamped::new("v0", 0)).unwrap_err();
    assert_eq!(
        err,
        VersionConflict {
            key: "k",
            existing: 1,
            attempted: 0
        }
    );
    assert_eq!(map.get("k"), Some(Stamped::new("v1", 1)));

    let err = map.put("k", Stamped::new("other", 1)).unwrap_err();
    assert_eq!((err.existing, err.attempted), (1, 1));
    assert_eq!(map.get("k"), Some(Stamped::new("v1", 1)));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_try_put_returns_both_values() {
    let map = Map::new();
    assert_eq!(
        map.try_put("k", Stamped::new("v3", 3)),
        WriteOutcome::Accepted(None)
    );
    let outcome = map.try_put("k", Stamped::new("late", 2));
    assert!(!outcome.is_accepted());
    assert_eq!(
        outcome,
        WriteOutcome::Conflict(Conflict {
            existing: Stamped::new("v3", 3),
            attempted: Stamped::new("late", 2),
        })
    );
}

#[test]
fn test_replace_is_gated() {
    let map = Map::new();
    map.put("k", Stamped::new("v1", 1)).unwrap();
    let err = map.replace("k", Stamped::new("v0", 0)).unwrap_err();
    assert_eq!((err.key, err.existing, err.attempted), ("k", 1, 0));
    assert_eq!(map.get("k"), Some(Stamped::new("v1", 1)));

    assert!(matches!(
        map.try_replace("k", Stamped::new("v0", 0)),
        WriteOutcome::Conflict(_)
    ));
    assert_eq!(
        map.try_replace("missing", Stamped::new("x", 9)),
        WriteOutcome::Accepted(None)
    );
    assert!(!map.contains_key("missing"));
}

#[test]
fn test_replace_if_needs_match_and_newer_version() {
    let map = Map::new();
    map.put("k", Stamped::new("a", 1)).unwrap();

    // Value mismatch.
    assert!(!map.replace_if("k", &Stamped::new("b", 1), Stamped::new("c", 2)));
    // Version not newer.
    assert!(!map.replace_if("k", &Stamped::new("a", 1), Stamped::new("c", 1)));
    assert_eq!(map.get("k"), Some(Stamped::new("a", 1)));

    assert!(map.replace_if("k", &Stamped::new("a", 1), Stamped::new("c", 2)));
    assert_eq!(map.get("k"), Some(Stamped::new("c", 2)));

    assert!(!map.replace_if("missing", &Stamped::new("a", 1), Stamped::new("c", 2)));
}

#[test]
fn test_put_if_absent_ignores_versions() {
    let map = Map::new();
    assert_eq!(map.put_if_absent("k", Stamped::new("a", 5)), None);
    assert_eq!(
        map.put_if_absent("k", Stamped::new("b", 9)),
        Some(Stamped::new("a", 5))
    );
    assert_eq!(
        map.put_if_absent("k", Stamped::new("c", 0)),
        Some(Stamped::new("a", 5))
    );
    assert_eq!(map.get("k"), Some(Stamped::new("a", 5)));
}

#[test]
fn test_remove_resets_version_floor() {
    let map = Map::new();
    map.put("k", Stamped::new("high", 100)).unwrap();
    assert_eq!(map.remove("k"), Some(Stamped::new("high", 100)));
    assert_eq!(map.put("k", Stamped::new("low", 1)), Ok(None));
    assert_eq!(map.get("k"), Some(Stamped::new("low", 1)));

    // Same through remove_if.
    assert!(map.remove_if("k", &Stamped::new("low", 1)));
    assert_eq!(map.put("k", Stamped::new("lower", 0)), Ok(None));
}

#[test]
fn test_remove_ignores_version_of_stored_value() {
    let map = Map::new();
    map.put("k", Stamped::new("v", u64::MAX)).unwrap();
    assert!(map.remove("k").is_some());
    assert!(map.is_empty());
}

#[test]
fn test_error_display() {
    let map = Map::new();
    map.put("key", Stamped::new("v", 4)).unwrap();
    let err = map.put("key", Stamped::new("v", 2)).unwrap_err();
    assert_eq!(
        err.to_string(),
        "version conflict on key \"key\": existing version 4, attempted version 2"
    );
}
