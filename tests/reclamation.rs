use vtrie::{reclaim, Arena, Epoch, TrieVersion};

// Single test: the counters are process wide.
#[test]
fn dropped_versions_are_reclaimed() {
    reclaim::flush();
    let live = reclaim::live_handles();
    let allocations = Arena::global().live_allocations();
    let bytes = Arena::global().in_use();

    let mut history = Vec::new();
    let mut v = TrieVersion::empty();
    for i in 0..500u32 {
        v = v.insert(Epoch(i as u64), format!("key-{i}").as_bytes()).unwrap();
        history.push(v.clone());
    }
    for i in (0..500u32).step_by(3) {
        v = v.remove(Epoch(1000 + i as u64), format!("key-{i}").as_bytes()).unwrap();
        history.push(v.clone());
    }
    assert!(reclaim::live_handles() > live);
    assert!(Arena::global().in_use() > bytes);

    // Old versions still read fine while newer ones are alive.
    assert!(history[10].contains(b"key-3"));
    assert!(!v.contains(b"key-3"));

    let clone = v.clone();
    drop(history);
    drop(v);
    reclaim::flush();
    // A clone keeps its version, and the nodes it reaches, alive.
    assert_eq!(reclaim::live_handles(), live + 1);
    assert!(clone.contains(b"key-4"));
    clone.check().unwrap();

    drop(clone);
    reclaim::flush();
    assert_eq!(reclaim::live_handles(), live);
    assert_eq!(Arena::global().live_allocations(), allocations);
    assert_eq!(Arena::global().in_use(), bytes);
    assert_eq!(reclaim::failures(), 0);
}
