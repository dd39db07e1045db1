use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};

use vtrie::{Arena, BufferPool, Direction, Epoch, Reducible, TrieError, TrieVersion};

fn sample() -> TrieVersion {
    [&b"ab"[..], b"abc", b"abd", b"b", b"a"]
        .into_iter()
        .enumerate()
        .fold(TrieVersion::empty(), |v, (i, k)| {
            v.insert(Epoch(i as u64), k).unwrap()
        })
}

fn keys(version: &TrieVersion, pool: &BufferPool, prefix: &[u8], direction: Direction) -> Vec<Vec<u8>> {
    version
        .seek_in(pool, prefix, direction)
        .unwrap()
        .collect_keys()
        .unwrap()
}

#[test]
fn forward_and_backward() {
    let v = sample();
    let pool = BufferPool::new(64);
    assert_eq!(
        keys(&v, &pool, b"ab", Direction::Forward),
        vec![b"ab".to_vec(), b"abc".to_vec(), b"abd".to_vec()]
    );
    assert_eq!(
        keys(&v, &pool, b"ab", Direction::Backward),
        vec![b"abd".to_vec(), b"abc".to_vec(), b"ab".to_vec()]
    );
    assert_eq!(
        keys(&v, &pool, b"", Direction::Forward),
        vec![
            b"a".to_vec(),
            b"ab".to_vec(),
            b"abc".to_vec(),
            b"abd".to_vec(),
            b"b".to_vec()
        ]
    );
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn prefix_inside_an_infix() {
    let v = TrieVersion::empty()
        .insert(Epoch(1), b"prefix-long-one")
        .unwrap()
        .insert(Epoch(2), b"prefix-long-two")
        .unwrap();
    let pool = BufferPool::new(64);
    assert_eq!(keys(&v, &pool, b"prefix-lo", Direction::Forward).len(), 2);
    assert_eq!(
        keys(&v, &pool, b"prefix-long-t", Direction::Backward),
        vec![b"prefix-long-two".to_vec()]
    );
    assert!(keys(&v, &pool, b"prefix-short", Direction::Forward).is_empty());
}

#[test]
fn early_termination_releases_everything() {
    let v = sample();
    let pool = BufferPool::new(64);
    let mut seen = 0;
    let first = v
        .seek_in(&pool, b"ab", Direction::Forward)
        .unwrap()
        .reduce(Vec::new(), |_, key| {
            seen += 1;
            ControlFlow::Break(key.to_vec())
        })
        .unwrap();
    assert_eq!(first, b"ab");
    assert_eq!(seen, 1);

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.output, 1);
    assert_eq!(stats.cursor, 1);
    assert_eq!(stats.key, 1);
    assert_eq!(stats.released, stats.allocated());
}

#[test]
fn no_match_allocates_no_cursor() {
    let v = sample();
    let pool = BufferPool::new(64);
    let count = v
        .seek_in(&pool, b"zzz", Direction::Backward)
        .unwrap()
        .count_keys()
        .unwrap();
    assert_eq!(count, 0);
    let stats = pool.stats();
    assert_eq!(stats.cursor, 0);
    assert_eq!(stats.output, 0);
    assert_eq!(stats.outstanding, 0);

    let empty = TrieVersion::empty();
    assert_eq!(empty.seek_in(&pool, b"", Direction::Forward).unwrap().first_key().unwrap(), None);
    assert_eq!(pool.stats().cursor, 0);
}

#[test]
fn step_error_releases_buffers() {
    let v = sample();
    let pool = BufferPool::new(64);
    let err = v
        .seek_in(&pool, b"", Direction::Forward)
        .unwrap()
        .try_reduce(0, |n, key| {
            if key == b"abc" {
                Err(std::io::Error::other("stop here"))
            } else {
                Ok(ControlFlow::Continue(n + 1))
            }
        })
        .unwrap_err();
    match err {
        TrieError::Consumer(source) => assert_eq!(source.to_string(), "stop here"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn panicking_step_releases_buffers() {
    let v = sample();
    let pool = BufferPool::new(64);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        v.seek_in(&pool, b"a", Direction::Backward)
            .unwrap()
            .reduce((), |(), _| panic!("step blew up"))
    }));
    assert!(outcome.is_err());
    assert_eq!(pool.outstanding(), 0);
    let stats = pool.stats();
    assert_eq!(stats.released, stats.allocated());
}

#[test]
fn cursor_pulls_keys() {
    let v = sample();
    let pool = BufferPool::new(64);
    let mut cursor = v.seek_in(&pool, b"ab", Direction::Forward).unwrap().open().unwrap();
    let first = cursor.try_advance().unwrap().unwrap();
    assert_eq!(&first[..], b"ab");
    let second = cursor.try_advance().unwrap().unwrap();
    assert_eq!(&second[..], b"abc");
    // Keys stay valid independently of each other until released.
    assert_eq!(pool.outstanding(), 3);
    first.release().unwrap();
    second.release().unwrap();
    cursor.close().unwrap();
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn exhausted_cursor_gives_back_its_state() {
    let v = sample();
    let pool = BufferPool::new(64);
    let mut cursor = v.seek_in(&pool, b"b", Direction::Forward).unwrap().open().unwrap();
    cursor.try_advance().unwrap().unwrap().release().unwrap();
    assert!(cursor.try_advance().unwrap().is_none());
    assert!(cursor.is_exhausted());
    assert_eq!(pool.outstanding(), 0);
    assert!(cursor.try_advance().unwrap().is_none());
}

#[test]
fn keys_longer_than_the_pool_output_len() {
    let v = TrieVersion::empty()
        .insert(Epoch(1), b"abcdef")
        .unwrap()
        .insert(Epoch(2), b"abcdefghijkl")
        .unwrap();
    let pool = BufferPool::new(2);
    assert_eq!(
        keys(&v, &pool, b"", Direction::Forward),
        vec![b"abcdef".to_vec(), b"abcdefghijkl".to_vec()]
    );
    assert_eq!(
        keys(&v, &pool, b"abc", Direction::Backward),
        vec![b"abcdefghijkl".to_vec(), b"abcdef".to_vec()]
    );
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn cursor_state_is_sized_by_the_keys_below_the_prefix() {
    // Far less than a buffer of the maximum key length.
    static ARENA: Arena = Arena::with_capacity(256);
    let pool = BufferPool::with_arena(&ARENA, 16);
    let v = sample();
    assert_eq!(
        keys(&v, &pool, b"", Direction::Backward),
        vec![
            b"b".to_vec(),
            b"abd".to_vec(),
            b"abc".to_vec(),
            b"ab".to_vec(),
            b"a".to_vec()
        ]
    );
    assert_eq!(pool.stats().cursor, 1);
    assert_eq!(ARENA.in_use(), 0);
}
