//! End-to-end scenarios for RadixDB through the public driver surface.

use radixdb::{Config, DataManager, ABSENT};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::TempDir;

// 96-byte pages: leaves hold 4 pairs, inner nodes 3 keys, so a handful of
// inserts already exercises splits and merges.
const PAGE_SIZE: usize = 96;

fn open(dir: &TempDir, cache: bool) -> DataManager<PAGE_SIZE> {
    let config = Config {
        buffer_pool_size: 5,
        cache,
        cache_budget_bytes: 1 << 20,
        data_dir: dir.path().to_string_lossy().into_owned(),
    };
    DataManager::new(&config).unwrap()
}

#[test]
fn ascending_inserts_full_range_retrieval() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    for i in -20..=20 {
        db.insert(i, i).unwrap();
    }
    db.insert(i64::MIN + 1, i64::MIN + 1).unwrap();
    db.insert(i64::MAX, i64::MAX).unwrap();

    assert_eq!(db.get_value(i64::MIN + 1).unwrap(), i64::MIN + 1);
    assert_eq!(db.get_value(i64::MAX).unwrap(), i64::MAX);
    for i in -20..=20 {
        assert_eq!(db.get_value(i).unwrap(), i);
    }
    assert!(db.validate(43).unwrap());
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn repeated_same_key() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    for _ in 0..20 {
        db.insert(1, 1).unwrap();
    }
    assert_eq!(db.get_value(1).unwrap(), 1);
    assert!(db.validate(20).unwrap());
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn delete_to_root_collapse() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    for i in 1..=5 {
        db.insert(i * 2, i * 2).unwrap();
    }
    db.delete_value(4).unwrap();
    db.delete_value(6).unwrap();
    for k in [2, 8, 10] {
        assert_eq!(db.get_value(k).unwrap(), k);
    }
    for k in [4, 6] {
        assert_eq!(db.get_value(k).unwrap(), ABSENT);
    }
    assert!(db.validate(3).unwrap());
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn cross_leaf_merge_then_lookup() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    for i in 1..=7 {
        db.insert(i * 2, i * 2).unwrap();
    }
    db.delete_value(2).unwrap();
    assert_eq!(db.get_value(2).unwrap(), ABSENT);
    for k in [4, 6, 8, 10, 12, 14] {
        assert_eq!(db.get_value(k).unwrap(), k);
    }
    assert!(db.validate(6).unwrap());
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn byte_level_path_compression_keys() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    let keys: Vec<i64> = std::iter::once(0)
        .chain((1..8).map(|m| 1i64 << (8 * m)))
        .chain([(1i64 << 56) | (1 << 24)])
        .collect();
    for &k in &keys {
        db.insert(k, k + 1).unwrap();
    }
    // the two largest keys share seven prefix bytes; the second lookup is
    // served through the compressed cache path
    assert_eq!(db.get_value((1i64 << 56) | (1 << 24)).unwrap(), ((1i64 << 56) | (1 << 24)) + 1);
    for &k in &keys {
        assert_eq!(db.get_value(k).unwrap(), k + 1);
    }
    assert!(db.validate(keys.len()).unwrap());
}

#[test]
fn cache_entries_survive_or_fall_through_after_splits() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    // dense inserts force a cascade of leaf splits behind the cached hints
    for i in 0..200 {
        db.insert(i, i * 5).unwrap();
    }
    for i in 0..200 {
        assert_eq!(db.get_value(i).unwrap(), i * 5);
    }
    assert!(db.validate(200).unwrap());
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn round_trip_random_insert_delete_orders() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut keys: Vec<i64> = (0..120).map(|i| i * 31 - 1800).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        db.insert(k, !k).unwrap();
    }
    assert!(db.validate(keys.len()).unwrap());

    let (gone, live) = keys.split_at(60);
    let mut gone = gone.to_vec();
    gone.shuffle(&mut rng);
    for &k in &gone {
        db.delete_value(k).unwrap();
    }
    for &k in &gone {
        assert_eq!(db.get_value(k).unwrap(), ABSENT);
    }
    for &k in live {
        assert_eq!(db.get_value(k).unwrap(), !k);
    }
    assert!(db.validate(live.len()).unwrap());
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn updates_stick_after_rebalancing() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    for i in 0..60 {
        db.insert(i, 0).unwrap();
    }
    for i in 0..60 {
        db.update(i, i + 1000).unwrap();
    }
    for i in (0..60).step_by(4) {
        db.delete_value(i).unwrap();
    }
    for i in 0..60 {
        let expected = if i % 4 == 0 { ABSENT } else { i + 1000 };
        assert_eq!(db.get_value(i).unwrap(), expected);
    }
    assert!(db.validate(45).unwrap());
}

#[test]
fn scan_matches_xor_of_inserted_values() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir, true);
    let values: Vec<i64> = (0i64..40).map(|i| (i * 2654435761) ^ (i << 7)).collect();
    for (i, v) in values.iter().enumerate() {
        db.insert(i as i64, *v).unwrap();
    }
    for start in [0usize, 1, 17, 39] {
        for range in [0usize, 1, 5, 40] {
            let end = (start + range).min(values.len());
            let expected = values[start..end].iter().fold(0i64, |a, v| a ^ v);
            let expected = if expected == ABSENT { ABSENT + 1 } else { expected };
            assert_eq!(db.scan(start as i64, range).unwrap(), expected);
        }
    }
    assert_eq!(db.scan(-1, 4).unwrap(), ABSENT);
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn tiny_buffer_pool_keeps_answers_correct() {
    let dir = TempDir::new().unwrap();
    // constant eviction pressure: cached hints go stale as frames drop
    // out of the pool, so most reads must fall through and self-heal
    let config = Config {
        buffer_pool_size: 3,
        cache: true,
        cache_budget_bytes: 1 << 20,
        data_dir: dir.path().to_string_lossy().into_owned(),
    };
    let mut db: DataManager<PAGE_SIZE> = DataManager::new(&config).unwrap();
    for i in 0..100 {
        db.insert(i, i ^ 0x5a5a).unwrap();
    }
    for i in 0..100 {
        assert_eq!(db.get_value(i).unwrap(), i ^ 0x5a5a);
    }
    assert!(db.validate(100).unwrap());
    assert!(db.buffer_len() <= 3);
    assert_eq!(db.pinned_pages(), 0);
}

#[test]
fn zero_budget_cache_degrades_to_plain_tree() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        buffer_pool_size: 5,
        cache: true,
        cache_budget_bytes: 0,
        data_dir: dir.path().to_string_lossy().into_owned(),
    };
    let mut db: DataManager<PAGE_SIZE> = DataManager::new(&config).unwrap();
    for i in 0..30 {
        db.insert(i, i).unwrap();
    }
    assert_eq!(db.cache_size(), 0);
    for i in 0..30 {
        assert_eq!(db.get_value(i).unwrap(), i);
    }
    assert!(db.validate(30).unwrap());
}
