//! Accounting and structural invariants under randomized operation mixes.

mod common;

use common::Harness;
use tiered_store::{hash_key, DefaultElementComparator, Element, SegmentConfig};

/// Deterministic PRNG so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn key_for(i: u64) -> Vec<u8> {
    format!("key-{i:02}").into_bytes()
}

#[test]
fn pool_conservation_under_random_operations() {
    // tight budgets so rejection paths run too
    let h = Harness::new(4096, 2048);
    let mut rng = Lcg(0x5eed);

    for step in 0..5_000u64 {
        let key = key_for(rng.next() % 24);
        let hash = hash_key(&key);
        let value = vec![b'x'; (rng.next() % 96) as usize];

        match rng.next() % 8 {
            0 | 1 => {
                h.segment
                    .put(&key, hash, Element::new(&key, &value), false, false);
            }
            2 => {
                h.segment
                    .put(&key, hash, Element::new(&key, &value), true, false);
            }
            3 => {
                h.segment
                    .remove(&key, hash, None, &DefaultElementComparator);
            }
            4 => {
                h.segment.evict(&key, hash, None, false);
            }
            5 => {
                h.segment
                    .replace_if_present(&key, hash, Element::new(&key, &value));
            }
            6 => {
                // spill to disk if currently heap-resident
                if let Some(expect) = h.segment.unretrieved_get(&key, hash) {
                    if !expect.is_disk_marker() {
                        let marker = h.disk.persist(Element::new(&key, &value));
                        h.segment.fault(&key, hash, &expect, marker, true);
                    }
                }
            }
            _ => {
                h.segment.get(&key, hash, false);
            }
        }

        if step % 1000 == 999 {
            assert_eq!(h.heap_pool.used_bytes(), h.live_heap_bytes(), "step {step}");
            assert_eq!(h.disk_pool.used_bytes(), h.live_disk_bytes(), "step {step}");
        }
    }

    // quiescent accounting: budgets match live entries, one free per create
    assert_eq!(h.heap_pool.used_bytes(), h.live_heap_bytes());
    assert_eq!(h.disk_pool.used_bytes(), h.live_disk_bytes());
    assert_eq!(
        h.disk.create_count(),
        h.disk.free_count() + h.segment.len()
    );
    assert_eq!(h.disk.double_free_count(), 0);

    h.segment.clear();
    assert_eq!(h.disk.create_count(), h.disk.free_count());
    assert_eq!(h.heap_pool.used_bytes(), 0);
    assert_eq!(h.disk_pool.used_bytes(), 0);
}

#[test]
fn faulted_entries_survive_eviction_storms() {
    let h = Harness::new(i64::MAX, i64::MAX);
    let mut rng = Lcg(7);

    for i in 0..16u64 {
        let key = key_for(i);
        h.segment.put(
            &key,
            hash_key(&key),
            Element::new(&key, b"v"),
            false,
            false,
        );
    }

    let mut faulted = Vec::new();
    for i in 0..16u64 {
        if rng.next() % 2 == 0 {
            let key = key_for(i);
            h.segment.get(&key, hash_key(&key), true);
            faulted.push(key);
        }
    }
    assert!(!faulted.is_empty());

    for _ in 0..4 {
        for i in 0..16u64 {
            let key = key_for(i);
            h.segment.evict(&key, hash_key(&key), None, false);
        }
    }

    assert_eq!(h.segment.len(), faulted.len());
    for key in &faulted {
        assert!(h.segment.contains_key(key, hash_key(key)));
        assert!(h.segment.is_faulted(key, hash_key(key)));
    }
}

#[test]
fn rehash_preserves_the_key_set() {
    let h = Harness::with_config(
        SegmentConfig::new().with_initial_capacity(4),
        i64::MAX,
        i64::MAX,
    );

    let mut expected: Vec<Vec<u8>> = (0..100u64).map(key_for).collect();
    for key in &expected {
        h.segment.put(
            key,
            hash_key(key),
            Element::new(key, b"v"),
            false,
            false,
        );
    }

    // several doublings later, iteration still yields exactly the inserted
    // keys
    let mut seen: Vec<Vec<u8>> = h.segment.iter().map(|e| e.key().to_vec()).collect();
    seen.sort();
    expected.sort();
    assert_eq!(seen, expected);

    for key in &expected {
        assert!(h.segment.contains_key(key, hash_key(key)));
    }
    assert_eq!(h.heap_pool.used_bytes(), h.live_heap_bytes());
}

#[test]
fn faulted_bit_is_shared_with_stale_chain_clones() {
    // chain edits clone prefix nodes, but clones share the faulted flag:
    // a snapshot taken before an edit must observe flags set afterwards
    let h = Harness::with_config(
        SegmentConfig::new().with_initial_capacity(4),
        i64::MAX,
        i64::MAX,
    );
    for i in 0..12u64 {
        let key = key_for(i);
        h.segment.put(
            &key,
            hash_key(&key),
            Element::new(&key, b"v"),
            false,
            false,
        );
    }

    let snapshot: Vec<_> = h.segment.iter().collect();

    // structural edits rebuild chain prefixes behind the snapshot's back
    for i in [2u64, 5, 9] {
        let key = key_for(i);
        h.segment
            .remove(&key, hash_key(&key), None, &DefaultElementComparator);
    }

    // raise every surviving entry's flag through the live table
    for i in 0..12u64 {
        let key = key_for(i);
        h.segment.get(&key, hash_key(&key), true);
    }

    // the stale snapshot nodes observe the same flags
    for entry in &snapshot {
        if h.segment.contains_key(entry.key(), entry.hash()) {
            assert!(entry.is_faulted(), "stale node missed the faulted bit");
        }
    }
}
