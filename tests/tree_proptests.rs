//! Property-based differential tests against `BTreeMap` as an oracle.
//!
//! Handles are derived injectively from keys so the oracle can predict
//! exact scan output. Duplicate keys are filtered out of the generated
//! workloads: the index appends duplicate keys rather than overwriting,
//! which no map oracle models.

use std::collections::BTreeMap;

use fastfair::BTree;
use proptest::prelude::*;

/// Injective key -> handle mapping that avoids the reserved null handle for
/// every generated key (only `i64::MIN`, excluded below, would map to it).
fn handle_for(key: i64) -> u64 {
    (key as u64) ^ 0x8000_0000_0000_0000
}

/// Strategy for workloads of unique keys across interesting magnitudes.
fn unique_keys(max_count: usize) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::hash_set(
        prop_oneof![
            4 => -1_000i64..1_000,
            2 => any::<i64>()
                .prop_filter("sentinel and null-handle keys", |&k| k != i64::MAX && k != i64::MIN),
            1 => Just(0i64),
        ],
        0..=max_count,
    )
    .prop_map(|set| set.into_iter().collect())
}

/// Oracle window with the index's strict bounds; `BTreeMap::range` rejects
/// an empty excluded-excluded window, the index just returns nothing.
fn oracle_range(oracle: &BTreeMap<i64, u64>, min: i64, max: i64) -> Vec<u64> {
    if min >= max {
        return Vec::new();
    }
    oracle
        .range((
            std::ops::Bound::Excluded(min),
            std::ops::Bound::Excluded(max),
        ))
        .map(|(_, &v)| v)
        .collect()
}

/// A mixed workload step.
#[derive(Debug, Clone)]
enum Op {
    Insert(i64),
    Delete(i64),
    Search(i64),
    Range(i64, i64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    let key = -200i64..200;
    prop::collection::vec(
        prop_oneof![
            4 => key.clone().prop_map(Op::Insert),
            2 => key.clone().prop_map(Op::Delete),
            2 => key.clone().prop_map(Op::Search),
            1 => (key.clone(), key).prop_map(|(a, b)| Op::Range(a.min(b), a.max(b))),
        ],
        0..=max_ops,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every inserted key is retrievable; absent keys are not.
    #[test]
    fn insert_then_search(keys in unique_keys(300), probe: i64) {
        let tree: BTree<8> = BTree::new();

        for &key in &keys {
            tree.insert(key, handle_for(key)).unwrap();
        }

        for &key in &keys {
            prop_assert_eq!(tree.search(key), Some(handle_for(key)));
        }

        if probe != i64::MAX && !keys.contains(&probe) {
            prop_assert_eq!(tree.search(probe), None);
        }

        prop_assert_eq!(tree.len(), keys.len());
        tree.check_invariants();
    }

    /// Deleting a subset leaves exactly the complement visible.
    #[test]
    fn delete_subset(keys in unique_keys(200), keep_modulus in 2usize..5) {
        let tree: BTree<8> = BTree::new();

        for &key in &keys {
            tree.insert(key, handle_for(key)).unwrap();
        }

        let mut survivors: Vec<i64> = Vec::new();
        for (i, &key) in keys.iter().enumerate() {
            if i % keep_modulus == 0 {
                survivors.push(key);
            } else {
                prop_assert!(tree.delete(key), "key {} was inserted", key);
            }
        }

        for &key in &keys {
            let expected = survivors.contains(&key).then(|| handle_for(key));
            prop_assert_eq!(tree.search(key), expected);
        }

        prop_assert_eq!(tree.len(), survivors.len());
        tree.check_invariants();
    }

    /// Range scans agree with the oracle's strict-bound window, in order.
    #[test]
    fn range_matches_oracle(keys in unique_keys(300), a: i64, b in -2_000i64..2_000) {
        let (min, max) = (a.min(b), a.max(b));

        let tree: BTree<8> = BTree::new();
        let mut oracle: BTreeMap<i64, u64> = BTreeMap::new();

        for &key in &keys {
            tree.insert(key, handle_for(key)).unwrap();
            oracle.insert(key, handle_for(key));
        }

        let mut buf: Vec<u64> = Vec::new();
        let n = tree.search_range(min, max, &mut buf);

        let expected: Vec<u64> = oracle_range(&oracle, min, max);

        prop_assert_eq!(n, expected.len());
        prop_assert_eq!(buf, expected);
    }

    /// A mixed sequential workload tracks the oracle exactly.
    #[test]
    fn mixed_workload_matches_oracle(ops in operations(400)) {
        let tree: BTree<4> = BTree::new();
        let mut oracle: BTreeMap<i64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key) => {
                    // Skip duplicates: the index appends rather than
                    // overwrites, which the oracle cannot model.
                    if !oracle.contains_key(&key) {
                        tree.insert(key, handle_for(key)).unwrap();
                        oracle.insert(key, handle_for(key));
                    }
                }

                Op::Delete(key) => {
                    let removed = tree.delete(key);
                    prop_assert_eq!(removed, oracle.remove(&key).is_some());
                }

                Op::Search(key) => {
                    prop_assert_eq!(tree.search(key), oracle.get(&key).copied());
                }

                Op::Range(min, max) => {
                    let mut buf: Vec<u64> = Vec::new();
                    tree.search_range(min, max, &mut buf);
                    prop_assert_eq!(buf, oracle_range(&oracle, min, max));
                }
            }
        }

        prop_assert_eq!(tree.len(), oracle.len());
        tree.check_invariants();
    }

    /// Insertion order never changes the final tree contents.
    #[test]
    fn insertion_order_irrelevant(keys in unique_keys(150)) {
        let forward: BTree<8> = BTree::new();
        let reverse: BTree<8> = BTree::new();

        for &key in &keys {
            forward.insert(key, handle_for(key)).unwrap();
        }
        for &key in keys.iter().rev() {
            reverse.insert(key, handle_for(key)).unwrap();
        }

        let mut a: Vec<u64> = Vec::new();
        let mut b: Vec<u64> = Vec::new();
        forward.search_range(i64::MIN, i64::MAX, &mut a);
        reverse.search_range(i64::MIN, i64::MAX, &mut b);

        prop_assert_eq!(a, b);
    }
}
