#![cfg(test)]

// Property tests for ShmHashMap kept inside the crate so they can build
// anonymous-segment tables without a public test-only surface.

use crate::shm_hash_map::{Error, ShmHashMap};
use proptest::prelude::*;
use std::collections::HashMap;

const CAPACITY: usize = 16;

// Key space deliberately larger than capacity so sequences hit the
// table-full path as well as plain collisions.
const KEY_SPACE: u8 = 24;

#[derive(Clone, Debug)]
enum Op {
    Set(u8, u64),
    Remove(u8),
    Get(u8),
    Contains(u8),
    Clear,
    IterateKeys,
    Snapshot,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        4 => (0..KEY_SPACE, any::<u64>()).prop_map(|(k, v)| Op::Set(k, v)),
        2 => (0..KEY_SPACE).prop_map(Op::Remove),
        2 => (0..KEY_SPACE).prop_map(Op::Get),
        1 => (0..KEY_SPACE).prop_map(Op::Contains),
        1 => Just(Op::Clear),
        1 => Just(Op::IterateKeys),
        1 => Just(Op::Snapshot),
    ];
    proptest::collection::vec(op, 1..80)
}

fn fresh_table() -> ShmHashMap<u64, u64> {
    ShmHashMap::builder()
        .capacity(CAPACITY)
        .unsynchronized()
        .create_anon()
        .expect("anonymous table")
}

// Property: State-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - `set` succeeds exactly when the key is present or a slot is free;
//   a failure is always `CapacityExceeded` on a full table with an absent
//   key, and changes nothing.
// - `get`/`contains_key`/`remove` parity with the model.
// - Iteration and `snapshot` yield exactly the model's key set under
//   exclusive access.
// - `len` parity after every operation.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine(ops in arb_ops()) {
        let table = fresh_table();
        let mut model: HashMap<u64, u64> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    let k = k as u64;
                    match table.set(k, v) {
                        Ok(()) => {
                            model.insert(k, v);
                        }
                        Err(Error::CapacityExceeded { capacity }) => {
                            prop_assert_eq!(capacity, CAPACITY);
                            prop_assert_eq!(model.len(), CAPACITY, "full-table error on a non-full table");
                            prop_assert!(!model.contains_key(&k));
                        }
                        Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {e}"))),
                    }
                }
                Op::Remove(k) => {
                    let k = k as u64;
                    prop_assert_eq!(table.remove(&k).unwrap(), model.remove(&k));
                }
                Op::Get(k) => {
                    let k = k as u64;
                    prop_assert_eq!(table.get(&k), model.get(&k).copied());
                }
                Op::Contains(k) => {
                    let k = k as u64;
                    prop_assert_eq!(table.contains_key(&k), model.contains_key(&k));
                }
                Op::Clear => {
                    table.clear().unwrap();
                    model.clear();
                }
                Op::IterateKeys => {
                    let mut got: Vec<u64> = table.keys().collect();
                    got.sort_unstable();
                    let mut want: Vec<u64> = model.keys().copied().collect();
                    want.sort_unstable();
                    prop_assert_eq!(got, want);
                }
                Op::Snapshot => {
                    let mut got = table.snapshot().unwrap();
                    got.sort_unstable();
                    let mut want: Vec<(u64, u64)> =
                        model.iter().map(|(&k, &v)| (k, v)).collect();
                    want.sort_unstable();
                    prop_assert_eq!(got, want);
                }
            }
            prop_assert_eq!(table.len(), model.len());
            prop_assert_eq!(table.is_empty(), model.is_empty());
        }
    }

    // Property: backward-shift deletion preserves every surviving key.
    // Fill a capacity-N table with N-1 distinct keys, delete an arbitrary
    // subset, and require every survivor to still round-trip. This is the
    // load pattern where a tombstone-free delete has to relocate across
    // merged and wrapped probe chains.
    #[test]
    fn prop_survivors_outlive_deletions(
        keys in prop::collection::hash_set(any::<u64>(), CAPACITY - 1),
        mask in any::<u32>(),
    ) {
        let table = fresh_table();
        let keys: Vec<u64> = keys.into_iter().collect();
        for (i, &k) in keys.iter().enumerate() {
            table.set(k, i as u64).unwrap();
        }

        let mut removed = 0;
        for (i, &k) in keys.iter().enumerate() {
            if mask & (1 << i) != 0 {
                prop_assert_eq!(table.remove(&k).unwrap(), Some(i as u64));
                removed += 1;
            }
        }

        prop_assert_eq!(table.len(), keys.len() - removed);
        for (i, &k) in keys.iter().enumerate() {
            if mask & (1 << i) != 0 {
                prop_assert_eq!(table.get(&k), None);
            } else {
                prop_assert_eq!(table.get(&k), Some(i as u64), "lost surviving key {}", k);
            }
        }
    }

    // Property: interleaved deletes and re-inserts never strand a key.
    // After any prefix of operations the table still agrees with a model,
    // exercising relocation chains that form when freed slots are reused.
    #[test]
    fn prop_delete_reinsert_churn(
        seed_keys in prop::collection::vec(0u64..12, 8..=8),
        churn in prop::collection::vec((0u64..12, any::<bool>()), 0..48),
    ) {
        let table = fresh_table();
        let mut model: HashMap<u64, u64> = HashMap::new();
        for &k in &seed_keys {
            table.set(k, k).unwrap();
            model.insert(k, k);
        }
        for (k, insert) in churn {
            if insert {
                table.set(k, k + 1000).unwrap();
                model.insert(k, k + 1000);
            } else {
                prop_assert_eq!(table.remove(&k).unwrap(), model.remove(&k));
            }
            for candidate in 0u64..12 {
                prop_assert_eq!(table.get(&candidate), model.get(&candidate).copied());
            }
        }
    }
}
