//! Property-based tests for the radix tree engine.
//!
//! Differential testing against `BTreeMap`: after any sequence of puts,
//! deletes and find-or-creates, point reads and range scans must agree with
//! the oracle.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use famstore_core::{
    EngineConfig, EngineError, EngineMetrics, MemoryManager, RadixTreeEngine, TagGptr, MAX_KEY_LEN,
};
use proptest::prelude::*;

// ============================================================================
//  Helpers and strategies
// ============================================================================

fn engine() -> RadixTreeEngine {
    let mut config = EngineConfig::small();
    config.heap_size_bytes = 8 * 1024 * 1024;
    RadixTreeEngine::open(&MemoryManager::new(), config, None, Arc::new(EngineMetrics::new())).unwrap()
}

/// Keys over a tiny alphabet so prefixes collide and paths split often.
fn key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c', 0u8, 0xff]), 0..=6)
}

fn long_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=MAX_KEY_LEN)
}

fn value() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=48)
}

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
    FindOrCreate(Vec<u8>, Vec<u8>),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (key(), value()).prop_map(|(k, v)| Op::Put(k, v)),
            2 => key().prop_map(Op::Del),
            1 => (key(), value()).prop_map(|(k, v)| Op::FindOrCreate(k, v)),
        ],
        0..=max_ops,
    )
}

fn apply(engine: &RadixTreeEngine, oracle: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: &Op) {
    match op {
        Op::Put(k, v) => {
            engine.put(k, v).unwrap();
            oracle.insert(k.clone(), v.clone());
        }
        Op::Del(k) => {
            let expected = oracle.remove(k);
            match engine.del(k) {
                Ok(()) => assert!(expected.is_some()),
                Err(EngineError::NotFound) => assert!(expected.is_none()),
                Err(e) => panic!("del failed: {e}"),
            }
        }
        Op::FindOrCreate(k, v) => {
            let got = engine.find_or_create(k, v).unwrap();
            let expected = oracle.entry(k.clone()).or_insert_with(|| v.clone());
            assert_eq!(&got, expected);
        }
    }
}

fn scan_all(
    engine: &RadixTreeEngine,
    begin: &[u8],
    bi: bool,
    end: &[u8],
    ei: bool,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine.scan_iter(begin, bi, end, ei).unwrap().map(|r| r.unwrap()).collect()
}

fn oracle_range(
    oracle: &BTreeMap<Vec<u8>, Vec<u8>>,
    begin: &[u8],
    bi: bool,
    end: &[u8],
    ei: bool,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let lo = match (begin.is_empty(), bi) {
        (true, _) => Bound::Unbounded,
        (false, true) => Bound::Included(begin.to_vec()),
        (false, false) => Bound::Excluded(begin.to_vec()),
    };
    let hi = match (end.is_empty(), ei) {
        (true, _) => Bound::Unbounded,
        (false, true) => Bound::Included(end.to_vec()),
        (false, false) => Bound::Excluded(end.to_vec()),
    };
    // BTreeMap::range panics on inverted bounds; an inverted range is empty
    if let (Bound::Included(l) | Bound::Excluded(l), Bound::Included(h) | Bound::Excluded(h)) = (&lo, &hi) {
        let empty_point = l == h && !(bi && ei);
        if l > h || empty_point {
            return Vec::new();
        }
    }
    oracle.range((lo, hi)).map(|(k, v)| (k.clone(), v.clone())).collect()
}

// ============================================================================
//  Point operations
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Point reads agree with the oracle after any operation sequence.
    #[test]
    fn matches_btreemap(ops in operations(64), lookups in prop::collection::vec(key(), 0..16)) {
        let engine = engine();
        let mut oracle = BTreeMap::new();
        for op in &ops {
            apply(&engine, &mut oracle, op);
        }
        for k in oracle.keys().chain(lookups.iter()) {
            match (engine.get(k), oracle.get(k)) {
                (Ok(v), Some(expected)) => prop_assert_eq!(&v, expected),
                (Err(EngineError::NotFound), None) => {}
                (got, expected) => prop_assert!(false, "key {:?}: {:?} vs {:?}", k, got, expected),
            }
        }
    }

    /// Arbitrary bytes up to the maximum key length round-trip.
    #[test]
    fn full_length_keys(entries in prop::collection::vec((long_key(), value()), 1..24)) {
        let engine = engine();
        let mut oracle = BTreeMap::new();
        for (k, v) in &entries {
            engine.put(k, v).unwrap();
            oracle.insert(k.clone(), v.clone());
        }
        for (k, v) in &oracle {
            prop_assert_eq!(&engine.get(k).unwrap(), v);
        }
        prop_assert_eq!(scan_all(&engine, b"", true, b"", true), oracle_range(&oracle, b"", true, b"", true));
    }

    /// Tags strictly advance on every change to a slot.
    #[test]
    fn tags_advance(values in prop::collection::vec(value(), 1..20)) {
        let engine = engine();
        let mut last: Option<TagGptr> = None;
        for v in &values {
            let (_, tagged) = engine.put_tracked(b"slot", v).unwrap();
            if let Some(prev) = last {
                prop_assert_eq!(tagged.tag(), prev.tag() + 1);
            }
            last = Some(tagged);
        }
    }
}

// ============================================================================
//  Range scans
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Scans return exactly the oracle's range, ascending.
    #[test]
    fn scan_matches_range(
        ops in operations(48),
        begin in key(),
        bi: bool,
        end in key(),
        ei: bool,
    ) {
        let engine = engine();
        let mut oracle = BTreeMap::new();
        for op in &ops {
            apply(&engine, &mut oracle, op);
        }
        let got = scan_all(&engine, &begin, bi, &end, ei);
        let expected = oracle_range(&oracle, &begin, bi, &end, ei);
        prop_assert_eq!(got, expected);
        prop_assert_eq!(engine.live_iterators(), 0);
    }
}
