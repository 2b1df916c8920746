//! Property tests for the draw: generated assignments are derangements and
//! their cycle chains replay back to the same mapping.

use std::collections::{HashMap, HashSet};

use draw_core::{build_chain, generate, ChainError, DEFAULT_ATTEMPT_LIMIT};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn participants(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("p{i}")).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: every eligible participant gives exactly once, receives
    /// exactly once, and never to themselves.
    #[test]
    fn prop_generate_is_derangement(n in 2usize..40, seed in any::<u64>()) {
        let eligible = participants(n);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let assignment = generate(&eligible, DEFAULT_ATTEMPT_LIMIT, &mut rng).unwrap();

        prop_assert_eq!(assignment.len(), n);
        let givers: HashSet<&String> = assignment.as_map().keys().collect();
        let receivers: HashSet<&String> = assignment.as_map().values().collect();
        let expected: HashSet<&String> = eligible.iter().collect();
        prop_assert_eq!(&givers, &expected);
        prop_assert_eq!(&receivers, &expected);
        for (giver, receiver) in assignment.iter() {
            prop_assert_ne!(giver, receiver);
        }
    }

    /// Property: the chain covers each giver once, splits into cycles of
    /// length >= 2 that close on themselves, and replays to the mapping.
    #[test]
    fn prop_chain_replays_assignment(n in 2usize..40, seed in any::<u64>()) {
        let eligible = participants(n);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let assignment = generate(&eligible, DEFAULT_ATTEMPT_LIMIT, &mut rng).unwrap();
        let chain = assignment.chain().unwrap();

        prop_assert_eq!(chain.len(), n);
        let givers: HashSet<&String> = chain.links().iter().map(|l| &l.giver).collect();
        prop_assert_eq!(givers.len(), n);

        let mut total = 0;
        for cycle in chain.cycles() {
            prop_assert!(cycle.len() >= 2);
            for pair in cycle.windows(2) {
                prop_assert_eq!(&pair[0].receiver, &pair[1].giver);
            }
            let first = &cycle[0];
            let last = &cycle[cycle.len() - 1];
            prop_assert_eq!(&last.receiver, &first.giver);
            total += cycle.len();
        }
        prop_assert_eq!(total, n);
        prop_assert_eq!(&chain.to_map(), assignment.as_map());
    }

    /// Property: rebuilding with the same hint gives the same chain, whatever
    /// order the hint uses.
    #[test]
    fn prop_chain_is_deterministic(
        n in 2usize..30,
        seed in any::<u64>(),
        hint_seed in any::<u64>(),
    ) {
        let eligible = participants(n);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mapping = generate(&eligible, DEFAULT_ATTEMPT_LIMIT, &mut rng).unwrap().into_map();

        let mut hint = eligible.clone();
        let mut hint_rng = ChaCha8Rng::seed_from_u64(hint_seed);
        hint.shuffle(&mut hint_rng);

        let first = build_chain(&mapping, &hint).unwrap();
        let second = build_chain(&mapping, &hint).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first.links()[0].giver, &hint[0]);
        prop_assert_eq!(first.to_map(), mapping);
    }

    /// Property: dropping any stored receiver is reported, never truncated.
    #[test]
    fn prop_missing_entry_is_reported(
        n in 2usize..30,
        seed in any::<u64>(),
        drop_at in any::<prop::sample::Index>(),
    ) {
        let eligible = participants(n);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut mapping: HashMap<String, String> =
            generate(&eligible, DEFAULT_ATTEMPT_LIMIT, &mut rng).unwrap().into_map();
        let dropped = eligible[drop_at.index(n)].clone();
        mapping.remove(&dropped);

        let err = build_chain(&mapping, &eligible).unwrap_err();
        prop_assert!(err.partial().len() < n);
        match err {
            ChainError::MissingReceiver { giver, .. } => prop_assert_eq!(giver, dropped),
            other => prop_assert!(false, "unexpected error: {:?}", other),
        }
    }
}

#[test]
fn three_way_cycle_scenario() {
    let mapping: HashMap<&str, &str> =
        [("A", "B"), ("B", "C"), ("C", "A")].into_iter().collect();
    let chain = build_chain(&mapping, &["A", "B", "C"]).unwrap();
    let pairs: Vec<_> = chain.links().iter().map(|l| (l.giver, l.receiver)).collect();
    assert_eq!(pairs, vec![("A", "B"), ("B", "C"), ("C", "A")]);
    assert_eq!(chain.cycle_count(), 1);
}

#[test]
fn two_swaps_scenario() {
    let mapping: HashMap<&str, &str> =
        [("A", "B"), ("B", "A"), ("C", "D"), ("D", "C")].into_iter().collect();
    let chain = build_chain(&mapping, &["A", "B", "C", "D"]).unwrap();
    let pairs: Vec<_> = chain.links().iter().map(|l| (l.giver, l.receiver)).collect();
    assert_eq!(pairs, vec![("A", "B"), ("B", "A"), ("C", "D"), ("D", "C")]);
    assert_eq!(chain.cycle_count(), 2);
}
