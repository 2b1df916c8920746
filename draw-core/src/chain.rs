use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use tracing::debug;

use crate::{Chain, ChainError};

/// Orders a giver→receiver mapping into closed cycles for step-by-step disclosure.
///
/// `order_hint` is the domain. Each cycle starts at the first identifier in
/// the hint that has not been visited yet, so the output only depends on the
/// mapping and the hint. Any mapping that is not a derangement of the hint
/// fails with the links recovered up to the fault.
pub fn build_chain<T>(
    mapping: &HashMap<T, T>,
    order_hint: &[T],
) -> Result<Chain<T>, ChainError<T>>
where
    T: Clone + Eq + Hash + Debug,
{
    let domain: HashSet<&T> = order_hint.iter().collect();
    let mut visited: HashSet<&T> = HashSet::with_capacity(domain.len());
    let mut chain = Chain::default();

    for start in order_hint {
        if visited.contains(start) {
            continue;
        }

        let mut current = start;
        loop {
            visited.insert(current);

            let Some(receiver) = mapping.get(current) else {
                return Err(ChainError::MissingReceiver {
                    giver: current.clone(),
                    partial: chain,
                });
            };
            if !domain.contains(receiver) {
                return Err(ChainError::UnknownReceiver {
                    giver: current.clone(),
                    receiver: receiver.clone(),
                    partial: chain,
                });
            }
            if receiver == current {
                return Err(ChainError::SelfAssigned {
                    giver: current.clone(),
                    partial: chain,
                });
            }
            if receiver != start && visited.contains(receiver) {
                return Err(ChainError::OpenCycle {
                    giver: current.clone(),
                    receiver: receiver.clone(),
                    partial: chain,
                });
            }

            chain.push(current.clone(), receiver.clone());
            if receiver == start {
                chain.close_cycle();
                break;
            }
            current = receiver;
        }
    }

    // Every domain member now has a link; anything left over in the mapping
    // was never reachable from the hint.
    if mapping.len() > chain.len() {
        if let Some(giver) = mapping.keys().find(|giver| !domain.contains(giver)) {
            return Err(ChainError::UnknownGiver {
                giver: giver.clone(),
                partial: chain,
            });
        }
    }

    debug!(
        links = chain.len(),
        cycles = chain.cycle_count(),
        "cycle chain built"
    );
    Ok(chain)
}
