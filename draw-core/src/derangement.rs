use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tracing::{debug, warn};

use crate::{Assignment, DrawError};

pub const DEFAULT_ATTEMPT_LIMIT: usize = 100;

/// Rejection-sampling derangement generator with a bounded number of shuffles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerangementGenerator {
    attempt_limit: usize,
}

impl Default for DerangementGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_LIMIT)
    }
}

impl DerangementGenerator {
    pub fn new(attempt_limit: usize) -> Self {
        Self { attempt_limit }
    }

    pub fn attempt_limit(&self) -> usize {
        self.attempt_limit
    }

    pub fn generate<T, R>(
        &self,
        eligible: &[T],
        rng: &mut R,
    ) -> Result<Assignment<T>, DrawError>
    where
        T: Clone + Eq + Hash,
        R: Rng + ?Sized,
    {
        generate(eligible, self.attempt_limit, rng)
    }
}

/// Draws a giver→receiver assignment over `eligible` with no self-assignment.
///
/// Each attempt is a full Fisher-Yates shuffle of the eligible list; the first
/// shuffle that moves every position is accepted. Input is validated before
/// any randomness is consumed.
pub fn generate<T, R>(
    eligible: &[T],
    attempt_limit: usize,
    rng: &mut R,
) -> Result<Assignment<T>, DrawError>
where
    T: Clone + Eq + Hash,
    R: Rng + ?Sized,
{
    if eligible.len() < 2 {
        return Err(DrawError::InvalidInputSize {
            len: eligible.len(),
        });
    }

    let mut seen = HashSet::with_capacity(eligible.len());
    if let Some(index) = eligible.iter().position(|id| !seen.insert(id)) {
        return Err(DrawError::DuplicateParticipant { index });
    }

    let mut shuffled = eligible.to_vec();
    for attempt in 1..=attempt_limit {
        shuffled.clone_from_slice(eligible);
        shuffle(&mut shuffled, rng);

        if has_fixed_point(eligible, &shuffled) {
            continue;
        }

        debug!(participants = eligible.len(), attempt, "derangement found");
        let receivers: HashMap<T, T> = eligible.iter().cloned().zip(shuffled).collect();
        return Ok(Assignment::from_parts(eligible.to_vec(), receivers));
    }

    warn!(
        participants = eligible.len(),
        attempt_limit, "no derangement within attempt limit"
    );
    Err(DrawError::NoValidDerangement {
        attempts: attempt_limit,
    })
}

fn shuffle<T, R: Rng + ?Sized>(data: &mut [T], rng: &mut R) {
    for i in (1..data.len()).rev() {
        let j = rng.gen_range(0..=i);
        data.swap(i, j);
    }
}

fn has_fixed_point<T: Eq>(original: &[T], shuffled: &[T]) -> bool {
    original.iter().zip(shuffled).any(|(a, b)| a == b)
}
