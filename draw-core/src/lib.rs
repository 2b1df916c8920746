//! Gift-exchange draw core: derangement generation and cycle chain reconstruction.
//!
//! [`generate`] turns an eligible list of participants into an [`Assignment`]
//! where nobody gives to themselves. [`build_chain`] orders any giver→receiver
//! mapping into closed cycles so links can be disclosed one at a time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

mod chain;
mod derangement;

pub use chain::build_chain;
pub use derangement::{generate, DerangementGenerator, DEFAULT_ATTEMPT_LIMIT};

pub type ParticipantId = String;

/// A fixed-point-free permutation of an eligible set.
///
/// Only [`generate`] constructs one, so every value upholds totality,
/// bijectivity and the no-self-assignment rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment<T: Eq + Hash> {
    order: Vec<T>,
    receivers: HashMap<T, T>,
}

impl<T: Clone + Eq + Hash> Assignment<T> {
    pub(crate) fn from_parts(order: Vec<T>, receivers: HashMap<T, T>) -> Self {
        Self { order, receivers }
    }

    pub fn receiver_of(&self, giver: &T) -> Option<&T> {
        self.receivers.get(giver)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Givers in the order the eligible set was supplied.
    pub fn givers(&self) -> &[T] {
        &self.order
    }

    /// Pairs in eligible order.
    pub fn iter(&self) -> impl Iterator<Item = (&T, &T)> + '_ {
        self.order
            .iter()
            .filter_map(move |giver| self.receivers.get(giver).map(|r| (giver, r)))
    }

    pub fn as_map(&self) -> &HashMap<T, T> {
        &self.receivers
    }

    pub fn into_map(self) -> HashMap<T, T> {
        self.receivers
    }
}

impl<T: Clone + Eq + Hash + fmt::Debug> Assignment<T> {
    /// Cycle chain using the eligible order as the hint. Never fails for a
    /// generated assignment.
    pub fn chain(&self) -> Result<Chain<T>, ChainError<T>> {
        build_chain(&self.receivers, &self.order)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainLink<T> {
    pub giver: T,
    pub receiver: T,
}

/// Links in discovery order, partitioned into cycles.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Chain<T> {
    links: Vec<ChainLink<T>>,
    // exclusive end index of each closed cycle
    cycle_ends: Vec<usize>,
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            cycle_ends: Vec::new(),
        }
    }
}

impl<T> Chain<T> {
    pub(crate) fn push(&mut self, giver: T, receiver: T) {
        self.links.push(ChainLink { giver, receiver });
    }

    pub(crate) fn close_cycle(&mut self) {
        let start = self.cycle_ends.last().copied().unwrap_or(0);
        if self.links.len() > start {
            self.cycle_ends.push(self.links.len());
        }
    }

    pub fn links(&self) -> &[ChainLink<T>] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn cycle_count(&self) -> usize {
        self.cycle_ends.len()
    }

    /// One slice per closed cycle. Links after the last closed cycle (only
    /// present in a partial chain) are not yielded.
    pub fn cycles(&self) -> impl Iterator<Item = &[ChainLink<T>]> + '_ {
        let mut start = 0;
        self.cycle_ends.iter().map(move |&end| {
            let cycle = &self.links[start..end];
            start = end;
            cycle
        })
    }

    pub fn into_links(self) -> Vec<ChainLink<T>> {
        self.links
    }
}

impl<T: Clone + Eq + Hash> Chain<T> {
    /// Replays the links into a giver→receiver mapping.
    pub fn to_map(&self) -> HashMap<T, T> {
        self.links
            .iter()
            .map(|link| (link.giver.clone(), link.receiver.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DrawError {
    #[error("need at least two eligible participants, got {len}")]
    InvalidInputSize { len: usize },
    #[error("participant at position {index} appears more than once")]
    DuplicateParticipant { index: usize },
    #[error("no valid derangement found after {attempts} attempts")]
    NoValidDerangement { attempts: usize },
}

impl DrawError {
    /// A fresh call to [`generate`] may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DrawError::NoValidDerangement { .. })
    }
}

/// The mapping handed to [`build_chain`] is not a derangement of its domain.
/// Every variant carries the links recovered before the fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError<T: fmt::Debug> {
    #[error("inconsistent mapping: {giver:?} has no recorded receiver")]
    MissingReceiver { giver: T, partial: Chain<T> },
    #[error("inconsistent mapping: {giver:?} gives to {receiver:?}, which is outside the domain")]
    UnknownReceiver {
        giver: T,
        receiver: T,
        partial: Chain<T>,
    },
    #[error("inconsistent mapping: giver {giver:?} is outside the domain")]
    UnknownGiver { giver: T, partial: Chain<T> },
    #[error("inconsistent mapping: {giver:?} is assigned to themselves")]
    SelfAssigned { giver: T, partial: Chain<T> },
    #[error(
        "inconsistent mapping: {giver:?} gives to {receiver:?}, who already receives from someone else"
    )]
    OpenCycle {
        giver: T,
        receiver: T,
        partial: Chain<T>,
    },
}

impl<T: fmt::Debug> ChainError<T> {
    pub fn partial(&self) -> &Chain<T> {
        match self {
            ChainError::MissingReceiver { partial, .. }
            | ChainError::UnknownReceiver { partial, .. }
            | ChainError::UnknownGiver { partial, .. }
            | ChainError::SelfAssigned { partial, .. }
            | ChainError::OpenCycle { partial, .. } => partial,
        }
    }

    pub fn into_partial(self) -> Chain<T> {
        match self {
            ChainError::MissingReceiver { partial, .. }
            | ChainError::UnknownReceiver { partial, .. }
            | ChainError::UnknownGiver { partial, .. }
            | ChainError::SelfAssigned { partial, .. }
            | ChainError::OpenCycle { partial, .. } => partial,
        }
    }
}
