//! # Scoring Module
//!
//! The stateless side of scoring: what a restraint is, how derivatives are collected, the
//! generic pair scores and restraints used to build models, score states that maintain
//! derived entities, and the [`registry`] arena that owns all of them.
//!
//! Weights are applied by the caller. A restraint always reports its unweighted score and
//! receives a [`DerivativeAccumulator`](derivatives::DerivativeAccumulator) that already
//! carries the effective weight of the path it was reached through.

pub mod derivatives;
pub mod pair_scores;
pub mod registry;
pub mod restraint;
pub mod restraints;
pub mod score_state;
