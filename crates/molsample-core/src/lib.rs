//! # molsample Core Library
//!
//! An incremental scoring and stochastic sampling engine for restraint-based modeling of
//! molecular structures.
//!
//! A mutable set of point-like entities carrying typed attributes (positions, radii, flags)
//! is scored by a composable set of restraints. Optimizers drive that score down or sample
//! from it. The central piece is the
//! [`IncrementalScoringFunction`](engine::incremental::IncrementalScoringFunction), which
//! re-scores only what a small perturbation can affect, keeps a dynamic proximity index for
//! short-range pair terms, and can roll a rejected proposal back exactly.
//!
//! ## Architectural Philosophy
//!
//! - **[`core`]: The Foundation.** Entities, attribute keys, the attribute store, the
//!   restraint and score-state abstractions, and the restraint registry.
//!
//! - **[`engine`]: The Logic Core.** The model, the dependency graph, the proximity index
//!   and pair cache, the incremental scoring function with its transaction records, movers,
//!   configuration and errors.
//!
//! - **[`workflows`]: The Public API.** Complete procedures built on the engine: Metropolis
//!   Monte Carlo sampling with optional refinement, and steepest-descent minimization.

pub mod core;
pub mod engine;
pub mod workflows;
