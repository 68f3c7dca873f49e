//! # Core Module
//!
//! This module provides the fundamental building blocks of the modeling engine: the
//! representation of entities and their attributes, and the pure scoring pieces that
//! read them.
//!
//! ## Architecture
//!
//! - **Data Models** ([`models`]) - Entity handles, interned attribute keys, decorations
//!   and the [`AttributeStore`](models::store::AttributeStore) that owns all current state
//! - **Scoring** ([`scoring`]) - The restraint abstraction, pair scores, score states,
//!   derivative accumulation and the restraint registry (arena)
//! - **Utilities** ([`utils`]) - Geometric helpers shared by scores and movers
//!
//! Nothing in this module keeps caches between evaluations. Incremental bookkeeping
//! lives in the [`engine`](crate::engine).

pub mod models;
pub mod scoring;
pub mod utils;
