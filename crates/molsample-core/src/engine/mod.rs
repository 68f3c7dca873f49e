//! # Engine Module
//!
//! The scoring and sampling engine: a [`model::Model`] bundling entities and restraints,
//! an [`incremental::IncrementalScoringFunction`] that re-scores only what a proposal can
//! affect, and the pieces the sampling workflows are built from.
//!
//! ## Architecture
//!
//! - **Model** ([`model`]) - Key registry, attribute store and restraint registry, plus full evaluation
//! - **Dependency Analysis** ([`dependency`]) - Score-state ordering and entity-to-term reachability
//! - **Proximity** ([`proximity`], [`pair_cache`]) - Slack-tolerant spatial index and cached close pairs
//! - **Incremental Scoring** ([`incremental`], [`transaction`]) - Cached scores with commit/rollback
//! - **Movers** ([`movers`]) - Proposal generators used by the Monte Carlo workflow
//! - **Configuration** ([`config`]) - Sampler, scoring and minimizer settings, loadable from TOML
//! - **State Tracking** ([`state`]) - Solutions, sampler phases and statistics
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress reporting
//! - **Error Handling** ([`error`]) - Engine-level error aggregation

pub mod config;
pub mod dependency;
pub mod error;
pub mod incremental;
pub mod model;
pub mod movers;
pub mod pair_cache;
pub mod progress;
pub mod proximity;
pub mod state;
pub mod transaction;
pub mod utils;
