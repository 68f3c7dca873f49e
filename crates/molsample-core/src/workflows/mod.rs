//! # Workflows Module
//!
//! Complete procedures built on the engine. Each workflow validates its configuration,
//! reports progress through a [`ProgressReporter`](crate::engine::progress::ProgressReporter)
//! where it runs long, and returns a result summarizing what happened.
//!
//! - **Monte Carlo** ([`monte_carlo`]) - Metropolis sampling with incremental scoring,
//!   optional simulated annealing, periodic gradient refinement and best-state tracking.
//! - **Minimization** ([`minimize`]) - Adaptive steepest descent on full derivatives.

pub mod minimize;
pub mod monte_carlo;
