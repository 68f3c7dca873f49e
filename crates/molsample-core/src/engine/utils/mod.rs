//! Utility functions supporting the sampling workflows.

pub mod sampling;
