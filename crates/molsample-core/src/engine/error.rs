use super::config::ConfigError;
use super::dependency::DependencyError;
use super::transaction::TransactionError;
use super::utils::sampling::SamplingError;
use crate::core::models::store::StoreError;
use crate::core::scoring::registry::RegistryError;
use crate::core::scoring::restraint::ScoringError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Energy scoring failed: {source}")]
    Scoring {
        #[from]
        source: ScoringError,
    },

    #[error("Restraint registry error: {source}")]
    Registry {
        #[from]
        source: RegistryError,
    },

    #[error("Dependency analysis failed: {source}")]
    Dependency {
        #[from]
        source: DependencyError,
    },

    #[error("Attribute store error: {source}")]
    Store {
        #[from]
        source: StoreError,
    },

    #[error("Transaction error: {source}")]
    Transaction {
        #[from]
        source: TransactionError,
    },

    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Sampling failed: {source}")]
    Sampling {
        #[from]
        source: SamplingError,
    },

    #[error(
        "Incremental score {incremental} disagrees with full evaluation {full} (difference {difference:e})"
    )]
    CacheDesync {
        incremental: f64,
        full: f64,
        difference: f64,
    },

    #[error("Model structure changed since the scoring function was built")]
    StructureChanged,

    #[error("Mover '{mover}' failed: {reason}")]
    Mover { mover: String, reason: String },

    #[error("Internal logic error: {0}")]
    Internal(String),
}
