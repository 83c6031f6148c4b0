//! Error types for chain-state processing

use crate::storage::StorageError;
use crate::types::{display_hash, Hash};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// A block or transaction breaks a protocol rule. Never retried.
    #[error("Consensus rule violation: {0}")]
    ConsensusViolation(String),

    /// A referenced transaction is not known yet. The caller may retry once
    /// `hash` has been seen.
    #[error("Source transaction {} not found", display_hash(.hash))]
    MissingSource { hash: Hash },

    #[error("Disconnected fork: {0}")]
    DisconnectedFork(String),

    #[error("Reorganization failed: {0}")]
    ReorgFailed(Box<ChainError>),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Parent block {} was rejected", display_hash(.parent))]
    ParentRejected { parent: Hash },

    #[error("Block ingestion halted after a fatal error")]
    Halted,

    #[error("Chain not initialized")]
    NotInitialized,
}

impl ChainError {
    /// Errors after which chain state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::DisconnectedFork(_) | ChainError::ReorgFailed(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::MissingSource { .. })
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        ChainError::ConsensusViolation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
