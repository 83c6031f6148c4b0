//! # Chainstate
//!
//! Chain-state engine for a Bitcoin-style full node.
//!
//! This crate decides, for every block a node receives, whether it is valid,
//! where it attaches, and whether it moves the active chain. It keeps the
//! heaviest valid chain active, parks blocks whose parent is not known yet,
//! reorganizes when a side branch overtakes the tip, and notifies listeners
//! of every block and transaction that enters or leaves the active chain.
//!
//! ## Architecture
//!
//! - Consensus rules: [`transaction`], [`block`], [`economic`], [`pow`], [`script`]
//! - Chain model: [`pending`], [`cache`], [`fork`], [`reorganization`], [`locator`]
//! - Collaborator seams: [`storage::ChainStore`], [`script::ScriptVerifier`], [`events`]
//! - Orchestration: [`chain::BlockChain`]
//!
//! ## Design Principles
//!
//! 1. **Pure Rules**: consensus checks are deterministic functions of their inputs
//! 2. **Serialized Commits**: one block at a time moves through the pipeline
//! 3. **Exact Version Pinning**: consensus-critical cryptography is pinned to exact versions
//! 4. **Storage Is A Seam**: persistence lives behind an async trait
//!
//! ## Usage
//!
//! ```rust
//! use chainstate::{BlockChain, ChainParams};
//! use chainstate::script::AcceptAllVerifier;
//! use chainstate::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! let chain = BlockChain::new(
//!     ChainParams::unitnet(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(AcceptAllVerifier),
//! )
//! .unwrap();
//!
//! let top = runtime.block_on(chain.init()).unwrap();
//! assert_eq!(top.height, 0);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod pow;
pub mod transaction;
pub mod script;
pub mod block;
pub mod economic;
pub mod cache;
pub mod storage;
pub mod events;
pub mod pending;
pub mod fork;
pub mod reorganization;
pub mod locator;
pub mod config;
pub mod chain;

// Re-export commonly used types
pub use types::*;
pub use chain::BlockChain;
pub use config::ChainParams;
pub use error::{ChainError, Result};
pub use events::{ChainEvent, EventKey};
pub use pending::{BlockMode, SubmitOutcome};
pub use pow::U256;
pub use storage::{ChainStore, MemoryStore, StorageError};
