//! Masterswitch - automated failure recovery for hierarchical replication
//! topologies.
//!
//! A replication topology is a directed tree of data-replicating database
//! nodes: a single writable master at the root, optional intermediate
//! relay masters, and leaf replicas. When an external failure analyzer
//! classifies a node as failed, masterswitch decides whether to promote a
//! surviving replica, executes the promotion, rewires the remaining
//! topology, records the outcome and notifies external hooks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       masterswitch                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Dispatcher: routing | serialization | leader gate | probes   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Executors: dead master | intermediate master | co-master     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Selector | Rewirer | Postponed Functions | Record Store      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Collaborators: topology store | consensus | KV | hooks       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use masterswitch::config::RecoveryConfig;
//! use masterswitch::consensus::LocalLog;
//! use masterswitch::hooks::ShellHookRunner;
//! use masterswitch::kv::MemoryKv;
//! use masterswitch::recovery::RecoveryEngine;
//! use masterswitch::topology::MemoryTopology;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> masterswitch::Result<()> {
//!     let config = Arc::new(RecoveryConfig::development());
//!     let engine = Arc::new(RecoveryEngine::new(
//!         config,
//!         Arc::new(MemoryTopology::new()),
//!         Arc::new(MemoryKv::new()),
//!         Arc::new(LocalLog),
//!         Arc::new(ShellHookRunner),
//!     ));
//!     engine.check_and_recover(None, None, false).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consensus;
pub mod error;
pub mod hooks;
pub mod kv;
pub mod observability;
pub mod recovery;
pub mod topology;
pub mod types;

pub use error::{RecoveryError, Result};
pub use recovery::{RecoveryEngine, TopologyRecovery};
