//! # LedgerKV
//!
//! A replicated key-value store:
//! - Raft (tikv/raft-rs) orders every command in a replicated log
//! - Each node applies the log to a local WAL + MemTable + SSTable engine
//! - Snapshots of the engine compact the log and catch up new members
//! - TCP client protocol for data and membership operations
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TCP Server                              │
//! │                  (Multiple Clients)                          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │               StoreApi / ClusterApi                          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ propose / conf change
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │              Raft worker (RawNode)  ◄──► peers               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ committed entries, in order
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │        KvStateMachine → StoreAdapter → Engine                │
//! └─────────────────────┬───────────────────────────────────────┘
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     WAL     │          │  MemTable   │
//!   │  (Append)   │          │  (RwLock)   │
//!   └─────────────┘          └──────┬──────┘
//!                                   ▼
//!                           ┌─────────────┐
//!                           │   Storage   │
//!                           │  (SSTable)  │
//!                           └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod engine;
pub mod memtable;
pub mod storage;
pub mod wal;

pub mod api;
pub mod consensus;
pub mod fsm;
pub mod network;
pub mod protocol;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use engine::Engine;
pub use error::{LedgerError, Result};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of LedgerKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
