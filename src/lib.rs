//! # flashmdb
//!
//! A Redis-compatible server whose keyspace lives in LMDB: a memory-mapped,
//! transactional B+tree on disk. Keys survive restarts, can outgrow RAM and
//! carry Redis-style expirations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              flashmdb                                │
//! │                                                                      │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐               │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │  table-driven │
//! │  │ (main.rs)   │    │  Handler    │    │  Handler    │  dispatch     │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘               │
//! │                                               │ Mutex<ServerState>   │
//! │                                               ▼                      │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐ │
//! │  │   RESP      │    │ MdbStore ── txn ── Engine (LMDB | memory)    │ │
//! │  │   Parser    │    │    │                                         │ │
//! │  └─────────────┘    │    └── Host: dirty counter, replication log  │ │
//! │                     └──────────────────────────────────────────────┘ │
//! │                                               ▲                      │
//! │                     ┌─────────────────────────┴──────────────────┐   │
//! │                     │ ExpirySweeper (cron at `hz`)               │   │
//! │                     └────────────────────────────────────────────┘   │
//! │                                                                      │
//! │  SAVE / startup load: rdb file with the environment image inside     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP request parsing and reply serialization
//! - [`storage`]: the MDB layer (codec, engines, transactions, expiry, snapshot)
//! - [`commands`]: command table, dispatcher and handlers
//! - [`connection`]: client connection management
//! - [`server`]: shared server state, host bookkeeping, save/load
//! - [`rdb`]: persistence file primitives
//! - [`config`]: command-line configuration
//!
//! ## Expiry
//!
//! Keys with an expiration are removed in two ways:
//! 1. **Lazy**: a command that reads an expired key treats it as absent and
//!    deletes it afterwards
//! 2. **Active**: a cron task scans the keyspace in batches, pacing itself
//!    by how long the batches take
//!
//! Both propagate an `MMDEL` per removed key.

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod rdb;
pub mod server;
pub mod storage;

pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{ParseError, Reply, RequestParser, RespValue};
pub use server::{ServerState, SharedState};
pub use storage::{ExpirySweeper, MdbConfig, MdbStore};

/// Version of flashmdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
