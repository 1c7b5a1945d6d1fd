//! Command Module
//!
//! Turns parsed requests into replies.
//!
//! ```text
//! Vec<Bytes> (argv)
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  lookup + arity check (table)
//! └────────┬────────┘
//!          │
//!     ┌────┴─────┐
//!     ▼          ▼
//!   host        mdb        PING, INFO, SAVE, ...  /  MMGET, MMSET, ...
//!                │
//!                ▼
//!          MdbStore (storage module)
//! ```
//!
//! ## Supported Commands
//!
//! ### MDB layer
//! - `MMGET`, `MMSET`, `MMDEL`, `MMEXISTS`, `MMTYPE`, `MMSTRLEN`
//! - `MMINCRBY`, `MMAPPEND`, `MMGETRANGE`
//! - `MMEXPIRE`, `MMPEXPIRE`, `MMEXPIREAT`, `MMPEXPIREAT`, `MMTTL`, `MMPTTL`
//! - `MMKEYS`, `MMDBSIZE`, `MMINFO`, `MMFLUSHDB`, `MMDEBUG OBJECT`
//!
//! ### Server
//! - `PING`, `ECHO`, `QUIT`, `COMMAND`, `INFO`, `DBSIZE`, `SAVE`, `ROLE`

pub mod glob;
pub mod handler;
pub mod host;
pub mod mdb;
pub mod table;

pub use handler::{CommandHandler, Context, Outcome};
pub use table::{CommandKind, CommandSpec, CommandTable};
