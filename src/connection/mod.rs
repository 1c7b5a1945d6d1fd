//! Client Connections
//!
//! Each accepted TCP connection is served by its own Tokio task running a
//! [`ConnectionHandler`]. All tasks share one [`CommandHandler`] (and so one
//! server state) and one [`ConnectionStats`].
//!
//! ```ignore
//! use flashmdb::commands::CommandHandler;
//! use flashmdb::connection::{handle_connection, ConnectionStats};
//!
//! let handler = CommandHandler::new(state);
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, handler.clone(), stats));
//! ```
//!
//! [`CommandHandler`]: crate::commands::CommandHandler

pub mod handler;

pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, ConnectionStats, StatsSnapshot,
};
