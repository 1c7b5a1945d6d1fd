//! Command Dispatcher
//!
//! [`CommandHandler`] turns one parsed request into one [`Reply`]:
//!
//! ```text
//! argv ──> table lookup ──> arity check ──> handler(ctx, argv, reply)
//!                                                 │
//!                                     expired keys seen by readers
//!                                                 │
//!                                                 ▼
//!                                   MdbStore::expire_lazily (MMDEL)
//! ```
//!
//! The server state is locked for the duration of one command. Handlers run
//! synchronously and never hold the lock across client I/O.

use crate::commands::table::{CommandKind, CommandTable};
use crate::protocol::Reply;
use crate::server::{lock, ServerState, SharedState};
use crate::storage::store::{now_ms, Host};
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// Everything a command handler may touch.
pub struct Context<'a> {
    pub state: &'a mut ServerState,
    pub table: &'a CommandTable,
    /// Clock reading taken once per command.
    pub now_ms: i64,
    expired: Vec<Bytes>,
    quit: bool,
}

impl<'a> Context<'a> {
    pub fn new(state: &'a mut ServerState, table: &'a CommandTable, now_ms: i64) -> Self {
        Self {
            state,
            table,
            now_ms,
            expired: Vec::new(),
            quit: false,
        }
    }

    /// Records a key found past its expiration, for lazy deletion once the
    /// command's own transaction is over.
    pub fn note_expired(&mut self, key: &Bytes) {
        self.expired.push(key.clone());
    }

    /// Asks the connection to close after the reply is sent.
    pub fn request_quit(&mut self) {
        self.quit = true;
    }
}

/// Outcome of executing one request.
#[derive(Debug, Default)]
pub struct Outcome {
    pub reply: Reply,
    /// The client asked to close the connection.
    pub quit: bool,
}

/// Dispatches commands against the shared server state.
#[derive(Clone)]
pub struct CommandHandler {
    state: SharedState,
    table: Arc<CommandTable>,
}

impl CommandHandler {
    pub fn new(state: SharedState) -> Self {
        let enabled = lock(&state).store.is_enabled();
        Self {
            state,
            table: Arc::new(CommandTable::new(enabled)),
        }
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Executes one request.
    pub fn execute(&self, argv: &[Bytes]) -> Outcome {
        let mut state = lock(&self.state);
        execute_on(&mut state, &self.table, argv, now_ms())
    }
}

/// Executes one request against already-locked state at a given time.
pub fn execute_on(
    state: &mut ServerState,
    table: &CommandTable,
    argv: &[Bytes],
    now_ms: i64,
) -> Outcome {
    let mut reply = Reply::new();

    let Some(name) = argv.first() else {
        reply.error("ERR empty command");
        return Outcome { reply, quit: false };
    };

    let Some(spec) = table.lookup(name) else {
        reply.error(format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(name)
        ));
        return Outcome { reply, quit: false };
    };

    if !spec.accepts(argv.len()) {
        reply.error(format!(
            "ERR wrong number of arguments for '{}' command",
            spec.name
        ));
        return Outcome { reply, quit: false };
    }

    if state.loading && !spec.loading_ok {
        reply.error(LOADING);
        return Outcome { reply, quit: false };
    }

    trace!(command = spec.name, argc = argv.len(), "Dispatching command");

    let dirty_before = state.host.dirty();
    let mut ctx = Context::new(state, table, now_ms);
    (spec.handler)(&mut ctx, argv, &mut reply);

    let Context {
        state,
        expired,
        quit,
        ..
    } = ctx;
    let ServerState { store, host, .. } = state;
    match spec.kind {
        CommandKind::ReadOnly if !expired.is_empty() => store.expire_lazily(&expired, host),
        // Writes that changed the dataset are fed to replicas as sent.
        CommandKind::ReadWrite if host.dirty() > dirty_before => host.propagate(argv.to_vec()),
        _ => {}
    }

    Outcome { reply, quit }
}

pub const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";

pub const LOADING: &str = "LOADING flashmdb is loading the dataset in memory";

/// Parses a signed 64-bit integer argument the way Redis does: plain
/// decimal, optional minus sign, no leading zeros, spaces or `-0`.
pub fn parse_i64(arg: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(arg).ok()?;
    let negative = text.starts_with('-');
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
        || (digits.starts_with('0') && (digits.len() > 1 || negative))
    {
        return None;
    }
    text.parse().ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::ConnectionStats;
    use crate::protocol::RespValue;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::store::{MdbConfig, MdbStore};

    pub fn make_command(args: &[&str]) -> Vec<Bytes> {
        args.iter().map(|s| Bytes::from(s.to_string())).collect()
    }

    pub fn create_state_with(mdb: MdbConfig) -> ServerState {
        let store = MdbStore::open(mdb.clone(), Box::new(MemoryBackend::new())).unwrap();
        let config = Config {
            mdb,
            ..Config::default()
        };
        ServerState::new(config, store, Arc::new(ConnectionStats::new()))
    }

    pub fn create_state() -> ServerState {
        create_state_with(MdbConfig::default())
    }

    /// Runs one command at a fixed time and returns its single reply value.
    pub fn run_at(state: &mut ServerState, now_ms: i64, args: &[&str]) -> RespValue {
        let table = CommandTable::new(state.store.is_enabled());
        let outcome = execute_on(state, &table, &make_command(args), now_ms);
        outcome
            .reply
            .into_single()
            .unwrap_or_else(|| panic!("{:?} did not produce exactly one value", args))
    }

    #[test]
    fn test_unknown_command() {
        let mut state = create_state();
        let response = run_at(&mut state, 0, &["NOPE"]);
        assert_eq!(response, RespValue::error("ERR unknown command 'NOPE'"));
    }

    #[test]
    fn test_wrong_arity() {
        let mut state = create_state();
        let response = run_at(&mut state, 0, &["MMGET"]);
        assert_eq!(
            response,
            RespValue::error("ERR wrong number of arguments for 'mmget' command")
        );
    }

    #[test]
    fn test_disabled_layer_hides_mm_commands() {
        let mut state = create_state_with(MdbConfig {
            enabled: false,
            ..Default::default()
        });
        let response = run_at(&mut state, 0, &["MMGET", "k"]);
        assert_eq!(response, RespValue::error("ERR unknown command 'MMGET'"));
        assert_eq!(run_at(&mut state, 0, &["PING"]), RespValue::simple_string("PONG"));
    }

    #[test]
    fn test_loading_refuses_keyspace_commands() {
        let mut state = create_state();
        run_at(&mut state, 0, &["MMSET", "k", "v"]);
        state.loading = true;

        assert_eq!(run_at(&mut state, 0, &["MMGET", "k"]), RespValue::error(LOADING));
        assert_eq!(run_at(&mut state, 0, &["MMSET", "k", "w"]), RespValue::error(LOADING));
        assert_eq!(run_at(&mut state, 0, &["DBSIZE"]), RespValue::error(LOADING));
        assert_eq!(run_at(&mut state, 0, &["PING"]), RespValue::simple_string("PONG"));
        assert_eq!(state.host.dirty(), 1);

        state.loading = false;
        assert_eq!(
            run_at(&mut state, 0, &["MMGET", "k"]),
            RespValue::bulk_string(Bytes::from("v"))
        );
    }

    #[test]
    fn test_handler_shares_state() {
        let state = crate::server::shared(create_state());
        let handler = CommandHandler::new(Arc::clone(&state));
        let other = handler.clone();

        let out = handler.execute(&make_command(&["MMSET", "k", "v"]));
        assert_eq!(out.reply.into_single(), Some(RespValue::ok()));
        let out = other.execute(&make_command(&["MMGET", "k"]));
        assert_eq!(
            out.reply.into_single(),
            Some(RespValue::bulk_string(Bytes::from("v")))
        );
    }

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64(b"42"), Some(42));
        assert_eq!(parse_i64(b"-7"), Some(-7));
        assert_eq!(parse_i64(b"0"), Some(0));
        assert_eq!(parse_i64(b"007"), None);
        assert_eq!(parse_i64(b"-0"), None);
        assert_eq!(parse_i64(b"-"), None);
        assert_eq!(parse_i64(b"+1"), None);
        assert_eq!(parse_i64(b"1.5"), None);
        assert_eq!(parse_i64(b"9223372036854775808"), None);
    }
}
