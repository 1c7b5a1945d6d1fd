//! Command Table
//!
//! Every command the server understands is one [`CommandSpec`] row: its
//! name, arity, kind and handler. The dispatcher never matches on command
//! names; it looks the row up here.
//!
//! Arity follows the Redis convention: a positive value is the exact
//! argument count including the command name, a negative value `-n` means
//! "at least `n`".

use crate::commands::handler::Context;
use crate::commands::{host, mdb};
use crate::protocol::Reply;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Signature shared by all command handlers. `argv[0]` is the command name.
pub type Handler = fn(&mut Context<'_>, &[Bytes], &mut Reply);

/// What a command does to the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Reads only; may trigger lazy expiry of what it finds.
    ReadOnly,
    /// Runs in a read-write transaction.
    ReadWrite,
    /// Server-level command outside the keyspace.
    Admin,
}

impl CommandKind {
    /// Flag reported by COMMAND.
    pub fn flag(&self) -> &'static str {
        match self {
            CommandKind::ReadOnly => "readonly",
            CommandKind::ReadWrite => "write",
            CommandKind::Admin => "admin",
        }
    }
}

/// One row of the command table.
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: i32,
    pub kind: CommandKind,
    /// Part of the MDB layer; dropped from the table when it is disabled.
    pub mdb: bool,
    /// May run while the persistence file is still loading.
    pub loading_ok: bool,
    pub handler: Handler,
}

impl CommandSpec {
    const fn host(name: &'static str, arity: i32, kind: CommandKind, handler: Handler) -> Self {
        Self {
            name,
            arity,
            kind,
            mdb: false,
            loading_ok: false,
            handler,
        }
    }

    const fn mdb(name: &'static str, arity: i32, kind: CommandKind, handler: Handler) -> Self {
        Self {
            name,
            arity,
            kind,
            mdb: true,
            loading_ok: false,
            handler,
        }
    }

    const fn loading_ok(mut self) -> Self {
        self.loading_ok = true;
        self
    }

    /// Returns true if `argc` arguments (name included) satisfy the arity.
    pub fn accepts(&self, argc: usize) -> bool {
        let arity = self.arity.unsigned_abs() as usize;
        if self.arity >= 0 {
            argc == arity
        } else {
            argc >= arity
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("kind", &self.kind)
            .field("mdb", &self.mdb)
            .field("loading_ok", &self.loading_ok)
            .finish()
    }
}

use CommandKind::{Admin, ReadOnly, ReadWrite};

/// Every command known to the server.
pub static COMMANDS: &[CommandSpec] = &[
    // Host
    CommandSpec::host("ping", -1, Admin, host::ping).loading_ok(),
    CommandSpec::host("echo", 2, Admin, host::echo).loading_ok(),
    CommandSpec::host("quit", 1, Admin, host::quit).loading_ok(),
    CommandSpec::host("command", -1, Admin, host::command).loading_ok(),
    CommandSpec::host("save", 1, Admin, host::save),
    CommandSpec::host("dbsize", 1, ReadOnly, host::dbsize),
    CommandSpec::host("info", -1, Admin, host::info).loading_ok(),
    CommandSpec::host("role", 1, Admin, host::role).loading_ok(),
    // MDB layer
    CommandSpec::mdb("mmget", 2, ReadOnly, mdb::get),
    CommandSpec::mdb("mmset", -3, ReadWrite, mdb::set),
    CommandSpec::mdb("mmdel", -2, ReadWrite, mdb::del),
    CommandSpec::mdb("mmexists", 2, ReadOnly, mdb::exists),
    CommandSpec::mdb("mmtype", 2, ReadOnly, mdb::type_of),
    CommandSpec::mdb("mmstrlen", 2, ReadOnly, mdb::strlen),
    CommandSpec::mdb("mmincrby", 3, ReadWrite, mdb::incrby),
    CommandSpec::mdb("mmttl", 2, ReadOnly, mdb::ttl),
    CommandSpec::mdb("mmpttl", 2, ReadOnly, mdb::pttl),
    CommandSpec::mdb("mmexpire", 3, ReadWrite, mdb::expire),
    CommandSpec::mdb("mmexpireat", 3, ReadWrite, mdb::expireat),
    CommandSpec::mdb("mmpexpire", 3, ReadWrite, mdb::pexpire),
    CommandSpec::mdb("mmpexpireat", 3, ReadWrite, mdb::pexpireat),
    CommandSpec::mdb("mmappend", 3, ReadWrite, mdb::append),
    CommandSpec::mdb("mmgetrange", 4, ReadOnly, mdb::getrange),
    CommandSpec::mdb("mmkeys", 2, ReadOnly, mdb::keys),
    CommandSpec::mdb("mmdbsize", 1, ReadOnly, mdb::dbsize),
    CommandSpec::mdb("mminfo", 1, ReadOnly, mdb::info),
    CommandSpec::mdb("mmflushdb", 1, ReadWrite, mdb::flushdb),
    CommandSpec::mdb("mmdebug", -2, ReadOnly, mdb::debug),
];

/// The commands available in this server instance, keyed by lowercase name.
#[derive(Debug, Clone)]
pub struct CommandTable {
    commands: HashMap<&'static str, &'static CommandSpec>,
}

impl CommandTable {
    /// Builds the table. With the MDB layer disabled its commands are left
    /// out, so clients get "unknown command" for them.
    pub fn new(mdb_enabled: bool) -> Self {
        let commands = COMMANDS
            .iter()
            .filter(|spec| mdb_enabled || !spec.mdb)
            .map(|spec| (spec.name, spec))
            .collect();
        Self { commands }
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, name: &[u8]) -> Option<&'static CommandSpec> {
        let name = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
        self.commands.get(name.as_str()).copied()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Rows sorted by name.
    pub fn specs(&self) -> Vec<&'static CommandSpec> {
        let mut specs: Vec<_> = self.commands.values().copied().collect();
        specs.sort_by_key(|spec| spec.name);
        specs
    }
}
